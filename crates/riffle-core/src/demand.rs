//! Demand aggregation toward the local upstream.
//!
//! Maps the session registry's snapshot to a single cumulative
//! `Subscription::request` stream. The effective demand is the minimum
//! grant across live sessions - with one session that is simply its
//! demand, with many the sender moves only as fast as the slowest
//! subscriber, bounding buffering. The aggregator never over-requests:
//! it forwards only the delta above what it already requested, and an
//! all-unbounded snapshot forwards [`UNBOUNDED`] exactly once.

use crate::{registry::DemandSnapshot, streams::UNBOUNDED};

/// Tracks cumulative upstream requests for one sender.
#[derive(Debug, Default)]
pub struct DemandAggregator {
    already_requested: u64,
    unbounded_forwarded: bool,
}

impl DemandAggregator {
    /// A fresh aggregator that has requested nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cumulative demand requested from upstream so far.
    #[must_use]
    pub fn already_requested(&self) -> u64 {
        self.already_requested
    }

    /// Absorb a snapshot; returns the additional demand to request
    /// upstream, if any.
    ///
    /// With no live session there is nothing to pull for. Demand already
    /// requested can never be taken back, so a snapshot whose effective
    /// demand dropped (a slow session joined) yields nothing.
    pub fn absorb(&mut self, snapshot: &DemandSnapshot) -> Option<u64> {
        if snapshot.live == 0 {
            return None;
        }

        let effective = snapshot.min_granted;
        if effective == UNBOUNDED {
            if self.unbounded_forwarded {
                return None;
            }
            self.unbounded_forwarded = true;
            self.already_requested = UNBOUNDED;
            return Some(UNBOUNDED);
        }

        if effective > self.already_requested {
            let delta = effective - self.already_requested;
            self.already_requested = effective;
            Some(delta)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(live: usize, min_granted: u64) -> DemandSnapshot {
        DemandSnapshot { live, min_granted }
    }

    #[test]
    fn empty_snapshot_requests_nothing() {
        let mut agg = DemandAggregator::new();
        assert_eq!(agg.absorb(&snap(0, 0)), None);
        assert_eq!(agg.absorb(&snap(0, UNBOUNDED)), None);
    }

    #[test]
    fn unicast_forwards_the_single_sessions_demand() {
        let mut agg = DemandAggregator::new();
        assert_eq!(agg.absorb(&snap(1, 3)), Some(3));
        assert_eq!(agg.absorb(&snap(1, 3)), None);
        assert_eq!(agg.absorb(&snap(1, 7)), Some(4));
    }

    #[test]
    fn never_over_requests_when_minimum_drops() {
        let mut agg = DemandAggregator::new();
        assert_eq!(agg.absorb(&snap(1, 10)), Some(10));

        // A slow session joins: the minimum falls, nothing is un-requested.
        assert_eq!(agg.absorb(&snap(2, 0)), None);
        assert_eq!(agg.absorb(&snap(2, 4)), None);

        // Only demand above the high-water mark is forwarded.
        assert_eq!(agg.absorb(&snap(2, 12)), Some(2));
        assert_eq!(agg.already_requested(), 12);
    }

    #[test]
    fn unbounded_is_forwarded_exactly_once() {
        let mut agg = DemandAggregator::new();
        assert_eq!(agg.absorb(&snap(2, UNBOUNDED)), Some(UNBOUNDED));
        assert_eq!(agg.absorb(&snap(2, UNBOUNDED)), None);
        assert_eq!(agg.absorb(&snap(3, 5)), None);
    }

    proptest::proptest! {
        #[test]
        fn total_requested_never_exceeds_peak_minimum(
            minimums in proptest::collection::vec(0u64..1_000, 1..64),
        ) {
            let mut agg = DemandAggregator::new();
            let mut total: u64 = 0;
            let mut peak: u64 = 0;

            for minimum in minimums {
                peak = peak.max(minimum);
                if let Some(delta) = agg.absorb(&snap(2, minimum)) {
                    total += delta;
                }
                proptest::prop_assert!(total <= peak, "over-requested: {total} > {peak}");
            }

            proptest::prop_assert_eq!(total, agg.already_requested());
        }
    }

    #[test]
    fn staged_multicast_demand_tracks_the_minimum() {
        let mut agg = DemandAggregator::new();

        // A requested 1, B nothing yet.
        assert_eq!(agg.absorb(&snap(2, 0)), None);
        // B requests 1.
        assert_eq!(agg.absorb(&snap(2, 1)), Some(1));
        // A requests 1 more; min still 1.
        assert_eq!(agg.absorb(&snap(2, 1)), None);
        // B requests 2; min rises to 2.
        assert_eq!(agg.absorb(&snap(2, 2)), Some(1));
    }
}
