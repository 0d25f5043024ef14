//! Outbound signal path.
//!
//! Producers enqueue [`Signal`]s into a bounded ring; one sender task - the
//! single writer of the data and error publications - drains it. Each Next
//! first clears the demand gate (`sent < min_granted` over live sessions),
//! then goes through the offer retry loop:
//!
//! - `Backpressured` / `AdminAction`: sleep the retry interval, bounded by
//!   the linger timeout, then fail fatally.
//! - `NotConnected`: retry for as long as the registry reports live
//!   sessions; once none remain the frame is dropped and counted.
//! - `Closed` / `MaxPositionExceeded`: fatal immediately.
//!
//! Terminal sequencing falls out of the ring being FIFO: every pending Next
//! drains before the terminal frame. `Complete` travels on the data stream;
//! `Error` goes out on the error stream so it reaches peers that stopped
//! reading data, and the processor's own shutdown then follows from
//! receiving that frame like any other peer's. After a terminal the task
//! lingers before closing its publications.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use riffle_ipc::{Offer, Publication};
use riffle_proto::Frame;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    error::CoreError,
    processor::{SenderMetrics, Shared},
    registry::DemandSnapshot,
};

/// One unit of work for the sender task.
#[derive(Debug)]
pub(crate) enum Signal {
    /// One item to frame and offer.
    Next(Bytes),
    /// Normal terminal.
    Complete,
    /// Failure terminal with its message.
    Error(String),
}

/// The sender task state. Constructed by the processor facade, consumed by
/// [`SignalSender::run`].
pub(crate) struct SignalSender {
    name: String,
    data: Publication,
    errors: Publication,
    ring: mpsc::Receiver<Signal>,
    demand: watch::Receiver<DemandSnapshot>,
    retry: Duration,
    linger: Duration,
    shared: Arc<Shared>,
    metrics: Arc<SenderMetrics>,
    sent: u64,
    buf: Vec<u8>,
}

impl SignalSender {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        data: Publication,
        errors: Publication,
        ring: mpsc::Receiver<Signal>,
        demand: watch::Receiver<DemandSnapshot>,
        retry: Duration,
        linger: Duration,
        shared: Arc<Shared>,
        metrics: Arc<SenderMetrics>,
    ) -> Self {
        Self {
            name,
            data,
            errors,
            ring,
            demand,
            retry,
            linger,
            shared,
            metrics,
            sent: 0,
            buf: Vec::new(),
        }
    }

    /// Drain the ring until a terminal, a fatal error, or shutdown.
    pub(crate) async fn run(mut self) {
        let mut terminal = false;

        loop {
            let signal = tokio::select! {
                s = self.ring.recv() => s,
                () = self.shared.closed() => None,
            };
            let Some(signal) = signal else { break };
            if !self.shared.alive() {
                break;
            }

            match signal {
                Signal::Next(payload) => match self.send_next(payload).await {
                    Ok(()) => {},
                    Err(CoreError::NoSubscribers) => {
                        tracing::debug!(name = %self.name, "next dropped: no live sessions");
                    },
                    Err(e) => {
                        tracing::error!(name = %self.name, error = %e, "sender failed fatally");
                        self.shared.begin_shutdown();
                        break;
                    },
                },
                Signal::Complete => {
                    if let Err(e) = self.send_complete().await {
                        tracing::warn!(name = %self.name, error = %e, "complete frame not delivered");
                    }
                    terminal = true;
                    break;
                },
                Signal::Error(message) => {
                    if let Err(e) = self.send_error(message).await {
                        tracing::warn!(name = %self.name, error = %e, "error frame not delivered");
                    }
                    terminal = true;
                    break;
                },
            }
        }

        if terminal && self.shared.alive() {
            // Linger so peers still draining the stream catch the terminal.
            tokio::select! {
                () = tokio::time::sleep(self.linger) => {},
                () = self.shared.closed() => {},
            }
        }

        self.data.close();
        self.errors.close();
        tracing::debug!(name = %self.name, sent = self.sent, "sender task stopped");
    }

    /// Gate on demand, then offer one Next frame.
    async fn send_next(&mut self, payload: Bytes) -> Result<(), CoreError> {
        loop {
            if !self.shared.alive() {
                return Err(CoreError::PublicationClosed);
            }
            let snapshot = *self.demand.borrow();
            if snapshot.live > 0 && self.sent < snapshot.min_granted {
                break;
            }
            self.metrics.add_retry();
            tokio::select! {
                () = tokio::time::sleep(self.retry) => {},
                () = self.shared.closed() => {},
            }
        }

        self.encode(&Frame::Next { session_id: 0, payload })?;
        self.offer_with_retry(false).await?;
        self.sent += 1;
        self.metrics.add_sent();
        Ok(())
    }

    async fn send_complete(&mut self) -> Result<(), CoreError> {
        self.encode(&Frame::Complete { session_id: 0 })?;
        self.offer_with_retry(false).await?;
        Ok(())
    }

    async fn send_error(&mut self, message: String) -> Result<(), CoreError> {
        self.encode(&Frame::Error { session_id: 0, message: Bytes::from(message.into_bytes()) })?;
        self.offer_with_retry(true).await?;
        Ok(())
    }

    /// Encode into the reusable buffer, checking the transport MTU.
    fn encode(&mut self, frame: &Frame) -> Result<(), CoreError> {
        let len = frame.encoded_len();
        let mtu = self.data.max_message_length();
        if len > mtu {
            return Err(CoreError::ProtocolViolation(format!(
                "frame of {len} bytes exceeds transport MTU {mtu}"
            )));
        }

        self.buf.clear();
        frame.encode(&mut self.buf);
        Ok(())
    }

    /// Offer the encoded buffer with back-pressure-aware retry.
    async fn offer_with_retry(&mut self, on_error_stream: bool) -> Result<u64, CoreError> {
        let start = Instant::now();

        loop {
            if !self.shared.alive() {
                return Err(CoreError::PublicationClosed);
            }

            let outcome = if on_error_stream {
                self.errors.offer(&self.buf)
            } else {
                self.data.offer(&self.buf)
            };

            match outcome {
                Offer::Position(position) => return Ok(position),
                Offer::Backpressured | Offer::AdminAction => {
                    self.metrics.add_retry();
                    let elapsed = start.elapsed();
                    if elapsed >= self.linger {
                        return Err(CoreError::Backpressured { elapsed });
                    }
                },
                Offer::NotConnected => {
                    if self.demand.borrow().live == 0 {
                        self.metrics.add_drop();
                        return Err(CoreError::NoSubscribers);
                    }
                    self.metrics.add_retry();
                },
                Offer::Closed => return Err(CoreError::PublicationClosed),
                Offer::MaxPositionExceeded => return Err(CoreError::MaxPositionExceeded),
            }

            tokio::select! {
                () = tokio::time::sleep(self.retry) => {},
                () = self.shared.closed() => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use riffle_ipc::{DriverConfig, MediaDriver};

    use super::*;
    use crate::registry::DemandSnapshot;

    struct Rig {
        ring: mpsc::Sender<Signal>,
        demand: watch::Sender<DemandSnapshot>,
        data_sub: riffle_ipc::Subscription,
        error_sub: riffle_ipc::Subscription,
        shared: Arc<Shared>,
        metrics: Arc<SenderMetrics>,
        driver: Arc<MediaDriver>,
    }

    fn rig(name: &str) -> Rig {
        let driver = MediaDriver::launch(&DriverConfig {
            name: name.to_string(),
            dir: Some(tempfile_dir(name)),
            ..DriverConfig::default()
        })
        .unwrap();

        let data = driver.add_publication("mem:sender", 1).unwrap();
        let errors = driver.add_publication("mem:sender", 2).unwrap();
        let data_sub = driver.add_subscription("mem:sender", 1).unwrap();
        let error_sub = driver.add_subscription("mem:sender", 2).unwrap();

        let (ring_tx, ring_rx) = mpsc::channel(16);
        let (demand_tx, demand_rx) = watch::channel(DemandSnapshot::default());
        let shared = Shared::new();
        let metrics = Arc::new(SenderMetrics::default());

        let sender = SignalSender::new(
            name.to_string(),
            data,
            errors,
            ring_rx,
            demand_rx,
            Duration::from_millis(1),
            Duration::from_millis(200),
            Arc::clone(&shared),
            Arc::clone(&metrics),
        );
        tokio::spawn(sender.run());

        Rig { ring: ring_tx, demand: demand_tx, data_sub, error_sub, shared, metrics, driver }
    }

    fn tempfile_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("riffle-sender-test-{name}-{}", std::process::id()))
    }

    async fn poll_until(sub: &mut riffle_ipc::Subscription, want: usize) -> Vec<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut frames = Vec::new();
        while frames.len() < want {
            assert!(Instant::now() < deadline, "timed out polling for {want} frames");
            sub.poll(|buf| frames.push(Frame::decode(buf).unwrap()), 16);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        frames
    }

    #[tokio::test]
    async fn next_waits_for_demand() {
        let mut rig = rig("gate");

        rig.ring.send(Signal::Next(Bytes::from_static(b"one"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut early = 0;
        rig.data_sub.poll(|_| early += 1, 16);
        assert_eq!(early, 0, "nothing may be sent before demand arrives");
        assert!(rig.metrics.retries() > 0, "the demand stall counts as retries");

        rig.demand.send(DemandSnapshot { live: 1, min_granted: 1 }).unwrap();
        let frames = poll_until(&mut rig.data_sub, 1).await;
        assert_eq!(frames, vec![Frame::Next { session_id: 0, payload: Bytes::from_static(b"one") }]);

        rig.shared.begin_shutdown();
        rig.driver.force_shutdown();
    }

    #[tokio::test]
    async fn pending_nexts_drain_before_complete() {
        let mut rig = rig("drain");
        rig.demand.send(DemandSnapshot { live: 1, min_granted: 2 }).unwrap();

        rig.ring.send(Signal::Next(Bytes::from_static(b"a"))).await.unwrap();
        rig.ring.send(Signal::Next(Bytes::from_static(b"b"))).await.unwrap();
        rig.ring.send(Signal::Complete).await.unwrap();

        let frames = poll_until(&mut rig.data_sub, 3).await;
        assert_eq!(frames[0], Frame::Next { session_id: 0, payload: Bytes::from_static(b"a") });
        assert_eq!(frames[1], Frame::Next { session_id: 0, payload: Bytes::from_static(b"b") });
        assert_eq!(frames[2], Frame::Complete { session_id: 0 });
        assert_eq!(rig.metrics.sent(), 2);

        rig.shared.begin_shutdown();
        rig.driver.force_shutdown();
    }

    #[tokio::test]
    async fn error_goes_out_on_the_error_stream() {
        let mut rig = rig("errstream");
        rig.demand.send(DemandSnapshot { live: 1, min_granted: 1 }).unwrap();

        rig.ring.send(Signal::Next(Bytes::from_static(b"x"))).await.unwrap();
        rig.ring.send(Signal::Error("boom".to_string())).await.unwrap();

        let data = poll_until(&mut rig.data_sub, 1).await;
        assert!(matches!(data[0], Frame::Next { .. }));

        let errors = poll_until(&mut rig.error_sub, 1).await;
        assert_eq!(
            errors[0],
            Frame::Error { session_id: 0, message: Bytes::from_static(b"boom") }
        );

        rig.shared.begin_shutdown();
        rig.driver.force_shutdown();
    }
}
