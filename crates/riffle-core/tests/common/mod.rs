//! Shared support for the end-to-end scenarios.
#![allow(dead_code)]

use std::{process, sync::Arc, time::Duration};

use bytes::Bytes;
use riffle_core::{Context, CoreError, Subscriber, Subscription};
use riffle_ipc::{DriverConfig, DriverManager};
use tokio::{sync::mpsc, time::Instant};

/// Everything a test subscriber observes, in order.
#[derive(Debug)]
pub enum StreamEvent {
    Subscribed,
    Next(Bytes),
    Error(CoreError),
    Complete,
}

/// Subscriber that records its signals and optionally requests a fixed
/// amount up front.
struct RecordingSubscriber {
    events: mpsc::UnboundedSender<StreamEvent>,
    subscriptions: mpsc::UnboundedSender<Arc<dyn Subscription>>,
    initial_request: u64,
}

impl Subscriber for RecordingSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let _ = self.events.send(StreamEvent::Subscribed);
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
        let _ = self.subscriptions.send(subscription);
    }

    fn on_next(&mut self, item: Bytes) {
        let _ = self.events.send(StreamEvent::Next(item));
    }

    fn on_error(&mut self, error: CoreError) {
        let _ = self.events.send(StreamEvent::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.events.send(StreamEvent::Complete);
    }
}

/// A recording subscriber plus channels for its events and subscription.
pub fn subscriber(
    initial_request: u64,
) -> (
    Box<dyn Subscriber>,
    mpsc::UnboundedReceiver<StreamEvent>,
    mpsc::UnboundedReceiver<Arc<dyn Subscription>>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (subs_tx, subs_rx) = mpsc::unbounded_channel();
    let sub = RecordingSubscriber {
        events: events_tx,
        subscriptions: subs_tx,
        initial_request,
    };
    (Box::new(sub), events_rx, subs_rx)
}

/// Subscriber that pulls in fixed batches: it requests `batch` up front and
/// another `batch` each time one drains, the shape of a slow consumer.
struct BatchingSubscriber {
    events: mpsc::UnboundedSender<StreamEvent>,
    subscription: Option<Arc<dyn Subscription>>,
    batch: u64,
    received_in_batch: u64,
}

impl Subscriber for BatchingSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let _ = self.events.send(StreamEvent::Subscribed);
        subscription.request(self.batch);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, item: Bytes) {
        let _ = self.events.send(StreamEvent::Next(item));
        self.received_in_batch += 1;
        if self.received_in_batch == self.batch {
            self.received_in_batch = 0;
            if let Some(subscription) = &self.subscription {
                subscription.request(self.batch);
            }
        }
    }

    fn on_error(&mut self, error: CoreError) {
        let _ = self.events.send(StreamEvent::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.events.send(StreamEvent::Complete);
    }
}

/// A batching subscriber and its event stream.
pub fn batching_subscriber(
    batch: u64,
) -> (Box<dyn Subscriber>, mpsc::UnboundedReceiver<StreamEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sub = BatchingSubscriber {
        events: events_tx,
        subscription: None,
        batch,
        received_in_batch: 0,
    };
    (Box::new(sub), events_rx)
}

/// A fresh driver manager with a scratch directory of its own, so each
/// scenario runs against an isolated embedded driver.
pub fn test_manager(name: &str) -> Arc<DriverManager> {
    manager_with_window(name, riffle_ipc::DriverConfig::default().term_window)
}

/// Like [`test_manager`] with an explicit in-flight window, for the
/// back-pressure scenario.
pub fn manager_with_window(name: &str, term_window: usize) -> Arc<DriverManager> {
    DriverManager::new(DriverConfig {
        name: name.to_string(),
        term_window,
        retry_shutdown: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        dir: Some(std::env::temp_dir().join(format!("riffle-e2e-{name}-{}", process::id()))),
        ..DriverConfig::default()
    })
}

/// A context with test-friendly timings on a shared channel.
pub fn fast_context(name: &str, channel: &str, manager: &Arc<DriverManager>) -> Context {
    Context {
        sender_channel: channel.to_string(),
        receiver_channel: channel.to_string(),
        publication_retry: Duration::from_millis(2),
        publication_linger_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(600),
        driver: Some(Arc::clone(manager)),
        ..Context::new(name)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Receive the next event within the scenario bound (5s).
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed unexpectedly"),
        Err(_) => panic!("timed out waiting for a stream event"),
    }
}

pub async fn expect_subscribed(events: &mut mpsc::UnboundedReceiver<StreamEvent>) {
    let event = next_event(events).await;
    assert!(matches!(event, StreamEvent::Subscribed), "expected Subscribed, got {event:?}");
}

pub async fn expect_payloads(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    expected: &[&str],
) {
    for want in expected {
        let event = next_event(events).await;
        match event {
            StreamEvent::Next(payload) => {
                assert_eq!(payload.as_ref(), want.as_bytes(), "payload order mismatch");
            },
            other => panic!("expected Next({want:?}), got {other:?}"),
        }
    }
}

pub async fn expect_complete(events: &mut mpsc::UnboundedReceiver<StreamEvent>) {
    let event = next_event(events).await;
    assert!(matches!(event, StreamEvent::Complete), "expected Complete, got {event:?}");
}

/// Assert that nothing arrives for `quiet`.
pub async fn expect_quiet(events: &mut mpsc::UnboundedReceiver<StreamEvent>, quiet: Duration) {
    if let Ok(event) = tokio::time::timeout(quiet, events.recv()).await {
        panic!("expected quiet stream, got {event:?}");
    }
}

/// Poll `condition` until it holds, bounded by 5s.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
