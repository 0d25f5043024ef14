//! Terminal semantics on a shared channel: a peer's Error tears the fabric
//! down, a peer's Complete does not.

mod common;

use std::time::Duration;

use bytes::Bytes;
use riffle_core::{CoreError, Processor, Publisher, UNBOUNDED};

use common::StreamEvent;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_error_shuts_down_every_processor() {
    common::init_tracing();
    let manager = common::test_manager("fabric-error");
    let channel = "mem:fabric-error";

    let mine = Processor::create(common::fast_context("err-mine", channel, &manager)).unwrap();
    let other = Processor::create(common::fast_context("err-other", channel, &manager)).unwrap();

    let (sub_mine, mut events_mine, _subs_mine) = common::subscriber(UNBOUNDED);
    mine.subscribe(sub_mine);
    let (sub_other, mut events_other, _subs_other) = common::subscriber(UNBOUNDED);
    other.subscribe(sub_other);

    common::expect_subscribed(&mut events_mine).await;
    common::expect_subscribed(&mut events_other).await;

    other.error("boom").await.unwrap();

    for events in [&mut events_mine, &mut events_other] {
        match common::next_event(events).await {
            StreamEvent::Error(CoreError::Upstream(message)) => {
                assert_eq!(message, "boom");
            },
            other_event => panic!("expected Upstream error, got {other_event:?}"),
        }
    }

    common::wait_for("both processors to shut down", || !mine.alive() && !other.alive()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_complete_leaves_the_fabric_up() {
    common::init_tracing();
    let manager = common::test_manager("fabric-complete");
    let channel = "mem:fabric-complete";

    let mine = Processor::create(common::fast_context("done-mine", channel, &manager)).unwrap();
    let other = Processor::create(common::fast_context("done-other", channel, &manager)).unwrap();

    let (sub_mine, mut events_mine, _subs_mine) = common::subscriber(UNBOUNDED);
    mine.subscribe(sub_mine);
    let (sub_other, mut events_other, _subs_other) = common::subscriber(UNBOUNDED);
    other.subscribe(sub_other);

    common::expect_subscribed(&mut events_mine).await;
    common::expect_subscribed(&mut events_other).await;

    other.send(Bytes::from_static(b"payload")).await.unwrap();
    other.complete().await.unwrap();

    common::expect_payloads(&mut events_mine, &["payload"]).await;
    common::expect_complete(&mut events_mine).await;
    common::expect_payloads(&mut events_other, &["payload"]).await;
    common::expect_complete(&mut events_other).await;

    // Complete must not tear down either processor on the shared channel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(mine.alive());
    assert!(other.alive());

    mine.shutdown();
    other.shutdown();
}
