//! Unicast delivery: one sender, one receiver with unlimited demand.

mod common;

use bytes::Bytes;
use riffle_core::{Processor, Publisher, UNBOUNDED};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn next_signals_arrive_in_order_then_complete() {
    common::init_tracing();
    let manager = common::test_manager("unicast");

    let server =
        Processor::create(common::fast_context("unicast-server", "mem:unicast", &manager)).unwrap();
    let client =
        Processor::create(common::fast_context("unicast-client", "mem:unicast", &manager)).unwrap();

    let (subscriber, mut events, _subscriptions) = common::subscriber(UNBOUNDED);
    client.subscribe(subscriber);

    for payload in ["One", "Two", "Three"] {
        server.send(Bytes::from_static(payload.as_bytes())).await.unwrap();
    }
    server.complete().await.unwrap();

    common::expect_subscribed(&mut events).await;
    common::expect_payloads(&mut events, &["One", "Two", "Three"]).await;
    common::expect_complete(&mut events).await;

    // Complete is not fatal to either processor.
    assert!(server.alive());
    assert!(client.alive());

    server.shutdown();
    client.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn demand_decrements_per_delivery() {
    common::init_tracing();
    let manager = common::test_manager("unicast-demand");

    let server = Processor::create(common::fast_context(
        "unicast-demand-server",
        "mem:unicast-demand",
        &manager,
    ))
    .unwrap();
    let client = Processor::create(common::fast_context(
        "unicast-demand-client",
        "mem:unicast-demand",
        &manager,
    ))
    .unwrap();

    let (subscriber, mut events, mut subscriptions) = common::subscriber(0);
    client.subscribe(subscriber);
    common::expect_subscribed(&mut events).await;
    let subscription = subscriptions.recv().await.unwrap();

    for payload in ["a", "b", "c"] {
        server.send(Bytes::from_static(payload.as_bytes())).await.unwrap();
    }

    common::wait_for("the session to join", || server.session_count() == 1).await;

    // No demand yet: nothing may flow.
    common::expect_quiet(&mut events, std::time::Duration::from_millis(200)).await;

    subscription.request(2);
    common::expect_payloads(&mut events, &["a", "b"]).await;
    common::expect_quiet(&mut events, std::time::Duration::from_millis(200)).await;

    subscription.request(1);
    common::expect_payloads(&mut events, &["c"]).await;

    server.shutdown();
    client.shutdown();
}
