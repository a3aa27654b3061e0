//! Queue delivery integration tests over real sockets: point-to-point flow,
//! backlog drain for late subscribers, redelivery after NACK and after a
//! client vanishes with an unacked frame.
mod common;

use bytes::Bytes;
use common::{StompClient, spawn_broker};
use stampede_wire::{command, header};

#[tokio::test]
async fn point_to_point_delivery_with_individual_ack() {
    let addr = spawn_broker().await;
    let mut consumer = StompClient::connect(addr).await;
    consumer
        .subscribe_confirmed("/queue/x", "s1", "client-individual")
        .await;

    let mut producer = StompClient::connect(addr).await;
    producer.send("/queue/x", b"hello").await;

    let message = consumer.expect_frame().await;
    assert_eq!(message.command, command::MESSAGE);
    assert_eq!(message.destination(), Some("/queue/x"));
    assert_eq!(message.headers.get(header::SUBSCRIPTION), Some("s1"));
    assert_eq!(message.headers.get(header::MESSAGE_ID), Some("1"));
    assert_eq!(message.body, Bytes::from_static(b"hello"));

    // The ack re-arms the subscription for the next frame.
    consumer.ack("1").await;
    producer.send("/queue/x", b"again").await;
    let next = consumer.expect_frame().await;
    assert_eq!(next.body, Bytes::from_static(b"again"));
    assert_eq!(next.headers.get(header::MESSAGE_ID), Some("2"));
}

#[tokio::test]
async fn late_subscriber_drains_backlog_in_order() {
    let addr = spawn_broker().await;
    let mut producer = StompClient::connect(addr).await;
    producer.send("/queue/backlog", b"one").await;
    producer.send("/queue/backlog", b"two").await;
    producer.send("/queue/backlog", b"three").await;

    let mut consumer = StompClient::connect(addr).await;
    consumer
        .subscribe("/queue/backlog", "s1", "client-individual")
        .await;
    for expected in [&b"one"[..], b"two", b"three"] {
        let message = consumer.expect_frame().await;
        assert_eq!(message.body, Bytes::copy_from_slice(expected));
        let id = message
            .headers
            .get(header::ACK)
            .expect("ack id")
            .to_string();
        consumer.ack(&id).await;
    }
}

#[tokio::test]
async fn only_one_subscriber_gets_each_frame() {
    let addr = spawn_broker().await;
    let mut first = StompClient::connect(addr).await;
    first.subscribe_confirmed("/queue/rr", "a", "auto").await;
    let mut second = StompClient::connect(addr).await;
    second.subscribe_confirmed("/queue/rr", "b", "auto").await;

    let mut producer = StompClient::connect(addr).await;
    producer.send("/queue/rr", b"round-robin").await;

    // Exactly one of the two receives it; auto mode needs no ack.
    let winner = tokio::select! {
        frame = first.expect_frame() => frame,
        frame = second.expect_frame() => frame,
    };
    assert_eq!(winner.body, Bytes::from_static(b"round-robin"));
}

#[tokio::test]
async fn nack_requeues_for_redelivery() {
    let addr = spawn_broker().await;
    let mut consumer = StompClient::connect(addr).await;
    consumer
        .subscribe_confirmed("/queue/retry", "s1", "client-individual")
        .await;

    let mut producer = StompClient::connect(addr).await;
    producer.send("/queue/retry", b"flaky").await;

    let message = consumer.expect_frame().await;
    assert_eq!(message.headers.get(header::MESSAGE_ID), Some("1"));
    consumer.nack("1").await;

    // Same body comes back with a fresh message id.
    let redelivered = consumer.expect_frame().await;
    assert_eq!(redelivered.body, Bytes::from_static(b"flaky"));
    assert_eq!(redelivered.headers.get(header::MESSAGE_ID), Some("2"));
}

#[tokio::test]
async fn unacked_frame_is_redelivered_after_disconnect() {
    let addr = spawn_broker().await;
    let mut doomed = StompClient::connect(addr).await;
    doomed
        .subscribe_confirmed("/queue/handoff", "s1", "client-individual")
        .await;

    let mut producer = StompClient::connect(addr).await;
    producer.send("/queue/handoff", b"precious").await;

    let message = doomed.expect_frame().await;
    assert_eq!(message.body, Bytes::from_static(b"precious"));
    // Vanish without acking.
    drop(doomed);

    let mut successor = StompClient::connect(addr).await;
    successor
        .subscribe("/queue/handoff", "s9", "client-individual")
        .await;
    let redelivered = successor.expect_frame().await;
    assert_eq!(redelivered.body, Bytes::from_static(b"precious"));
}

#[tokio::test]
async fn send_receipt_arrives_after_the_enqueue() {
    let addr = spawn_broker().await;
    let mut producer = StompClient::connect(addr).await;
    let mut frame = stampede_wire::Frame::with_body(command::SEND, Bytes::from_static(b"logged"));
    frame.headers.push(header::DESTINATION, "/queue/receipts");
    frame.headers.push(header::RECEIPT, "r-42");
    producer.write(&frame).await;

    let receipt = producer.expect_frame().await;
    assert_eq!(receipt.command, command::RECEIPT);
    assert_eq!(receipt.headers.get(header::RECEIPT_ID), Some("r-42"));
}

#[tokio::test]
async fn unsubscribe_stops_queue_delivery() {
    let addr = spawn_broker().await;
    let mut consumer = StompClient::connect(addr).await;
    consumer.subscribe_confirmed("/queue/leave", "s1", "auto").await;

    let mut unsubscribe = stampede_wire::Frame::new(command::UNSUBSCRIBE);
    unsubscribe.headers.push(header::ID, "s1");
    unsubscribe.headers.push(header::RECEIPT, "bye-s1");
    consumer.write(&unsubscribe).await;
    let receipt = consumer.expect_frame().await;
    assert_eq!(receipt.headers.get(header::RECEIPT_ID), Some("bye-s1"));

    // The frame stays queued for a future subscriber instead.
    let mut producer = StompClient::connect(addr).await;
    producer.send("/queue/leave", b"later").await;
    let mut fresh = StompClient::connect(addr).await;
    fresh.subscribe("/queue/leave", "s2", "auto").await;
    let message = fresh.expect_frame().await;
    assert_eq!(message.body, Bytes::from_static(b"later"));
}
