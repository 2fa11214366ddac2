use std::time::Duration;

use bridge_common::backoff::ExponentialBackoff;
use bridge_common::filter::{build_filter, FilterDataSource};
use bridge_common::health::HealthRegistry;
use bridge_common::message::{Message, Partition};
use bridge_common::offsets::{BrokerError, OffsetCoordinator};
use bridge_common::sinks::dead_letter::{DeadLetterSink, ORIGIN_OFFSET_HEADER, RETRY_ATTEMPT_HEADER};
use bridge_common::sinks::retry::RetrySink;
use bridge_common::sinks::Sink;
use bridge_common::test_utils::{
    MemoryConsumer, RecordingProducer, RecordingSink, RecordingTracer, SinkResponse,
};
use bridge_worker::consumer::SinkConsumer;
use bridge_worker::error::ConsumerError;

fn order(offset: i64, paid: bool) -> Message {
    Message::new(
        format!("order-{offset}"),
        format!(r#"{{"id": {offset}, "paid": {paid}}}"#),
        "orders",
        0,
        offset,
    )
}

fn partition() -> Partition {
    Partition::new("orders", 0)
}

fn backoff() -> ExponentialBackoff {
    ExponentialBackoff::new(2.0, Duration::from_millis(100), Duration::from_secs(10))
}

async fn bridge(consumer: &MemoryConsumer, sink: Box<dyn Sink>) -> SinkConsumer {
    let filter = build_filter(FilterDataSource::Value, Some("/paid == true"))
        .expect("failed to build filter");
    let liveness = HealthRegistry::new("liveness")
        .register("consumer".to_string(), time::Duration::seconds(30))
        .await;

    SinkConsumer::new(
        OffsetCoordinator::new(Box::new(consumer.clone()), 100, Duration::from_millis(50)),
        filter,
        sink,
        Box::new(RecordingTracer::new()),
        liveness,
    )
}

#[tokio::test]
async fn test_filtered_messages_are_committed_with_delivered_ones() {
    let consumer = MemoryConsumer::new(vec![vec![
        order(100, true),
        order(101, false),
        order(102, true),
    ]]);
    let target = RecordingSink::new(vec![]);
    let mut bridge = bridge(&consumer, Box::new(target.clone())).await;

    let processed = bridge.process().await.unwrap();

    assert_eq!(processed, 3);
    // The filtered-out order never reaches the sink.
    assert_eq!(target.calls(), vec![vec![order(100, true), order(102, true)]]);
    assert_eq!(consumer.commits(), vec![vec![(partition(), 103)]]);
    let progress = bridge.coordinator().tracker().progress(&partition()).unwrap();
    assert_eq!(progress.committed(), 102);
    assert_eq!(progress.committable().count(), 0);
}

#[tokio::test]
async fn test_empty_poll_only_records_timing() {
    let consumer = MemoryConsumer::new(vec![]);
    let target = RecordingSink::new(vec![]);
    let mut bridge = bridge(&consumer, Box::new(target.clone())).await;

    assert_eq!(bridge.process().await.unwrap(), 0);

    assert!(target.calls().is_empty());
    assert!(consumer.commits().is_empty());
    assert!(bridge.coordinator().tracker().partitions().next().is_none());
}

#[tokio::test]
async fn test_fatal_error_leaves_offsets_uncommitted() {
    let consumer = MemoryConsumer::new(vec![vec![order(7, true), order(8, false)]]);
    let target = RecordingSink::new(vec![SinkResponse::Fatal("unauthorized".to_owned())]);
    let retry = RetrySink::new(Box::new(target.clone()), backoff(), None);
    let mut bridge = bridge(&consumer, Box::new(retry)).await;

    let result = bridge.process().await;

    assert!(matches!(result, Err(ConsumerError::Delivery(_))));
    assert_eq!(target.calls().len(), 1);
    assert!(consumer.commits().is_empty());

    bridge.close().await;
    assert!(target.is_closed());
    assert_eq!(consumer.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_messages_are_dead_lettered_and_committed() {
    let consumer = MemoryConsumer::new(vec![vec![
        order(20, true),
        order(21, true),
        order(22, true),
    ]]);
    let target = RecordingSink::new(vec![SinkResponse::Fail(vec![21])]);
    let producer = RecordingProducer::new();
    let retry = RetrySink::new(Box::new(target.clone()), backoff(), Some(3));
    let dead_letter = DeadLetterSink::new(retry, Box::new(producer.clone()), "orders-dlq");
    let mut bridge = bridge(&consumer, Box::new(dead_letter)).await;

    assert_eq!(bridge.process().await.unwrap(), 3);

    // The first push plus three retries of the failing order only.
    let calls = target.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[1..].iter().all(|call| call == &vec![order(21, true)]));

    let published = producer.published();
    assert_eq!(published.len(), 1);
    let (topic, envelope) = &published[0];
    assert_eq!(topic, "orders-dlq");
    assert_eq!(envelope.attempt(), 3);
    let headers = envelope.headers();
    assert!(headers.contains(&(RETRY_ATTEMPT_HEADER.to_owned(), b"3".to_vec())));
    assert!(headers.contains(&(ORIGIN_OFFSET_HEADER.to_owned(), b"21".to_vec())));

    assert_eq!(consumer.commits(), vec![vec![(partition(), 23)]]);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_without_dead_letter_stops_the_consumer() {
    let consumer = MemoryConsumer::new(vec![vec![order(1, true)], vec![order(2, true)]]);
    let target = RecordingSink::new(vec![SinkResponse::Fail(vec![1])]);
    let retry = RetrySink::new(Box::new(target.clone()), backoff(), Some(1));
    let mut bridge = bridge(&consumer, Box::new(retry)).await;

    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let result = bridge.run(shutdown_rx).await;

    assert!(matches!(result, Err(ConsumerError::UnresolvedMessages(1))));
    assert_eq!(consumer.polls(), 1);
    assert!(consumer.commits().is_empty());
}

#[tokio::test]
async fn test_each_iteration_commits_its_own_progress() {
    let consumer = MemoryConsumer::new(vec![
        vec![order(1, true), order(2, true)],
        vec![order(3, false)],
    ]);
    let target = RecordingSink::new(vec![SinkResponse::Succeed]);
    let mut bridge = bridge(&consumer, Box::new(target.clone())).await;

    bridge.process().await.unwrap();
    bridge.process().await.unwrap();

    assert_eq!(
        consumer.commits(),
        vec![vec![(partition(), 3)], vec![(partition(), 4)]]
    );
}

#[tokio::test]
async fn test_unconsumable_record_stops_the_consumer_before_its_neighbours() {
    let consumer = MemoryConsumer::new(vec![vec![order(10, true)], vec![order(12, true)]]);
    consumer.fail_consumption_at_poll(2);
    let target = RecordingSink::new(vec![]);
    let mut bridge = bridge(&consumer, Box::new(target.clone())).await;

    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let result = bridge.run(shutdown_rx).await;

    assert!(matches!(
        result,
        Err(ConsumerError::Broker(BrokerError::Kafka(_)))
    ));
    // 12 is read again after a restart, together with 11.
    assert_eq!(target.calls(), vec![vec![order(10, true)]]);
    assert_eq!(consumer.commits(), vec![vec![(partition(), 11)]]);
}
