use std::time::Instant;

use bridge_common::filter::Filter;
use bridge_common::health::HealthHandle;
use bridge_common::message::Message;
use bridge_common::metrics_consts::{
    CONSUMER_FAILED_ITERATIONS, CONSUMER_ITERATION_DURATION_SECONDS, CONSUMER_PROCESSED_RECORDS,
    FILTER_RECORDS,
};
use bridge_common::offsets::OffsetCoordinator;
use bridge_common::sinks::Sink;
use bridge_common::tracer::Tracer;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::ConsumerError;

/// Runs the consume, filter, deliver and commit loop for one consumer instance.
///
/// Iterations run strictly one after the other: while a batch is being delivered, retried or
/// backed off, nothing is polled or committed.
pub struct SinkConsumer {
    coordinator: OffsetCoordinator,
    filter: Box<dyn Filter>,
    sink: Box<dyn Sink>,
    tracer: Box<dyn Tracer>,
    liveness: HealthHandle,
}

impl SinkConsumer {
    pub fn new(
        coordinator: OffsetCoordinator,
        filter: Box<dyn Filter>,
        sink: Box<dyn Sink>,
        tracer: Box<dyn Tracer>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            coordinator,
            filter,
            sink,
            tracer,
            liveness,
        }
    }

    pub fn coordinator(&self) -> &OffsetCoordinator {
        &self.coordinator
    }

    /// Run iterations until `shutdown` fires or an iteration fails. Shutdown is only checked
    /// between iterations, so an in-flight batch is always finished first.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), ConsumerError> {
        loop {
            match shutdown.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => {
                    info!("shutdown requested, stopping consumer");
                    return Ok(());
                }
            }

            self.liveness.report_healthy().await;
            self.process().await?;
        }
    }

    /// Run one iteration and return the number of records it read. The iteration duration is
    /// recorded whatever the outcome.
    pub async fn process(&mut self) -> Result<usize, ConsumerError> {
        let start = Instant::now();
        let result = self.process_batch().await;

        metrics::histogram!(CONSUMER_ITERATION_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics::counter!(CONSUMER_FAILED_ITERATIONS).increment(1);
            error!("consumer iteration failed: {e}");
        }

        result
    }

    async fn process_batch(&mut self) -> Result<usize, ConsumerError> {
        let messages = self.coordinator.read_messages().await?;
        if messages.is_empty() {
            debug!("poll returned no messages");
            return Ok(0);
        }

        let count = messages.len();
        let spans = self.tracer.start_trace(&messages);
        let result = self.deliver(messages).await;
        self.tracer.finish_trace(spans);
        result?;

        metrics::counter!(CONSUMER_PROCESSED_RECORDS).increment(count as u64);
        Ok(count)
    }

    async fn deliver(&mut self, messages: Vec<Message>) -> Result<(), ConsumerError> {
        let (valid, invalid) = self.filter.apply(messages)?.into_parts();
        metrics::counter!(FILTER_RECORDS, "result" => "valid").increment(valid.len() as u64);
        metrics::counter!(FILTER_RECORDS, "result" => "invalid").increment(invalid.len() as u64);

        // Filtered-out records are settled before delivery starts.
        if !invalid.is_empty() {
            debug!(count = invalid.len(), "skipping filtered-out messages");
            self.coordinator
                .force_add_offsets_and_set_committable(&invalid);
        }

        if !valid.is_empty() {
            let failed = self.sink.push(valid.clone()).await?;
            if !failed.is_empty() {
                return Err(ConsumerError::UnresolvedMessages(failed.len()));
            }
            self.coordinator.add_offsets_and_set_committable(&valid);
        }

        self.coordinator.commit().await?;
        Ok(())
    }

    /// Close the tracer, the broker consumer and the sink chain, in that order. A failing step is
    /// logged and the remaining ones still run.
    pub async fn close(&mut self) {
        self.tracer.close();
        info!("tracer closed");

        match self.coordinator.close().await {
            Ok(()) => info!("offset coordinator closed"),
            Err(e) => error!("failed to close offset coordinator: {e}"),
        }

        match self.sink.close().await {
            Ok(()) => info!("sink closed"),
            Err(e) => error!("failed to close sink: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bridge_common::backoff::ExponentialBackoff;
    use bridge_common::filter::NoOpFilter;
    use bridge_common::health::HealthRegistry;
    use bridge_common::message::Partition;
    use bridge_common::offsets::BrokerError;
    use bridge_common::sinks::retry::RetrySink;
    use bridge_common::sinks::SinkError;
    use bridge_common::test_utils::{
        FailingFilter, MemoryConsumer, RecordingSink, RecordingTracer, SinkResponse,
    };

    use super::*;

    fn message(offset: i64) -> Message {
        Message::new("", format!("m{offset}"), "orders", 0, offset)
    }

    async fn liveness() -> HealthHandle {
        HealthRegistry::new("liveness")
            .register("consumer".to_string(), time::Duration::seconds(30))
            .await
    }

    async fn sink_consumer(
        consumer: &MemoryConsumer,
        filter: Box<dyn Filter>,
        sink: Box<dyn Sink>,
        tracer: &RecordingTracer,
    ) -> SinkConsumer {
        SinkConsumer::new(
            OffsetCoordinator::new(Box::new(consumer.clone()), 100, Duration::from_millis(10)),
            filter,
            sink,
            Box::new(tracer.clone()),
            liveness().await,
        )
    }

    #[tokio::test]
    async fn test_empty_poll_has_no_side_effects() {
        let consumer = MemoryConsumer::new(vec![]);
        let sink = RecordingSink::new(vec![]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(FailingFilter), Box::new(sink.clone()), &tracer)
                .await;

        // The failing filter would abort the iteration if it were reached.
        assert_eq!(bridge.process().await.unwrap(), 0);

        assert_eq!(consumer.polls(), 1);
        assert!(sink.calls().is_empty());
        assert!(consumer.commits().is_empty());
        assert_eq!(tracer.started(), 0);
    }

    #[tokio::test]
    async fn test_delivered_batch_is_committed() {
        let consumer = MemoryConsumer::new(vec![vec![message(10), message(11)]]);
        let sink = RecordingSink::new(vec![]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(sink.clone()), &tracer).await;

        assert_eq!(bridge.process().await.unwrap(), 2);

        assert_eq!(sink.calls(), vec![vec![message(10), message(11)]]);
        assert_eq!(
            consumer.commits(),
            vec![vec![(Partition::new("orders", 0), 12)]]
        );
        assert_eq!(tracer.started(), 2);
        assert_eq!(tracer.finished(), 2);
    }

    #[tokio::test]
    async fn test_filter_error_aborts_before_delivery() {
        let consumer = MemoryConsumer::new(vec![vec![message(1)]]);
        let sink = RecordingSink::new(vec![]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(FailingFilter), Box::new(sink.clone()), &tracer)
                .await;

        let result = bridge.process().await;

        assert!(matches!(result, Err(ConsumerError::Filter(_))));
        assert!(sink.calls().is_empty());
        assert!(consumer.commits().is_empty());
        // Spans are finished even when the iteration fails.
        assert_eq!(tracer.finished(), 1);
    }

    #[tokio::test]
    async fn test_fatal_delivery_error_skips_commit() {
        let consumer = MemoryConsumer::new(vec![vec![message(1), message(2)]]);
        let sink = RecordingSink::new(vec![SinkResponse::Fatal("forbidden".to_owned())]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(sink.clone()), &tracer).await;

        let result = bridge.process().await;

        assert!(matches!(
            result,
            Err(ConsumerError::Delivery(SinkError::Fatal(_)))
        ));
        assert!(consumer.commits().is_empty());
        let progress = bridge
            .coordinator()
            .tracker()
            .progress(&Partition::new("orders", 0))
            .unwrap();
        assert_eq!(progress.committed(), 0);
        assert_eq!(progress.committable().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_without_dead_letter_is_fatal() {
        let consumer = MemoryConsumer::new(vec![vec![message(1), message(2)]]);
        let target = RecordingSink::new(vec![SinkResponse::Fail(vec![2])]);
        let retry = RetrySink::new(
            Box::new(target.clone()),
            ExponentialBackoff::new(2.0, Duration::from_millis(10), Duration::from_millis(100)),
            Some(2),
        );
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(retry), &tracer).await;

        let result = bridge.process().await;

        assert!(matches!(result, Err(ConsumerError::UnresolvedMessages(1))));
        assert_eq!(target.calls().len(), 3);
        assert!(consumer.commits().is_empty());
    }

    #[tokio::test]
    async fn test_poll_error_is_propagated() {
        let consumer = MemoryConsumer::new(vec![vec![message(1)]]);
        consumer.fail_next_poll();
        let sink = RecordingSink::new(vec![]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(sink.clone()), &tracer).await;

        let result = bridge.process().await;

        assert!(matches!(
            result,
            Err(ConsumerError::Broker(BrokerError::Kafka(_)))
        ));
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let consumer = MemoryConsumer::new(vec![vec![message(1)]]);
        let sink = RecordingSink::new(vec![]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(sink.clone()), &tracer).await;

        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        bridge.run(rx).await.unwrap();

        assert_eq!(consumer.polls(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_fatal_error() {
        let consumer = MemoryConsumer::new(vec![vec![], vec![message(1)]]);
        let sink = RecordingSink::new(vec![SinkResponse::Fatal("forbidden".to_owned())]);
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(sink.clone()), &tracer).await;

        let (_tx, rx) = oneshot::channel();
        let result = bridge.run(rx).await;

        assert!(matches!(result, Err(ConsumerError::Delivery(_))));
        assert_eq!(consumer.polls(), 2);
    }

    #[tokio::test]
    async fn test_close_runs_every_step() {
        let consumer = MemoryConsumer::new(vec![]);
        let sink = RecordingSink::new(vec![]).with_close_error("flush failed");
        let tracer = RecordingTracer::new();
        let mut bridge =
            sink_consumer(&consumer, Box::new(NoOpFilter), Box::new(sink.clone()), &tracer).await;

        bridge.close().await;

        assert!(tracer.is_closed());
        assert_eq!(consumer.close_count(), 1);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_close_without_consumer_still_closes_sink() {
        let sink = RecordingSink::new(vec![]);
        let mut bridge = SinkConsumer::new(
            OffsetCoordinator::without_consumer(100, Duration::from_millis(10)),
            Box::new(NoOpFilter),
            Box::new(sink.clone()),
            Box::new(RecordingTracer::new()),
            liveness().await,
        );

        bridge.close().await;

        assert!(sink.is_closed());
    }
}
