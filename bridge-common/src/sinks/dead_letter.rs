use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::kafka::producer::{DeadLetterProducer, KafkaProduceError};
use crate::message::Message;
use crate::metrics_consts::{SINK_FATAL_ERRORS, SINK_MESSAGES_DEAD_LETTERED};
use crate::sinks::retry::RetrySink;
use crate::sinks::{Sink, SinkError};

pub const RETRY_ATTEMPT_HEADER: &str = "retry_attempt";
pub const ORIGIN_TOPIC_HEADER: &str = "origin_topic";
pub const ORIGIN_PARTITION_HEADER: &str = "origin_partition";
pub const ORIGIN_OFFSET_HEADER: &str = "origin_offset";

const RESERVED_HEADERS: [&str; 4] = [
    RETRY_ATTEMPT_HEADER,
    ORIGIN_TOPIC_HEADER,
    ORIGIN_PARTITION_HEADER,
    ORIGIN_OFFSET_HEADER,
];

/// A message that exhausted its retries, together with how many attempts it has seen so far.
///
/// The original key and value are republished untouched. The attempt counter and the origin of
/// the message travel as headers, so a consumer of the dead-letter topic can feed the message back
/// through another bridge, which will then keep counting from where this one stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEnvelope {
    message: Message,
    attempt: u32,
}

impl RetryEnvelope {
    /// Wrap `message` after `attempts` more failed retries. A message that already carries a
    /// `retry_attempt` header has its counter incremented, otherwise it is initialised.
    pub fn wrap(message: Message, attempts: u32) -> Self {
        let previous = message
            .header(RETRY_ATTEMPT_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(0);

        Self {
            message,
            attempt: previous.saturating_add(attempts),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The headers to publish: the original ones, minus any previous envelope headers, followed by
    /// the attempt counter and the origin of the message.
    pub fn headers(&self) -> Vec<(String, Vec<u8>)> {
        let mut headers: Vec<(String, Vec<u8>)> = self
            .message
            .headers()
            .iter()
            .filter(|(name, _)| !RESERVED_HEADERS.contains(&name.as_str()))
            .cloned()
            .collect();

        headers.push((
            RETRY_ATTEMPT_HEADER.to_owned(),
            self.attempt.to_string().into_bytes(),
        ));
        headers.push((
            ORIGIN_TOPIC_HEADER.to_owned(),
            self.message.topic().as_bytes().to_vec(),
        ));
        headers.push((
            ORIGIN_PARTITION_HEADER.to_owned(),
            self.message.partition().to_string().into_bytes(),
        ));
        headers.push((
            ORIGIN_OFFSET_HEADER.to_owned(),
            self.message.offset().to_string().into_bytes(),
        ));

        headers
    }
}

/// Hands messages that exhaust their retries over to a dead-letter topic.
///
/// Once a message is published there, it counts as resolved: this sink reports success for the
/// whole batch and the offsets can be committed. Failing to publish is fatal, there is nowhere
/// left to send the message.
pub struct DeadLetterSink {
    retry: RetrySink,
    producer: Box<dyn DeadLetterProducer>,
    topic: String,
}

impl DeadLetterSink {
    pub fn new(retry: RetrySink, producer: Box<dyn DeadLetterProducer>, topic: &str) -> Self {
        Self {
            retry,
            producer,
            topic: topic.to_owned(),
        }
    }

    async fn publish(&mut self, envelope: RetryEnvelope) -> Result<(), SinkError> {
        match self.producer.publish(&self.topic, &envelope).await {
            Ok(()) => {
                metrics::counter!(SINK_MESSAGES_DEAD_LETTERED).increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(SINK_FATAL_ERRORS).increment(1);
                error!(
                    topic = %self.topic,
                    message = %envelope.message(),
                    "failed to publish to dead-letter topic: {e}"
                );
                Err(SinkError::DeadLetterPublish {
                    topic: self.topic.clone(),
                    message: envelope.message().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Sink for DeadLetterSink {
    async fn push(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SinkError> {
        let (unresolved, attempts) = self.retry.push_with_retries(messages).await?;

        if unresolved.is_empty() {
            return Ok(unresolved);
        }

        warn!(
            topic = %self.topic,
            count = unresolved.len(),
            attempts,
            "publishing messages that exhausted their retries to the dead-letter topic"
        );

        for message in unresolved {
            self.publish(RetryEnvelope::wrap(message, attempts)).await?;
        }

        Ok(Vec::new())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let flushed = self.producer.flush().await;
        let closed = self.retry.close().await;

        flushed.map_err(|e: KafkaProduceError| SinkError::Close(e.to_string()))?;
        info!(topic = %self.topic, "dead-letter producer flushed");
        closed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::test_utils::{RecordingProducer, RecordingSink, SinkResponse};

    fn messages(offsets: &[i64]) -> Vec<Message> {
        offsets
            .iter()
            .map(|offset| Message::new("key", format!("m{offset}"), "orders", 4, *offset))
            .collect()
    }

    fn retry_sink(sink: &RecordingSink, max_attempts: u32) -> RetrySink {
        RetrySink::new(
            Box::new(sink.clone()),
            ExponentialBackoff::new(2.0, Duration::from_millis(10), Duration::from_secs(1)),
            Some(max_attempts),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_messages_are_published_once_each() {
        let sink = RecordingSink::new(vec![SinkResponse::Fail(vec![1, 3])]);
        let producer = RecordingProducer::new();
        let mut dead_letter =
            DeadLetterSink::new(retry_sink(&sink, 3), Box::new(producer.clone()), "orders-dlq");

        let failed = dead_letter.push(messages(&[1, 2, 3])).await.unwrap();

        assert!(failed.is_empty());
        let published = producer.published();
        assert_eq!(published.len(), 2);
        for ((topic, envelope), offset) in published.iter().zip([1, 3]) {
            assert_eq!(topic, "orders-dlq");
            assert_eq!(envelope.attempt(), 3);
            assert_eq!(envelope.message().offset(), offset);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_published_when_retry_succeeds() {
        let sink = RecordingSink::new(vec![SinkResponse::Fail(vec![2]), SinkResponse::Succeed]);
        let producer = RecordingProducer::new();
        let mut dead_letter =
            DeadLetterSink::new(retry_sink(&sink, 3), Box::new(producer.clone()), "dlq");

        let failed = dead_letter.push(messages(&[1, 2])).await.unwrap();

        assert!(failed.is_empty());
        assert!(producer.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_bypasses_dead_letter() {
        let sink = RecordingSink::new(vec![SinkResponse::Fatal("unauthorized".to_owned())]);
        let producer = RecordingProducer::new();
        let mut dead_letter =
            DeadLetterSink::new(retry_sink(&sink, 3), Box::new(producer.clone()), "dlq");

        let result = dead_letter.push(messages(&[1])).await;

        assert!(matches!(result, Err(SinkError::Fatal(_))));
        assert!(producer.published().is_empty());
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_is_fatal() {
        let sink = RecordingSink::new(vec![SinkResponse::Fail(vec![1])]);
        let producer = RecordingProducer::failing();
        let mut dead_letter =
            DeadLetterSink::new(retry_sink(&sink, 1), Box::new(producer.clone()), "dlq");

        let result = dead_letter.push(messages(&[1])).await;

        match result {
            Err(SinkError::DeadLetterPublish { topic, message, .. }) => {
                assert_eq!(topic, "dlq");
                assert_eq!(message, "orders-4@1");
            }
            other => panic!("expected a dead-letter publish error, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_increments_previous_attempts() {
        let message = Message::new("k", "v", "orders-dlq", 0, 12).with_headers(vec![
            ("trace".to_owned(), b"abc".to_vec()),
            (RETRY_ATTEMPT_HEADER.to_owned(), b"3".to_vec()),
            (ORIGIN_TOPIC_HEADER.to_owned(), b"orders".to_vec()),
        ]);

        let envelope = RetryEnvelope::wrap(message, 2);

        assert_eq!(envelope.attempt(), 5);
        assert_eq!(
            envelope.headers(),
            vec![
                ("trace".to_owned(), b"abc".to_vec()),
                (RETRY_ATTEMPT_HEADER.to_owned(), b"5".to_vec()),
                (ORIGIN_TOPIC_HEADER.to_owned(), b"orders-dlq".to_vec()),
                (ORIGIN_PARTITION_HEADER.to_owned(), b"0".to_vec()),
                (ORIGIN_OFFSET_HEADER.to_owned(), b"12".to_vec()),
            ]
        );
    }

    #[test]
    fn test_envelope_ignores_unparseable_counter() {
        let message = Message::new("k", "v", "orders", 0, 1)
            .with_headers(vec![(RETRY_ATTEMPT_HEADER.to_owned(), b"many".to_vec())]);

        assert_eq!(RetryEnvelope::wrap(message, 4).attempt(), 4);
    }
}
