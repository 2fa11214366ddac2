use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Headers;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::kafka::config::{ConsumerConfig, KafkaConfig};
use crate::message::{Message, Partition};
use crate::metrics_consts::KAFKA_CONSUMER_ERRORS;
use crate::offsets::{BrokerConsumer, BrokerError};

/// Subscribes to a single topic with auto-commit disabled: offsets only move when the
/// coordinator commits them.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let client_config = client_config(common_config, consumer_config);

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;
        info!(
            topic = %consumer_config.kafka_consumer_topic,
            group = %consumer_config.kafka_consumer_group,
            "subscribed to topic"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: consumer_config.kafka_consumer_topic.clone(),
        })
    }
}

fn client_config(common_config: &KafkaConfig, consumer_config: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &common_config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set(
            "max.poll.interval.ms",
            consumer_config
                .kafka_consumer_max_poll_interval_ms
                .to_string(),
        );

    if common_config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::with_capacity(max_records);

        while messages.len() < max_records {
            // Once something arrived, only take what is already buffered.
            let wait_until = if messages.is_empty() {
                deadline
            } else {
                Instant::now()
            };

            match tokio::time::timeout_at(wait_until, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => messages.push(message_from_kafka(&message)),
                Ok(Err(KafkaError::MessageConsumption(code)))
                    if is_benign_consumption_error(code) =>
                {
                    debug!(topic = %self.topic, "consumer notice: {code}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "info"), ("error", "notice")]
                    )
                    .increment(1);
                }
                Ok(Err(e)) => {
                    // The record behind a consumption error is not in the batch, so later reads
                    // of the partition must not be committed past it.
                    warn!(topic = %self.topic, "kafka consumer error: {e}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "error"), ("error", "consumer")]
                    )
                    .increment(1);
                    return Err(e.into());
                }
            }
        }

        Ok(messages)
    }

    async fn commit(&mut self, positions: &[(Partition, i64)]) -> Result<(), BrokerError> {
        let mut list = TopicPartitionList::with_capacity(positions.len());
        for (partition, position) in positions {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*position),
            )?;
        }

        // A sync commit blocks until the broker answers, keep it off the runtime's workers.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync)).await??;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "unsubscribed from topic");
        Ok(())
    }
}

/// Notices the client reports through the message stream that do not stand for a lost record.
pub fn is_benign_consumption_error(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut
    )
}

/// Copy a record out of the client's buffer. Records without a key or payload get empty ones.
pub fn message_from_kafka<M: rdkafka::Message>(record: &M) -> Message {
    let timestamp = record
        .timestamp()
        .to_millis()
        .and_then(|millis| {
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
        });

    let headers = record
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_owned(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let message = Message::new(
        record.key().unwrap_or_default(),
        record.payload().unwrap_or_default(),
        record.topic(),
        record.partition(),
        record.offset(),
    )
    .with_headers(headers);

    match timestamp {
        Some(timestamp) => message.with_timestamp(timestamp),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
    use rdkafka::Timestamp;

    use super::*;

    #[test]
    fn test_message_from_kafka_record() {
        let headers = OwnedHeaders::new().insert(Header {
            key: "retry_attempt",
            value: Some("2"),
        });
        let record = OwnedMessage::new(
            Some(b"{\"id\":1}".to_vec()),
            Some(b"user-1".to_vec()),
            "orders".to_owned(),
            Timestamp::CreateTime(1_700_000_000_123),
            3,
            42,
            Some(headers),
        );

        let message = message_from_kafka(&record);

        assert_eq!(message.key(), b"user-1");
        assert_eq!(message.value(), b"{\"id\":1}");
        assert_eq!(message.topic(), "orders");
        assert_eq!(message.partition(), 3);
        assert_eq!(message.offset(), 42);
        assert_eq!(message.header("retry_attempt"), Some(&b"2"[..]));
        assert_eq!(
            message.timestamp().map(|ts| ts.unix_timestamp_nanos() / 1_000_000),
            Some(1_700_000_000_123)
        );
    }

    #[test]
    fn test_client_config_disables_auto_commit() {
        let common = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_owned(),
            kafka_tls: false,
            kafka_hosts: "kafka:9092".to_owned(),
        };
        let consumer = ConsumerConfig {
            kafka_consumer_group: "bridge".to_owned(),
            kafka_consumer_topic: "orders".to_owned(),
            kafka_consumer_offset_reset: "latest".to_owned(),
            kafka_consumer_max_poll_interval_ms: 900000,
        };

        let config = client_config(&common, &consumer);

        assert_eq!(config.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(config.get("group.id"), Some("bridge"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("900000"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_only_notices_are_benign_consumption_errors() {
        assert!(is_benign_consumption_error(RDKafkaErrorCode::PartitionEOF));
        assert!(is_benign_consumption_error(RDKafkaErrorCode::OperationTimedOut));

        for code in [
            RDKafkaErrorCode::OffsetOutOfRange,
            RDKafkaErrorCode::InvalidMessage,
            RDKafkaErrorCode::MessageSizeTooLarge,
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ] {
            assert!(!is_benign_consumption_error(code), "{code:?} must be propagated");
        }
    }

    #[test]
    fn test_message_from_kafka_record_without_key_or_timestamp() {
        let record = OwnedMessage::new(
            None,
            None,
            "orders".to_owned(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );

        let message = message_from_kafka(&record);

        assert!(message.key().is_empty());
        assert!(message.value().is_empty());
        assert!(message.timestamp().is_none());
        assert!(message.headers().is_empty());
    }
}
