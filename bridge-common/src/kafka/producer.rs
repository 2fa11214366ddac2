use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::health::HealthHandle;
use crate::kafka::config::KafkaConfig;
use crate::sinks::dead_letter::RetryEnvelope;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Publishes messages that exhausted their retries to a side topic.
#[async_trait]
pub trait DeadLetterProducer: Send + Sync {
    /// Publish one envelope and wait for the broker to acknowledge it.
    async fn publish(&self, topic: &str, envelope: &RetryEnvelope) -> Result<(), KafkaProduceError>;

    /// Wait for any queued publishes to be delivered.
    async fn flush(&self) -> Result<(), KafkaProduceError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct KafkaDeadLetterProducer {
    producer: FutureProducer<KafkaContext>,
    flush_timeout: Duration,
}

impl KafkaDeadLetterProducer {
    pub fn new(producer: FutureProducer<KafkaContext>, flush_timeout: Duration) -> Self {
        Self {
            producer,
            flush_timeout,
        }
    }
}

#[async_trait]
impl DeadLetterProducer for KafkaDeadLetterProducer {
    async fn publish(&self, topic: &str, envelope: &RetryEnvelope) -> Result<(), KafkaProduceError> {
        let message = envelope.message();
        let headers = envelope
            .headers()
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value),
                })
            });

        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic)
            .payload(message.value())
            .headers(headers);
        if !message.key().is_empty() {
            record = record.key(message.key());
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(error, _)| KafkaProduceError::KafkaProduceError { error })?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(KafkaProduceError::KafkaProduceError { error }),
            Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
        }
    }

    async fn flush(&self) -> Result<(), KafkaProduceError> {
        self.producer
            .flush(self.flush_timeout)
            .map_err(|error| KafkaProduceError::KafkaProduceError { error })
    }
}
