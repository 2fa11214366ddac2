//! Consume a Kafka topic and deliver its records to a sink, committing only what is settled.
use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use bridge_common::filter::build_filter;
use bridge_common::health::HealthRegistry;
use bridge_common::kafka::consumer::KafkaConsumer;
use bridge_common::kafka::producer::{create_kafka_producer, KafkaDeadLetterProducer};
use bridge_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use bridge_common::offsets::OffsetCoordinator;
use bridge_common::tracer::{NoopTracer, SpanTracer, Tracer as MessageTracer};
use bridge_worker::config::Config;
use bridge_worker::consumer::SinkConsumer;
use bridge_worker::sinks::{build_sink_chain, build_target, DeadLetter};

async fn shutdown() {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = terminate => {},
        _ = signal::ctrl_c() => {},
    };

    info!("shutdown signal received");
}

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> anyhow::Result<Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
        .context("failed to install opentelemetry pipeline")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;

    // Stdout at the level given by RUST_LOG (default INFO), and OpenTelemetry when configured.
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let otel_layer = config
        .otel_url
        .as_deref()
        .map(|url| {
            init_tracer(url, config.otel_sampling_rate, &config.otel_service_name)
                .map(OpenTelemetryLayer::new)
        })
        .transpose()?
        .with_filter(LevelFilter::from_level(config.log_level));
    let tracing_exported = config.otel_url.is_some();
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    let liveness = HealthRegistry::new("liveness");
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = setup_metrics_router(recorder, liveness.clone());
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("metrics server stopped: {e}");
        }
    });

    let filter = build_filter(config.filter_data_source, config.filter_expression())
        .context("invalid filter configuration")?;
    let target = build_target(&config).context("invalid sink configuration")?;
    let liveness_deadline = config.liveness_deadline()?;

    let dead_letter = match config.dead_letter.topic()? {
        Some(topic) => {
            let handle = liveness
                .register("dead_letter_producer".to_string(), liveness_deadline)
                .await;
            let producer = create_kafka_producer(&config.kafka, handle)
                .await
                .context("failed to create dead-letter producer")?;
            Some(DeadLetter {
                producer: Box::new(KafkaDeadLetterProducer::new(
                    producer,
                    Duration::from_millis(config.kafka.kafka_message_timeout_ms.into()),
                )),
                topic: topic.to_owned(),
            })
        }
        None => None,
    };
    let sink = build_sink_chain(target, &config.retry, dead_letter)
        .context("invalid retry configuration")?;

    let tracer: Box<dyn MessageTracer> = if tracing_exported {
        Box::new(SpanTracer)
    } else {
        Box::new(NoopTracer)
    };

    let (coordinator, connect_error) = match KafkaConsumer::new(&config.kafka, &config.consumer) {
        Ok(kafka_consumer) => (
            OffsetCoordinator::new(
                Box::new(kafka_consumer),
                config.max_poll_records,
                config.poll_timeout.0,
            ),
            None,
        ),
        Err(e) => (
            OffsetCoordinator::without_consumer(config.max_poll_records, config.poll_timeout.0),
            Some(e),
        ),
    };

    let handle = liveness
        .register("consumer".to_string(), liveness_deadline)
        .await;
    let mut sink_consumer = SinkConsumer::new(coordinator, filter, sink, tracer, handle);

    if let Some(e) = connect_error {
        // Nothing was consumed, but the sink chain still has to be released.
        sink_consumer.close().await;
        return Err(e).context("failed to create kafka consumer");
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::task::spawn(async move {
        shutdown().await;
        _ = shutdown_tx.send(());
    });

    info!("starting consumer");
    let result = sink_consumer.run(shutdown_rx).await;
    sink_consumer.close().await;

    if tracing_exported {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result.context("consumer stopped on a fatal error")
}
