use bridge_common::kafka::producer::DeadLetterProducer;
use bridge_common::sinks::dead_letter::DeadLetterSink;
use bridge_common::sinks::http::HttpSink;
use bridge_common::sinks::log::LogSink;
use bridge_common::sinks::retry::RetrySink;
use bridge_common::sinks::Sink;
use tracing::info;

use crate::config::{Config, RetryConfig, SinkType};
use crate::error::SetupError;

/// Where exhausted messages go when dead-lettering is enabled.
pub struct DeadLetter {
    pub producer: Box<dyn DeadLetterProducer>,
    pub topic: String,
}

/// Build the delivery target selected by `SINK_TYPE`.
pub fn build_target(config: &Config) -> Result<Box<dyn Sink>, SetupError> {
    match config.sink_type {
        SinkType::Log => Ok(Box::new(LogSink)),
        SinkType::Http => {
            let url = config.http_sink_url.as_ref().ok_or_else(|| {
                SetupError::Configuration("SINK_TYPE is http but HTTP_SINK_URL is missing".into())
            })?;
            let sink = HttpSink::new(
                url.as_str(),
                &config.http_sink_headers.0,
                config.http_sink_timeout.0,
            )?
            .with_method(config.http_sink_method);
            Ok(Box::new(sink))
        }
    }
}

/// Wrap `target` in the retry decorator, and that in the dead-letter decorator when one is given.
pub fn build_sink_chain(
    target: Box<dyn Sink>,
    retry: &RetryConfig,
    dead_letter: Option<DeadLetter>,
) -> Result<Box<dyn Sink>, SetupError> {
    let max_attempts = retry.max_attempts();
    let retry_sink = RetrySink::new(target, retry.backoff()?, max_attempts);

    match dead_letter {
        Some(DeadLetter { producer, topic }) => {
            info!(?max_attempts, topic = %topic, "delivering with retries and dead-lettering");
            Ok(Box::new(DeadLetterSink::new(retry_sink, producer, &topic)))
        }
        None => {
            info!(?max_attempts, "delivering with retries, dead-lettering disabled");
            Ok(Box::new(retry_sink))
        }
    }
}
