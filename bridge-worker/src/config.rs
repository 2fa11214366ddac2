use std::collections::HashMap;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use bridge_common::backoff::ExponentialBackoff;
use bridge_common::filter::FilterDataSource;
use bridge_common::kafka::config::{ConsumerConfig, KafkaConfig};
use bridge_common::sinks::http::HttpSinkMethod;

use crate::error::SetupError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "1000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    #[envconfig(nested = true)]
    pub dead_letter: DeadLetterConfig,

    #[envconfig(default = "none")]
    pub filter_data_source: FilterDataSource,

    pub filter_expression: Option<NonEmptyString>,

    #[envconfig(default = "log")]
    pub sink_type: SinkType,

    pub http_sink_url: Option<NonEmptyString>,

    #[envconfig(default = "POST")]
    pub http_sink_method: HttpSinkMethod,

    #[envconfig(default = "5000")]
    pub http_sink_timeout: EnvMsDuration,

    #[envconfig(default = "")]
    pub http_sink_headers: HeaderList,

    // Must cover the longest stretch between two iterations: a poll plus every backoff wait of
    // one batch. A consumer stuck retrying past it reports as stalled.
    #[envconfig(default = "300000")]
    pub liveness_deadline: EnvMsDuration,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "sink-bridge")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: tracing::Level,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn filter_expression(&self) -> Option<&str> {
        self.filter_expression.as_ref().map(NonEmptyString::as_str)
    }

    /// The liveness deadline as expected by the health registry.
    pub fn liveness_deadline(&self) -> Result<::time::Duration, SetupError> {
        ::time::Duration::try_from(self.liveness_deadline.0).map_err(|e| {
            SetupError::Configuration(format!("liveness deadline out of range: {e}"))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryConfig {
    /// Retries after the first push. 0 retries forever.
    #[envconfig(default = "5")]
    pub retry_max_attempts: u32,

    #[envconfig(default = "100")]
    pub retry_initial_interval: EnvMsDuration,

    #[envconfig(default = "2.0")]
    pub retry_backoff_rate: f64,

    #[envconfig(default = "10000")]
    pub retry_maximum_interval: EnvMsDuration,
}

impl RetryConfig {
    pub fn max_attempts(&self) -> Option<u32> {
        match self.retry_max_attempts {
            0 => None,
            max => Some(max),
        }
    }

    /// Waits must never shrink between attempts, so the rate is at least 1.
    pub fn backoff(&self) -> Result<ExponentialBackoff, SetupError> {
        let rate = self.retry_backoff_rate;
        if !rate.is_finite() || rate < 1.0 {
            return Err(SetupError::Configuration(format!(
                "RETRY_BACKOFF_RATE must be a finite number of at least 1, got {rate}"
            )));
        }

        Ok(ExponentialBackoff::new(
            rate,
            self.retry_initial_interval.0,
            self.retry_maximum_interval.0,
        ))
    }
}

#[derive(Envconfig, Clone)]
pub struct DeadLetterConfig {
    #[envconfig(default = "false")]
    pub dlq_enabled: bool,

    pub dlq_topic: Option<NonEmptyString>,
}

impl DeadLetterConfig {
    /// The topic to dead-letter to, or None when dead-lettering is disabled.
    pub fn topic(&self) -> Result<Option<&str>, SetupError> {
        match (self.dlq_enabled, &self.dlq_topic) {
            (false, _) => Ok(None),
            (true, Some(topic)) => Ok(Some(topic.as_str())),
            (true, None) => Err(SetupError::Configuration(
                "DLQ_ENABLED is set but DLQ_TOPIC is missing".to_owned(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkType {
    Log,
    Http,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSinkTypeError(String);

impl FromStr for SinkType {
    type Err = ParseSinkTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(SinkType::Log),
            "http" => Ok(SinkType::Http),
            other => Err(ParseSinkTypeError(other.to_owned())),
        }
    }
}

/// HTTP headers given as `name:value` pairs separated by commas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(pub HashMap<String, String>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseHeaderListError(String);

impl FromStr for HeaderList {
    type Err = ParseHeaderListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    Ok((name.trim().to_owned(), value.trim().to_owned()))
                }
                _ => Err(ParseHeaderListError(pair.to_owned())),
            })
            .collect::<Result<HashMap<_, _>, _>>()
            .map(HeaderList)
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
