use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{Method, StatusCode};
use reqwest::header;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::message::Message;
use crate::metrics_consts::{HTTP_SINK_REQUEST_DURATION_SECONDS, SINK_MESSAGES_PUSHED};
use crate::sinks::{Sink, SinkError};

/// The request method used to deliver each message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpSinkMethod {
    #[default]
    Post,
    Put,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unsupported http sink method: {0}")]
pub struct ParseHttpSinkMethodError(String);

impl FromStr for HttpSinkMethod {
    type Err = ParseHttpSinkMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(HttpSinkMethod::Post),
            "PUT" => Ok(HttpSinkMethod::Put),
            other => Err(ParseHttpSinkMethodError(other.to_owned())),
        }
    }
}

impl From<HttpSinkMethod> for Method {
    fn from(method: HttpSinkMethod) -> Self {
        match method {
            HttpSinkMethod::Post => Method::POST,
            HttpSinkMethod::Put => Method::PUT,
        }
    }
}

enum Delivery {
    Delivered,
    Failed,
}

/// Sends each message value to a fixed endpoint, one request per message, in batch order. Requests
/// are POSTs unless another method is set with `with_method`.
///
/// Any response or transport error the endpoint may recover from puts the message in the failed
/// subset, leaving the retry decision to the caller. An authentication rejection will not go
/// away by retrying and is raised as a fatal error instead.
pub struct HttpSink {
    client: reqwest::Client,
    url: reqwest::Url,
    method: Method,
}

impl HttpSink {
    pub fn new(
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let url: reqwest::Url = url
            .parse()
            .map_err(|e| SinkError::Configuration(format!("invalid url {url}: {e}")))?;

        let mut default_headers: header::HeaderMap = headers
            .try_into()
            .map_err(|e: http::Error| SinkError::Configuration(format!("invalid headers: {e}")))?;
        default_headers
            .entry(header::CONTENT_TYPE)
            .or_insert(header::HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .user_agent("sink-bridge")
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Configuration(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            url,
            method: Method::POST,
        })
    }

    pub fn with_method(mut self, method: HttpSinkMethod) -> Self {
        self.method = method.into();
        self
    }

    async fn send(&self, message: &Message) -> Result<Delivery, SinkError> {
        let start = Instant::now();
        let result = self
            .client
            .request(self.method.clone(), self.url.clone())
            .body(message.value().to_vec())
            .send()
            .await;
        metrics::histogram!(HTTP_SINK_REQUEST_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(message = %message, "http delivery failed: {e}");
                return Ok(Delivery::Failed);
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(message = %message, status = status.as_u16(), "delivered");
            return Ok(Delivery::Delivered);
        }

        if is_fatal_status(status) {
            error!(message = %message, status = status.as_u16(), "endpoint rejected credentials");
            return Err(SinkError::Fatal(format!(
                "{} responded with {status}",
                self.url
            )));
        }

        warn!(message = %message, status = status.as_u16(), "endpoint did not accept message");
        Ok(Delivery::Failed)
    }
}

fn is_fatal_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl Sink for HttpSink {
    async fn push(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SinkError> {
        metrics::counter!(SINK_MESSAGES_PUSHED, "sink" => "http").increment(messages.len() as u64);

        let mut failed = Vec::new();
        for message in messages {
            match self.send(&message).await? {
                Delivery::Delivered => {}
                Delivery::Failed => failed.push(message),
            }
        }

        Ok(failed)
    }
}
