use async_trait::async_trait;
use tracing::{error, warn};

use crate::backoff::ExponentialBackoff;
use crate::message::Message;
use crate::metrics_consts::{SINK_FATAL_ERRORS, SINK_MESSAGES_EXHAUSTED, SINK_MESSAGES_RETRIED};
use crate::sinks::{Sink, SinkError};

/// Wraps a sink and re-pushes the messages it reports as failed, waiting out an exponential
/// backoff between attempts.
///
/// `max_attempts` bounds the number of retries after the first push. `None` retries forever:
/// a downstream that never recovers then halts consumption entirely.
pub struct RetrySink {
    inner: Box<dyn Sink>,
    backoff: ExponentialBackoff,
    max_attempts: Option<u32>,
}

impl RetrySink {
    pub fn new(inner: Box<dyn Sink>, backoff: ExponentialBackoff, max_attempts: Option<u32>) -> Self {
        Self {
            inner,
            backoff,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Push with retries, returning the messages still failing once the bound is reached along
    /// with the number of retries that were made.
    pub async fn push_with_retries(
        &mut self,
        messages: Vec<Message>,
    ) -> Result<(Vec<Message>, u32), SinkError> {
        let mut attempt = 0;
        let mut remaining = messages;

        loop {
            let failed = match self.inner.push(remaining).await {
                Ok(failed) => failed,
                Err(e) => {
                    metrics::counter!(SINK_FATAL_ERRORS).increment(1);
                    error!(attempt, "sink raised a fatal error, not retrying: {e}");
                    return Err(e);
                }
            };

            if failed.is_empty() {
                return Ok((failed, attempt));
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                metrics::counter!(SINK_MESSAGES_EXHAUSTED).increment(failed.len() as u64);
                warn!(
                    attempts = attempt,
                    failed = failed.len(),
                    "retries exhausted with messages still failing"
                );
                return Ok((failed, attempt));
            }

            let delay = self.backoff.next(attempt);
            warn!(
                attempt,
                failed = failed.len(),
                delay_ms = delay.as_millis() as u64,
                "sink reported failed messages, retrying after backoff"
            );
            self.backoff.wait(delay).await;

            attempt += 1;
            metrics::counter!(SINK_MESSAGES_RETRIED).increment(failed.len() as u64);
            remaining = failed;
        }
    }
}

#[async_trait]
impl Sink for RetrySink {
    async fn push(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SinkError> {
        let (failed, _) = self.push_with_retries(messages).await?;
        Ok(failed)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.inner.close().await
    }
}
