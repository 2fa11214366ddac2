use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

pub mod dead_letter;
pub mod http;
pub mod log;
pub mod retry;

/// Errors a sink raises instead of reporting failed messages. Every variant is fatal for the
/// batch: none of them is retried or dead-lettered.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("delivery can never succeed: {0}")]
    Fatal(String),
    #[error("failed to publish {message} to dead-letter topic {topic}: {reason}")]
    DeadLetterPublish {
        topic: String,
        message: String,
        reason: String,
    },
    #[error("sink is misconfigured: {0}")]
    Configuration(String),
    #[error("failed to close sink: {0}")]
    Close(String),
}

/// A delivery target. Sinks report failures and leave retry policy to their callers.
#[async_trait]
pub trait Sink: Send {
    /// Deliver a batch, returning the messages that failed. The returned messages are always
    /// taken from `messages`; an empty vector means the whole batch was delivered.
    async fn push(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SinkError>;

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
