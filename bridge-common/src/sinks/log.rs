use async_trait::async_trait;
use tracing::info;

use crate::message::Message;
use crate::metrics_consts::SINK_MESSAGES_PUSHED;
use crate::sinks::{Sink, SinkError};

/// Writes every message to the log. Never fails, useful to dry-run a filter against a topic.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn push(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SinkError> {
        for message in &messages {
            info!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                key = %String::from_utf8_lossy(message.key()),
                value = %String::from_utf8_lossy(message.value()),
                "received message"
            );
        }
        metrics::counter!(SINK_MESSAGES_PUSHED, "sink" => "log").increment(messages.len() as u64);

        Ok(Vec::new())
    }
}
