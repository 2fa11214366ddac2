use tracing::{info_span, Span};

use crate::message::Message;

/// Opens one span per consumed message and closes them once the iteration is done with them.
///
/// Spans are plain `tracing` spans: with the OpenTelemetry layer installed they are exported,
/// otherwise they only scope the log lines emitted while they are entered.
pub trait Tracer: Send {
    fn start_trace(&self, messages: &[Message]) -> Vec<Span>;

    fn finish_trace(&self, spans: Vec<Span>);

    /// Release the tracer. Called once, before the consumer and sink are closed.
    fn close(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpanTracer;

impl Tracer for SpanTracer {
    fn start_trace(&self, messages: &[Message]) -> Vec<Span> {
        messages
            .iter()
            .map(|message| {
                info_span!(
                    "bridge.message",
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                )
            })
            .collect()
    }

    fn finish_trace(&self, spans: Vec<Span>) {
        drop(spans);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_trace(&self, messages: &[Message]) -> Vec<Span> {
        messages.iter().map(|_| Span::none()).collect()
    }

    fn finish_trace(&self, _spans: Vec<Span>) {}
}
