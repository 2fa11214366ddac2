//! In-memory stand-ins for the sink, broker and dead-letter producer, for tests across the
//! workspace. State is shared between clones so a test can keep a handle after boxing one.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use tracing::Span;

use crate::filter::{Filter, FilterError, FilteredMessages};
use crate::kafka::producer::{DeadLetterProducer, KafkaProduceError};
use crate::message::{Message, Partition};
use crate::offsets::{BrokerConsumer, BrokerError};
use crate::sinks::dead_letter::RetryEnvelope;
use crate::sinks::{Sink, SinkError};
use crate::tracer::Tracer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum SinkResponse {
    Succeed,
    /// Fail the messages of the pushed batch with these offsets.
    Fail(Vec<i64>),
    Fatal(String),
}

#[derive(Default)]
struct SinkState {
    responses: VecDeque<SinkResponse>,
    calls: Vec<Vec<Message>>,
    closed: bool,
    close_error: Option<String>,
}

/// Answers pushes with scripted responses, in order. The last response repeats, and no
/// responses at all means every push succeeds.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new(responses: Vec<SinkResponse>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                responses: responses.into(),
                ..Default::default()
            })),
        }
    }

    pub fn with_close_error(self, reason: &str) -> Self {
        lock(&self.state).close_error = Some(reason.to_owned());
        self
    }

    pub fn calls(&self) -> Vec<Vec<Message>> {
        lock(&self.state).calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn push(&mut self, messages: Vec<Message>) -> Result<Vec<Message>, SinkError> {
        let mut state = lock(&self.state);
        state.calls.push(messages.clone());

        let response = if state.responses.len() > 1 {
            state.responses.pop_front()
        } else {
            state.responses.front().cloned()
        };

        match response.unwrap_or(SinkResponse::Succeed) {
            SinkResponse::Succeed => Ok(Vec::new()),
            SinkResponse::Fail(offsets) => Ok(messages
                .into_iter()
                .filter(|message| offsets.contains(&message.offset()))
                .collect()),
            SinkResponse::Fatal(reason) => Err(SinkError::Fatal(reason)),
        }
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let mut state = lock(&self.state);
        state.closed = true;
        match state.close_error.clone() {
            Some(reason) => Err(SinkError::Close(reason)),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct ProducerState {
    published: Vec<(String, RetryEnvelope)>,
    flushes: usize,
}

#[derive(Clone, Default)]
pub struct RecordingProducer {
    state: Arc<Mutex<ProducerState>>,
    failing: bool,
}

impl RecordingProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A producer whose every publish is rejected.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<(String, RetryEnvelope)> {
        lock(&self.state).published.clone()
    }

    pub fn flushes(&self) -> usize {
        lock(&self.state).flushes
    }
}

#[async_trait]
impl DeadLetterProducer for RecordingProducer {
    async fn publish(&self, topic: &str, envelope: &RetryEnvelope) -> Result<(), KafkaProduceError> {
        if self.failing {
            return Err(KafkaProduceError::KafkaProduceError {
                error: KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut),
            });
        }
        lock(&self.state)
            .published
            .push((topic.to_owned(), envelope.clone()));
        Ok(())
    }

    async fn flush(&self) -> Result<(), KafkaProduceError> {
        lock(&self.state).flushes += 1;
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerState {
    batches: VecDeque<Vec<Message>>,
    commits: Vec<Vec<(Partition, i64)>>,
    fail_next_poll: bool,
    unconsumable_polls: BTreeSet<usize>,
    fail_next_commit: bool,
    polls: usize,
    closes: usize,
}

/// Serves scripted batches, one per poll, then empty batches. A batch longer than the poll
/// bound is served over several polls.
#[derive(Clone, Default)]
pub struct MemoryConsumer {
    state: Arc<Mutex<ConsumerState>>,
}

impl MemoryConsumer {
    pub fn new(batches: Vec<Vec<Message>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsumerState {
                batches: batches.into(),
                ..Default::default()
            })),
        }
    }

    pub fn fail_next_poll(&self) {
        lock(&self.state).fail_next_poll = true;
    }

    /// Make the `poll`-th poll (counting from 1) report a record the client could not consume.
    pub fn fail_consumption_at_poll(&self, poll: usize) {
        _ = lock(&self.state).unconsumable_polls.insert(poll);
    }

    pub fn fail_next_commit(&self) {
        lock(&self.state).fail_next_commit = true;
    }

    pub fn commits(&self) -> Vec<Vec<(Partition, i64)>> {
        lock(&self.state).commits.clone()
    }

    pub fn polls(&self) -> usize {
        lock(&self.state).polls
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn poll(
        &mut self,
        max_records: usize,
        _timeout: Duration,
    ) -> Result<Vec<Message>, BrokerError> {
        let mut state = lock(&self.state);
        state.polls += 1;
        if std::mem::take(&mut state.fail_next_poll) {
            return Err(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown).into());
        }
        let poll = state.polls;
        if state.unconsumable_polls.remove(&poll) {
            return Err(KafkaError::MessageConsumption(RDKafkaErrorCode::InvalidMessage).into());
        }

        let Some(mut batch) = state.batches.pop_front() else {
            return Ok(Vec::new());
        };
        if batch.len() > max_records {
            let rest = batch.split_off(max_records);
            state.batches.push_front(rest);
        }
        Ok(batch)
    }

    async fn commit(&mut self, positions: &[(Partition, i64)]) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_commit) {
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::BrokerTransportFailure).into());
        }
        state.commits.push(positions.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        lock(&self.state).closes += 1;
        Ok(())
    }
}

/// A filter that cannot be evaluated.
#[derive(Debug, Clone, Default)]
pub struct FailingFilter;

impl Filter for FailingFilter {
    fn apply(&self, _messages: Vec<Message>) -> Result<FilteredMessages, FilterError> {
        Err(FilterError::Evaluation("predicate backend unavailable".to_owned()))
    }
}

#[derive(Default)]
struct TracerState {
    started: usize,
    finished: usize,
    closed: bool,
}

/// Counts spans instead of emitting them.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    state: Arc<Mutex<TracerState>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        lock(&self.state).started
    }

    pub fn finished(&self) -> usize {
        lock(&self.state).finished
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Tracer for RecordingTracer {
    fn start_trace(&self, messages: &[Message]) -> Vec<Span> {
        lock(&self.state).started += messages.len();
        messages.iter().map(|_| Span::none()).collect()
    }

    fn finish_trace(&self, spans: Vec<Span>) {
        lock(&self.state).finished += spans.len();
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}
