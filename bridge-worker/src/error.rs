use bridge_common::filter::FilterError;
use bridge_common::offsets::BrokerError;
use bridge_common::sinks::SinkError;
use thiserror::Error;

/// Errors that abort a consumer iteration. None of them is retried by the consumer: the process
/// stops, and the uncommitted offsets are read again after a restart.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("failed to filter batch: {0}")]
    Filter(#[from] FilterError),
    #[error("failed to deliver batch: {0}")]
    Delivery(#[from] SinkError),
    #[error("{0} messages exhausted their retries and dead-lettering is disabled")]
    UnresolvedMessages(usize),
}

/// Errors raised while wiring the bridge together at startup.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to build sink: {0}")]
    Sink(#[from] SinkError),
}
