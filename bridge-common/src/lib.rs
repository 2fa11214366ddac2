pub mod backoff;
pub mod filter;
pub mod health;
pub mod kafka;
pub mod message;
pub mod metrics;
pub mod metrics_consts;
pub mod offsets;
pub mod sinks;
pub mod test_utils;
pub mod tracer;
