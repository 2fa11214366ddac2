// ==== Consumer loop metrics ====
/// Counter for records read from the broker and run through an iteration
pub const CONSUMER_PROCESSED_RECORDS: &str = "bridge_consumer_processed_records_total";

/// Histogram for the wall time of a whole consumer iteration, empty polls included
pub const CONSUMER_ITERATION_DURATION_SECONDS: &str = "bridge_consumer_iteration_duration_seconds";

/// Counter for iterations aborted by a fatal error
pub const CONSUMER_FAILED_ITERATIONS: &str = "bridge_consumer_failed_iterations_total";

/// Histogram for the number of records returned by one poll
pub const CONSUMER_BATCH_SIZE: &str = "bridge_consumer_batch_size";

/// Counter for errors reported by the kafka consumer, labelled by `level` and `error`
pub const KAFKA_CONSUMER_ERRORS: &str = "bridge_kafka_consumer_errors_total";

// ==== Filter metrics ====
/// Counter for records classified by the filter, labelled by `result` (valid/invalid)
pub const FILTER_RECORDS: &str = "bridge_filter_records_total";

// ==== Sink metrics ====
/// Counter for messages handed to the sink chain
pub const SINK_MESSAGES_PUSHED: &str = "bridge_sink_messages_pushed_total";

/// Counter for messages re-pushed after a failed attempt
pub const SINK_MESSAGES_RETRIED: &str = "bridge_sink_messages_retried_total";

/// Counter for messages still failing when the retry bound is reached
pub const SINK_MESSAGES_EXHAUSTED: &str = "bridge_sink_messages_exhausted_total";

/// Histogram for each backoff wait
pub const SINK_BACKOFF_WAIT_SECONDS: &str = "bridge_sink_backoff_wait_seconds";

/// Counter for messages published to the dead-letter topic
pub const SINK_MESSAGES_DEAD_LETTERED: &str = "bridge_sink_messages_dead_lettered_total";

/// Counter for fatal delivery errors raised by a sink or the dead-letter producer
pub const SINK_FATAL_ERRORS: &str = "bridge_sink_fatal_errors_total";

/// Histogram for the duration of a single HTTP delivery request
pub const HTTP_SINK_REQUEST_DURATION_SECONDS: &str = "bridge_http_sink_request_duration_seconds";

// ==== Offset metrics ====
/// Counter for offsets marked committable, labelled by `outcome` (delivered/filtered)
pub const OFFSETS_MARKED_COMMITTABLE: &str = "bridge_offsets_marked_committable_total";

/// Counter for successful broker commits
pub const OFFSET_COMMITS: &str = "bridge_offset_commits_total";

/// Gauge for the last committed message offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "bridge_partition_last_committed_offset";

/// Gauge for committable offsets held back behind a gap, per partition
pub const PARTITION_BLOCKED_OFFSETS: &str = "bridge_partition_blocked_offsets";

/// Counter for offsets the broker skipped between two consecutive polled records
pub const PARTITION_SKIPPED_OFFSETS: &str = "bridge_partition_skipped_offsets_total";
