// ==== Poll loop ====
/// Counter for records handed to the host
pub const RECORDS_DELIVERED: &str = "kafka_poller_records_delivered_total";

/// Histogram for records returned by a single poll
pub const POLL_BATCH_SIZE: &str = "kafka_poller_poll_batch_size";

/// Counter for host commands applied, labelled by kind
pub const COMMANDS_APPLIED: &str = "kafka_poller_commands_applied_total";

/// Counter for acknowledgements of partitions no longer owned
pub const STALE_ACKNOWLEDGEMENTS: &str = "kafka_poller_stale_acknowledgements_total";

/// Counter for fatal loop errors, labelled by error type
pub const POLLER_FATAL_ERRORS: &str = "kafka_poller_fatal_errors_total";

// ==== Backpressure ====
/// Counter for partitions paused because of unacknowledged buffer usage
pub const PARTITIONS_PAUSED: &str = "kafka_poller_partitions_paused_total";

/// Counter for partitions resumed after the host caught up
pub const PARTITIONS_RESUMED: &str = "kafka_poller_partitions_resumed_total";

/// Gauge for partitions currently held paused
pub const PAUSED_PARTITIONS: &str = "kafka_poller_paused_partitions";

// ==== Commits ====
/// Counter for commit calls, labelled by trigger and outcome
pub const OFFSET_COMMITS: &str = "kafka_poller_offset_commits_total";

/// Counter for pending commits dropped because the partition was lost
pub const COMMITS_DISCARDED: &str = "kafka_poller_commits_discarded_total";

// ==== Rebalance ====
/// Counter for rebalance events, labelled by event type
pub const REBALANCE_EVENTS: &str = "kafka_poller_rebalance_events_total";

/// Counter for empty rebalances skipped (cooperative-sticky no-ops)
pub const REBALANCE_EMPTY_SKIPPED: &str = "kafka_poller_rebalance_empty_skipped_total";
