// Metric names emitted by the receiver engine.

pub const RECORDS_DELIVERED: &str = "kafka_receiver_records_delivered";
pub const RECORDS_DISCARDED_REVOKED: &str = "kafka_receiver_records_discarded_revoked";
pub const BATCH_SIZE: &str = "kafka_receiver_batch_size";

pub const COMMITS_ISSUED: &str = "kafka_receiver_commits_issued";
pub const COMMIT_FAILURES: &str = "kafka_receiver_commit_failures";
pub const COMMIT_ENTRIES_DROPPED: &str = "kafka_receiver_commit_entries_dropped";
pub const REVOKE_FLUSHES: &str = "kafka_receiver_revoke_flushes";

pub const POLL_ERRORS: &str = "kafka_receiver_poll_errors";
pub const DEMAND_PAUSES: &str = "kafka_receiver_demand_pauses";
pub const ACTIONS_EXECUTED: &str = "kafka_receiver_actions_executed";
