use std::time::Duration;

use rdkafka::ClientConfig;

use crate::types::PartitionAssignment;

/// How the receiver obtains its partitions.
#[derive(Debug, Clone)]
pub enum Subscription {
    /// Group-managed subscription; partitions arrive via rebalance.
    Topics(Vec<String>),
    /// Static assignment; no group coordination for partition ownership.
    Assignment(Vec<PartitionAssignment>),
}

/// Configuration for a [`KafkaReceiver`](crate::receiver::KafkaReceiver).
///
/// Carries the raw rdkafka `ClientConfig` (bootstrap, group, auth - all
/// passed through untouched) plus the knobs the receiver engine itself
/// interprets: poll timeout, records per poll, commit interval and batch
/// size, stream prefetch, and the close grace period.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    client_config: ClientConfig,
    subscription: Subscription,
    poll_timeout: Duration,
    max_poll_records: usize,
    commit_interval: Duration,
    commit_batch_size: usize,
    prefetch: usize,
    close_timeout: Duration,
}

impl ReceiverOptions {
    /// Options with receiver defaults: auto commit and auto offset store
    /// disabled (the engine owns all commit traffic), plus conservative
    /// session/heartbeat settings.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self::from_client_config(config)
    }

    /// Build options around a fully caller-controlled `ClientConfig`.
    /// Callers are expected to have disabled auto commit themselves.
    pub fn from_client_config(client_config: ClientConfig) -> Self {
        Self {
            client_config,
            subscription: Subscription::Topics(Vec::new()),
            poll_timeout: Duration::from_millis(100),
            max_poll_records: 500,
            commit_interval: Duration::from_secs(5),
            commit_batch_size: 0,
            prefetch: 0,
            close_timeout: Duration::from_secs(30),
        }
    }

    /// Add any custom rdkafka configuration.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.client_config.set(key, value);
        self
    }

    /// Subscribe to the given topics (group-managed assignment).
    pub fn subscribe<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription = Subscription::Topics(topics.into_iter().map(Into::into).collect());
        self
    }

    /// Statically assign the given partitions instead of subscribing.
    pub fn assign(mut self, partitions: Vec<PartitionAssignment>) -> Self {
        self.subscription = Subscription::Assignment(partitions);
        self
    }

    /// Upper bound on how long a single poll blocks waiting for records.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Maximum records fetched and dispatched per poll cycle.
    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    /// Interval-based commit flush trigger.
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Size-based commit flush trigger: flush once this many acknowledgements
    /// have accumulated. `0` disables the size trigger (interval only).
    pub fn with_commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size;
        self
    }

    /// Demand granted up front by a delivery stream before the consumer has
    /// drawn anything. Defaults to `max_poll_records`.
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Grace period for flushing pending commits during close.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn max_poll_records(&self) -> usize {
        self.max_poll_records
    }

    pub fn commit_interval(&self) -> Duration {
        self.commit_interval
    }

    pub fn commit_batch_size(&self) -> usize {
        self.commit_batch_size
    }

    pub fn prefetch(&self) -> usize {
        if self.prefetch == 0 {
            self.max_poll_records
        } else {
            self.prefetch
        }
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }
}
