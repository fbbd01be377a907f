//! Engine configuration.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the producer and the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of actions running at once in one scheduler.
    pub worker_count: usize,
    /// Maximum number of ready tasks fetched per dispatch cycle.
    pub dispatch_batch: usize,
    /// Sleep between dispatch cycles when no work was found.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long a task may stay `Running` before it is presumed lost.
    #[serde(with = "duration_ms")]
    pub lease_timeout: Duration,
    /// Interval of the stale-lease sweep.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Deadline placed on every action run unless the step overrides it.
    #[serde(with = "opt_duration_ms")]
    pub task_timeout: Option<Duration>,
    /// Upper bound on the page size accepted by `list_flows`.
    pub max_list_page: usize,
    /// Retry policy applied to transient action errors.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            dispatch_batch: 32,
            poll_interval: Duration::from_millis(100),
            lease_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            task_timeout: None,
            max_list_page: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_dispatch_batch(mut self, dispatch_batch: usize) -> Self {
        self.dispatch_batch = dispatch_batch.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_max_list_page(mut self, max: usize) -> Self {
        self.max_list_page = max.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
