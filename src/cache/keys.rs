//! Cache key schema (spec §6): `ms_fl:<fl_name>:<instance_name>:*`.
//!
//! Grounded on the original's `RedisKeys` helper
//! (`distributed_cache/redis_keys.h`) — one place that knows how every other
//! subsystem names its cache rows, so no call site hand-builds a key string.

/// Renders the instance-scoped key schema from spec §6.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    fl_name: String,
    instance_name: String,
}

impl CacheKeys {
    #[must_use]
    pub fn new(fl_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            fl_name: fl_name.into(),
            instance_name: instance_name.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("ms_fl:{}:{}:", self.fl_name, self.instance_name)
    }

    /// The global key a server races on to claim `instance_name` (not instance-scoped).
    #[must_use]
    pub fn instance_name_key(fl_name: &str) -> String {
        format!("ms_fl:{fl_name}:InstanceName")
    }

    #[must_use]
    pub fn status_hash(&self) -> String {
        format!("{}status", self.prefix())
    }

    #[must_use]
    pub fn hyper_params(&self) -> String {
        format!("{}hyperParams", self.prefix())
    }

    #[must_use]
    pub fn server_hash(&self) -> String {
        format!("{}server", self.prefix())
    }

    #[must_use]
    pub fn server_heartbeat(&self, node_id: &str) -> String {
        format!("{}server:heartbeat:{}", self.prefix(), node_id)
    }

    #[must_use]
    pub fn server_reg_lock(&self) -> String {
        format!("{}server:regLock", self.prefix())
    }

    #[must_use]
    pub fn count_hash(&self) -> String {
        format!("{}count", self.prefix())
    }

    #[must_use]
    pub fn count_per_server_hash(&self, name: &str) -> String {
        format!("{}count:{}", self.prefix(), name)
    }

    #[must_use]
    pub fn timer_hash(&self) -> String {
        format!("{}timer", self.prefix())
    }

    #[must_use]
    pub fn summary_hash(&self) -> String {
        format!("{}summary", self.prefix())
    }

    #[must_use]
    pub fn summary_lock(&self) -> String {
        format!("{}summaryLock", self.prefix())
    }

    /// Per-iteration client-record bucket, e.g. `DeviceMetas`, `Keys`, `updateModel`.
    #[must_use]
    pub fn client_bucket(&self, iteration_num: u64, bucket: &str) -> String {
        format!("{}client:{}:{}", self.prefix(), iteration_num, bucket)
    }

    /// Response cache key for a served `getModel` reply.
    #[must_use]
    pub fn response_cache(&self, round: &str, cur_iter: u64, model_iter: u64, compress_type: &str) -> String {
        format!(
            "{}respcache:{}:{}:{}:{}",
            self.prefix(),
            round,
            cur_iter,
            model_iter,
            compress_type
        )
    }
}
