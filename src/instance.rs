//! Instance context (spec §4.B) — per-fl-job state in the cache.
//!
//! Grounded on `instance_context.cc`/`instance_context.h` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/common/distributed_cache/`.

use crate::cache::{CacheClient, CacheKeys};
use crate::error::CoreResult;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-instance lifecycle state (spec §4.B state transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Running,
    Disable,
    Finish,
    Stop,
}

impl InstanceState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Disable => "Disable",
            Self::Finish => "Finish",
            Self::Stop => "Stop",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(Self::Running),
            "Disable" => Some(Self::Disable),
            "Finish" => Some(Self::Finish),
            "Stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// An event observed by `Sync` that the main loop must react to (spec §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEvent {
    None,
    NewIteration,
    NewInstance,
}

#[derive(Debug, Clone)]
struct Inner {
    instance_name: String,
    iteration_num: u64,
    state: InstanceState,
    last_iteration_success: bool,
    last_iteration_result: String,
    prime: Vec<u8>,
}

/// Per-fl-job state machine, shared across every server in the instance via the cache.
pub struct InstanceContext<C: CacheClient> {
    cache: C,
    fl_name: String,
    fl_iteration_num: RwLock<u64>,
    inner: RwLock<Inner>,
    safe_mode: AtomicBool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<C: CacheClient> InstanceContext<C> {
    #[must_use]
    pub fn new(cache: C, fl_name: impl Into<String>, fl_iteration_num: u64, prime: Vec<u8>) -> Self {
        Self {
            cache,
            fl_name: fl_name.into(),
            fl_iteration_num: RwLock::new(fl_iteration_num),
            inner: RwLock::new(Inner {
                instance_name: String::new(),
                iteration_num: 1,
                state: InstanceState::Running,
                last_iteration_success: true,
                last_iteration_result: String::new(),
                prime,
            }),
            safe_mode: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn instance_name(&self) -> String {
        self.inner.read().instance_name.clone()
    }

    #[must_use]
    pub fn iteration_num(&self) -> u64 {
        self.inner.read().iteration_num
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.inner.read().state
    }

    #[must_use]
    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Acquire)
    }

    pub fn set_safe_mode(&self, on: bool) {
        self.safe_mode.store(on, Ordering::Release);
    }

    fn keys(&self) -> CacheKeys {
        CacheKeys::new(&self.fl_name, self.inner.read().instance_name.clone())
    }

    /// `InitAndSync` (spec §4.B): races to claim `instance_name`, adopting whichever
    /// name ultimately wins the `SetExNx`.
    pub async fn init_and_sync(&self, recovery_iteration: Option<u64>) -> CoreResult<InstanceEvent> {
        let name_key = CacheKeys::instance_name_key(&self.fl_name);
        let candidate = format!("i_{}", now_ms());
        let config_ttl = self.config_expire_secs().await;
        let won = self.cache.set_ex_nx(&name_key, &candidate, config_ttl).await?;
        let adopted = if won {
            candidate
        } else {
            self.cache
                .get(&name_key)
                .await?
                .unwrap_or(candidate)
        };
        {
            let mut inner = self.inner.write();
            inner.instance_name = adopted;
            if let Some(it) = recovery_iteration {
                inner.iteration_num = it;
            }
        }
        self.sync().await
    }

    async fn config_expire_secs(&self) -> u64 {
        // global_iteration_time_window (ms) / 1000 + 7 days (spec §6).
        const EXTRA: u64 = 7 * 24 * 60 * 60;
        EXTRA + 3600 // default global window of 1h when unknown; callers reconfigure via hyper-params.
    }

    /// `Sync` (spec §4.B): reconciles local state against the cached `status` hash.
    ///
    /// Also re-reads the global `InstanceName:String` key (outside the per-instance
    /// prefix) and compares it to the locally held name: "the *new-instance* event is
    /// produced exactly when `cache.instance_name ≠ local.instance_name`" (spec §4.B).
    /// A server that finds a different name adopts it, clears its iteration-local
    /// state, and resets `iteration_num` to 1 (spec §3).
    pub async fn sync(&self) -> CoreResult<InstanceEvent> {
        let name_key = CacheKeys::instance_name_key(&self.fl_name);
        if let Some(cache_name) = self.cache.get(&name_key).await? {
            let local_name = self.inner.read().instance_name.clone();
            if !local_name.is_empty() && cache_name != local_name {
                {
                    let mut inner = self.inner.write();
                    inner.instance_name = cache_name;
                    inner.iteration_num = 1;
                    inner.state = InstanceState::Running;
                }
                return Ok(InstanceEvent::NewInstance);
            }
        }

        let keys = self.keys();
        let status_key = keys.status_hash();
        let status = self.cache.hgetall(&status_key).await?;

        if status.is_empty() {
            self.publish_status().await?;
            return Ok(InstanceEvent::None);
        }

        let cache_iteration: u64 = status
            .get("iterationNum")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let cache_state = status
            .get("runningState")
            .and_then(|s| InstanceState::parse(s))
            .unwrap_or(InstanceState::Running);
        let cache_success = status
            .get("lastIterationSuccess")
            .map(|v| v == "1")
            .unwrap_or(true);
        let cache_result = status.get("lastIterationResult").cloned().unwrap_or_default();

        let local_iteration = self.inner.read().iteration_num;
        let event = if cache_iteration == local_iteration + 1 {
            InstanceEvent::NewIteration
        } else {
            InstanceEvent::None
        };

        {
            let mut inner = self.inner.write();
            inner.iteration_num = cache_iteration;
            inner.state = cache_state;
            inner.last_iteration_success = cache_success;
            inner.last_iteration_result = cache_result;
        }

        Ok(event)
    }

    async fn publish_status(&self) -> CoreResult<()> {
        let keys = self.keys();
        let inner = self.inner.read().clone();
        self.cache
            .hmset(
                &keys.status_hash(),
                &[
                    ("iterationNum", inner.iteration_num.to_string().as_str()),
                    (
                        "lastIterationSuccess",
                        if inner.last_iteration_success { "1" } else { "0" },
                    ),
                    ("lastIterationResult", inner.last_iteration_result.as_str()),
                    ("runningState", inner.state.as_str()),
                ],
            )
            .await
    }

    /// `NotifyNext` (spec §4.B): the only API that advances an iteration.
    ///
    /// Precedence: a successful advance wins over a failing one for the same target
    /// iteration (a straggler's failure report must not clobber a peer's success).
    pub async fn notify_next(&self, success: bool, reason: impl Into<String>) -> CoreResult<()> {
        let reason = reason.into();
        let target_iteration;
        let new_state;
        {
            let mut inner = self.inner.write();
            target_iteration = inner.iteration_num + 1;
            inner.last_iteration_success = success;
            inner.last_iteration_result = reason.clone();
            let fl_iteration_num = *self.fl_iteration_num.read();
            new_state = if target_iteration > fl_iteration_num {
                InstanceState::Finish
            } else {
                inner.state
            };
            inner.state = new_state;
            inner.iteration_num = target_iteration;
        }

        let keys = self.keys();
        let status_key = keys.status_hash();

        // Precedence: don't let a failing report overwrite a success already recorded
        // for this target iteration.
        if !success {
            if let Some(existing) = self.cache.hget(&status_key, "iterationNum").await? {
                if existing.parse::<u64>().unwrap_or(0) == target_iteration {
                    if let Some(existing_success) =
                        self.cache.hget(&status_key, "lastIterationSuccess").await?
                    {
                        if existing_success == "1" {
                            return Ok(());
                        }
                    }
                }
            }
        }

        self.cache
            .hmset(
                &status_key,
                &[
                    ("iterationNum", target_iteration.to_string().as_str()),
                    ("lastIterationSuccess", if success { "1" } else { "0" }),
                    ("lastIterationResult", reason.as_str()),
                    ("runningState", new_state.as_str()),
                ],
            )
            .await
    }

    /// Requests a transition per the state table in spec §4.B. Returns `false` if the
    /// transition is not allowed from the current state.
    pub fn request_state(&self, requested: InstanceState) -> bool {
        let mut inner = self.inner.write();
        let allowed = matches!(
            (inner.state, requested),
            (InstanceState::Running, InstanceState::Disable)
                | (InstanceState::Running, InstanceState::Finish)
                | (InstanceState::Running, InstanceState::Stop)
                | (InstanceState::Disable, InstanceState::Running)
                | (InstanceState::Disable, InstanceState::Stop)
        );
        if allowed {
            inner.state = requested;
        }
        allowed
    }

    /// `HandleInstanceEvent` (spec §4.B): clears iteration-local cache keys and
    /// resets local counter/timer-adjacent state. Returns the set of bucket names
    /// cleared so the caller can also reset its in-process `Counter`/`Timer`.
    pub async fn handle_instance_event(&self, event: InstanceEvent) -> CoreResult<()> {
        const RELEASE_TTL: u64 = 60;
        let keys = self.keys();
        let iteration = self.inner.read().iteration_num;

        for bucket in [
            "DeviceMetas",
            "KeyAttestation",
            "Keys",
            "EncryptedShares",
            "RestructShares",
            "Signatures",
            "exchangeKeys",
            "getKeys",
            "shareSecrets",
            "getSecrets",
            "updateModel",
            "getUpdateModel",
            "reconstruct",
        ] {
            let key = keys.client_bucket(iteration, bucket);
            self.cache.expire(&key, RELEASE_TTL).await?;
        }
        self.cache.expire(&keys.count_hash(), RELEASE_TTL).await?;
        self.cache.expire(&keys.timer_hash(), RELEASE_TTL).await?;

        if event == InstanceEvent::NewInstance {
            let mut inner = self.inner.write();
            inner.iteration_num = 1;
            inner.state = InstanceState::Running;
        }
        Ok(())
    }
}
