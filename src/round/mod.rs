//! Round dispatcher (spec §4.G) — validates and executes each client request
//! against a table of configured rounds, each bound to a counter/timer pair.
//!
//! Grounded on `round.cc`/`round.h` and `iteration.cc` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/`.
//! The tagged-variant [`RoundRequest`]/[`RoundResponse`] below replaces the
//! original's flatbuffer union (SPEC_FULL §C design note): the flatbuffer codec
//! itself is an out-of-scope external collaborator (spec.md §1).

pub mod cipher_rounds;
pub mod kernels;

use crate::cache::CacheClient;
use crate::error::{CoreError, CoreResult, RetCode};
use crate::instance::{InstanceContext, InstanceState};
use crate::model::Model;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One configured round (spec §4.G: "name, a threshold, a time-window, and a kernel").
#[derive(Debug, Clone)]
pub struct RoundConfig {
    pub name: String,
    pub threshold: u64,
    pub time_window_secs: u64,
    pub per_server: bool,
}

/// Client-request payloads (SPEC_FULL §C: tagged-variant stand-in for the
/// flatbuffer union spec.md §6 describes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoundRequest {
    StartFlJob {
        fl_id: String,
        data_size: f64,
        eval_data_size: f64,
        timestamp_ms: u64,
        signature: Vec<u8>,
    },
    UpdateModel {
        fl_id: String,
        iteration: u64,
        timestamp_ms: u64,
        signature: Vec<u8>,
        compress_type: String,
        weight_bytes: HashMap<String, Vec<u8>>,
        data_size: f64,
        upload_loss: f64,
        upload_accuracy: f64,
    },
    GetModel {
        iteration: u64,
    },
    PullWeight {
        iteration: u64,
    },
    PushWeight {
        iteration: u64,
        model: Model,
    },
    PushMetrics {
        fl_id: String,
        loss: f64,
        accuracy: Option<f64>,
    },
    ExchangeKeys {
        fl_id: String,
        dh_prime: Vec<u8>,
        c_pk: Vec<u8>,
        s_pk: Vec<u8>,
    },
    GetKeys,
    ShareSecrets {
        fl_id: String,
        encrypted_shares: Vec<u8>,
    },
    GetSecrets,
    GetClientList,
    ReconstructSecrets {
        fl_id: String,
        shares: Vec<(String, Vec<u8>)>,
    },
    PushListSign {
        fl_id: String,
        signature: Vec<u8>,
    },
    GetListSign,
}

impl RoundRequest {
    #[must_use]
    pub fn round_name(&self) -> &'static str {
        match self {
            Self::StartFlJob { .. } => "startFLJob",
            Self::UpdateModel { .. } => "updateModel",
            Self::GetModel { .. } => "getModel",
            Self::PullWeight { .. } => "pullWeight",
            Self::PushWeight { .. } => "pushWeight",
            Self::PushMetrics { .. } => "pushMetrics",
            Self::ExchangeKeys { .. } => "exchangeKeys",
            Self::GetKeys => "getKeys",
            Self::ShareSecrets { .. } => "shareSecrets",
            Self::GetSecrets => "getSecrets",
            Self::GetClientList => "getClientList",
            Self::ReconstructSecrets { .. } => "reconstructSecrets",
            Self::PushListSign { .. } => "pushListSign",
            Self::GetListSign => "getListSign",
        }
    }
}

/// Response payload carried alongside the common envelope (spec §6: "All
/// responses carry `retcode`, `reason`, `iteration`, `next_req_time`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoundPayload {
    None,
    StartFlJobAccepted { selected: bool, model: Model },
    Model { model: Model },
    ClientList { fl_ids: Vec<String> },
    Keys { entries: HashMap<String, Vec<u8>> },
    Secrets { entries: HashMap<String, Vec<u8>> },
    Signatures { entries: HashMap<String, Vec<u8>> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResponse {
    pub retcode: RetCode,
    pub reason: String,
    pub iteration: u64,
    pub next_req_time: u64,
    pub payload: RoundPayload,
}

impl RoundResponse {
    #[must_use]
    pub fn ok(iteration: u64, payload: RoundPayload) -> Self {
        Self {
            retcode: RetCode::Succeed,
            reason: String::new(),
            iteration,
            next_req_time: 0,
            payload,
        }
    }

    #[must_use]
    pub fn not_ready(iteration: u64, next_req_time: u64) -> Self {
        Self {
            retcode: RetCode::SucNotReady,
            reason: "not ready".to_string(),
            iteration,
            next_req_time,
            payload: RoundPayload::None,
        }
    }

    #[must_use]
    pub fn error(retcode: RetCode, iteration: u64, reason: impl Into<String>) -> Self {
        Self {
            retcode,
            reason: reason.into(),
            iteration,
            next_req_time: 0,
            payload: RoundPayload::None,
        }
    }
}

/// Holds the registered round table and performs the four-step validation from
/// spec §4.G; the actual per-round business logic lives in [`kernels`] and
/// [`cipher_rounds`] and is invoked by the caller after `admit` returns `Ok(())`.
pub struct RoundDispatcher {
    rounds: HashMap<String, RoundConfig>,
}

impl RoundDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self { rounds: HashMap::new() }
    }

    pub fn register(&mut self, round: RoundConfig) {
        self.rounds.insert(round.name.clone(), round);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RoundConfig> {
        self.rounds.get(name)
    }

    /// Steps 1-3 of spec §4.G's dispatch algorithm; step 4 (invoke the kernel,
    /// catch `Unavailable`/other errors) is the caller's responsibility since it
    /// needs the concrete kernel's async body.
    pub fn admit<C: CacheClient>(
        &self,
        round_name: &str,
        instance: &InstanceContext<C>,
        cache_unavailable: bool,
    ) -> Result<(), RoundResponse> {
        let iteration = instance.iteration_num();
        let is_get_model = round_name == "getModel";

        if matches!(instance.state(), InstanceState::Disable | InstanceState::Finish) && !is_get_model {
            return Err(RoundResponse::error(RetCode::JobNotAvailable, iteration, "instance not available"));
        }
        if instance.is_safe_mode() {
            return Err(RoundResponse::error(RetCode::ClusterSafeMode, iteration, "cluster is in safe mode"));
        }
        if cache_unavailable && !is_get_model {
            return Err(RoundResponse::error(RetCode::JobNotAvailable, iteration, "cache unavailable"));
        }
        Ok(())
    }

    /// Step 4's catch-all translation (spec §4.G: "catch `Unavailable` (return
    /// `kJobNotAvailable`) and any other exception (return `kServerInnerError`)").
    #[must_use]
    pub fn translate_kernel_error(iteration: u64, err: &CoreError) -> RoundResponse {
        if err.is_unavailable() {
            RoundResponse::error(RetCode::JobNotAvailable, iteration, err.to_string())
        } else {
            RoundResponse::error(err.to_retcode(), iteration, err.to_string())
        }
    }
}

impl Default for RoundDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_round_table(hyper: &crate::config::HyperParams) -> Vec<RoundConfig> {
    vec![
        RoundConfig {
            name: "startFLJob".to_string(),
            threshold: hyper.start_fl_job_threshold,
            time_window_secs: hyper.start_fl_job_time_window / 1000,
            per_server: false,
        },
        RoundConfig {
            name: "updateModel".to_string(),
            threshold: (hyper.start_fl_job_threshold as f64 * hyper.update_model_ratio) as u64,
            time_window_secs: hyper.update_model_time_window / 1000,
            per_server: false,
        },
        RoundConfig {
            name: "count_for_aggregation".to_string(),
            threshold: (hyper.start_fl_job_threshold as f64 * hyper.update_model_ratio) as u64,
            time_window_secs: hyper.update_model_time_window / 1000,
            per_server: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::instance::InstanceContext;

    #[tokio::test]
    async fn admit_rejects_non_getmodel_when_finished() {
        let instance = InstanceContext::new(InMemoryCacheClient::new(), "lenet", 1, vec![]);
        instance.init_and_sync(None).await.unwrap();
        instance.notify_next(true, "done").await.unwrap();
        let dispatcher = RoundDispatcher::new();
        let result = dispatcher.admit("updateModel", &instance, false);
        assert!(result.is_err());
        assert!(dispatcher.admit("getModel", &instance, false).is_ok());
    }

    #[tokio::test]
    async fn admit_rejects_everything_in_safe_mode() {
        let instance = InstanceContext::new(InMemoryCacheClient::new(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        instance.set_safe_mode(true);
        let dispatcher = RoundDispatcher::new();
        let err = dispatcher.admit("startFLJob", &instance, false).unwrap_err();
        assert_eq!(err.retcode, RetCode::ClusterSafeMode);
    }

    #[tokio::test]
    async fn admit_lets_get_model_through_when_cache_unavailable() {
        let instance = InstanceContext::new(InMemoryCacheClient::new(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let dispatcher = RoundDispatcher::new();
        assert!(dispatcher.admit("getModel", &instance, true).is_ok());
        assert!(dispatcher.admit("startFLJob", &instance, true).is_err());
    }
}
