//! Hyper-parameters and process bootstrap config (spec §6, SPEC_FULL §A/§C).
//!
//! `FLContext` is the "struct populated by the binding" spec §6 describes; here it is
//! populated from environment variables the way the teacher's `state.rs`/`main.rs`
//! read `DATABASE_URL`/`HOST`/`PORT` via `dotenvy`.

use serde::{Deserialize, Serialize};

/// Encryption mode (`hyperParams.encrypt_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncryptType {
    NotEncrypt,
    DpEncrypt,
    PwEncrypt,
    StablePwEncrypt,
    Signds,
}

/// The `hyperParams:String` JSON blob (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperParams {
    pub start_fl_job_threshold: u64,
    pub start_fl_job_time_window: u64,
    pub update_model_time_window: u64,
    pub client_epoch_num: u64,
    pub client_batch_size: u64,
    pub fl_iteration_num: u64,
    pub global_iteration_time_window: u64,
    pub cipher_time_window: u64,
    pub reconstruct_secrets_threshold: u64,
    pub sign_dim_out: u64,

    pub update_model_ratio: f64,
    pub client_learning_rate: f64,
    pub share_secrets_ratio: f64,
    pub dp_eps: f64,
    pub dp_delta: f64,
    pub dp_norm_clip: f64,
    pub sign_k: f64,
    pub sign_eps: f64,
    pub sign_thr_ratio: f64,
    pub sign_global_lr: f64,
    pub laplace_eval_eps: f64,

    pub encrypt_type: EncryptType,
    pub upload_compress_type: String,
    pub download_compress_type: String,

    pub secure_aggregation: bool,
    pub enable_ssl: bool,
    pub pki_verify: bool,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            start_fl_job_threshold: 1,
            start_fl_job_time_window: 300_000,
            update_model_time_window: 300_000,
            client_epoch_num: 1,
            client_batch_size: 32,
            fl_iteration_num: 20,
            global_iteration_time_window: 3_600_000,
            cipher_time_window: 300_000,
            reconstruct_secrets_threshold: 1,
            sign_dim_out: 0,
            update_model_ratio: 1.0,
            client_learning_rate: 0.1,
            share_secrets_ratio: 1.0,
            dp_eps: 50.0,
            dp_delta: 0.01,
            dp_norm_clip: 1.0,
            sign_k: 0.2,
            sign_eps: 100.0,
            sign_thr_ratio: 0.6,
            sign_global_lr: 1.0,
            laplace_eval_eps: 1.0,
            encrypt_type: EncryptType::NotEncrypt,
            upload_compress_type: "NO_COMPRESS".to_string(),
            download_compress_type: "NO_COMPRESS".to_string(),
            secure_aggregation: false,
            enable_ssl: false,
            pki_verify: false,
        }
    }
}

/// Partial update posted by the scheduler's `/newInstance` (spec §6). Only provided
/// keys overwrite the cached config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HyperParamsUpdate {
    pub start_fl_job_threshold: Option<u64>,
    pub start_fl_job_time_window: Option<u64>,
    pub update_model_time_window: Option<u64>,
    pub client_epoch_num: Option<u64>,
    pub client_batch_size: Option<u64>,
    pub fl_iteration_num: Option<u64>,
    pub global_iteration_time_window: Option<u64>,
    pub cipher_time_window: Option<u64>,
    pub reconstruct_secrets_threshold: Option<u64>,
    pub sign_dim_out: Option<u64>,
    pub update_model_ratio: Option<f64>,
    pub client_learning_rate: Option<f64>,
    pub share_secrets_ratio: Option<f64>,
    pub dp_eps: Option<f64>,
    pub dp_delta: Option<f64>,
    pub dp_norm_clip: Option<f64>,
    pub sign_k: Option<f64>,
    pub sign_eps: Option<f64>,
    pub sign_thr_ratio: Option<f64>,
    pub sign_global_lr: Option<f64>,
    pub laplace_eval_eps: Option<f64>,
    pub encrypt_type: Option<EncryptType>,
    pub upload_compress_type: Option<String>,
    pub download_compress_type: Option<String>,
    pub secure_aggregation: Option<bool>,
    pub enable_ssl: Option<bool>,
    pub pki_verify: Option<bool>,
}

/// Error returned when a `/newInstance`-style update fails validation (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperParamsValidationError(pub String);

impl std::fmt::Display for HyperParamsValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid hyper-params: {}", self.0)
    }
}

impl std::error::Error for HyperParamsValidationError {}

impl HyperParams {
    /// Applies `update` on top of `self`, validating the merge rules from spec §6:
    /// all integers must be unsigned > 0, `update_model_ratio ∈ (0,1]`,
    /// `client_learning_rate > 0`.
    pub fn merge(&self, update: &HyperParamsUpdate) -> Result<Self, HyperParamsValidationError> {
        let mut next = self.clone();

        macro_rules! merge_u64 {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    if v == 0 {
                        return Err(HyperParamsValidationError(format!(
                            "{} must be > 0",
                            stringify!($field)
                        )));
                    }
                    next.$field = v;
                }
            };
        }
        merge_u64!(start_fl_job_threshold);
        merge_u64!(start_fl_job_time_window);
        merge_u64!(update_model_time_window);
        merge_u64!(client_epoch_num);
        merge_u64!(client_batch_size);
        merge_u64!(fl_iteration_num);
        merge_u64!(global_iteration_time_window);
        merge_u64!(cipher_time_window);
        merge_u64!(reconstruct_secrets_threshold);

        if let Some(v) = update.sign_dim_out {
            next.sign_dim_out = v;
        }

        if let Some(v) = update.update_model_ratio {
            if !(v > 0.0 && v <= 1.0) {
                return Err(HyperParamsValidationError(
                    "update_model_ratio must be in (0, 1]".to_string(),
                ));
            }
            next.update_model_ratio = v;
        }
        if let Some(v) = update.client_learning_rate {
            if !(v > 0.0) {
                return Err(HyperParamsValidationError(
                    "client_learning_rate must be > 0".to_string(),
                ));
            }
            next.client_learning_rate = v;
        }

        macro_rules! merge_f64 {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    next.$field = v;
                }
            };
        }
        merge_f64!(share_secrets_ratio);
        merge_f64!(dp_eps);
        merge_f64!(dp_delta);
        merge_f64!(dp_norm_clip);
        merge_f64!(sign_k);
        merge_f64!(sign_eps);
        merge_f64!(sign_thr_ratio);
        merge_f64!(sign_global_lr);
        merge_f64!(laplace_eval_eps);

        if let Some(v) = update.encrypt_type {
            next.encrypt_type = v;
        }
        if let Some(v) = &update.upload_compress_type {
            next.upload_compress_type = v.clone();
        }
        if let Some(v) = &update.download_compress_type {
            next.download_compress_type = v.clone();
        }
        if let Some(v) = update.secure_aggregation {
            next.secure_aggregation = v;
        }
        if let Some(v) = update.enable_ssl {
            next.enable_ssl = v;
        }
        if let Some(v) = update.pki_verify {
            next.pki_verify = v;
        }

        Ok(next)
    }
}

/// Process bootstrap configuration — the fields spec §6 says come from the Python
/// binding's `FLContext`, here read from the environment via `dotenvy`.
#[derive(Debug, Clone)]
pub struct FLContext {
    pub fl_name: String,
    pub server_id: String,
    pub redis_url: String,
    pub tcp_bind_addr: String,
    pub redis_pool_size: u32,
    /// Iteration to resume at on restart, or `None` for a fresh instance.
    pub recovery_iteration: Option<u64>,
}

impl FLContext {
    /// Reads process configuration from the environment (`dotenvy::dotenv` should
    /// already have been called by the binary entry point).
    pub fn from_env() -> anyhow::Result<Self> {
        use std::env;
        Ok(Self {
            fl_name: env::var("FL_NAME").unwrap_or_else(|_| "fl_job".to_string()),
            server_id: env::var("FL_SERVER_ID")
                .unwrap_or_else(|_| format!("node-{}", rand::random::<u16>())),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            tcp_bind_addr: env::var("FL_TCP_BIND").unwrap_or_else(|_| "0.0.0.0:0".to_string()),
            redis_pool_size: env::var("REDIS_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            recovery_iteration: env::var("FL_RECOVERY_ITERATION")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_only_overwrites_provided_keys() {
        let base = HyperParams::default();
        let update = HyperParamsUpdate {
            fl_iteration_num: Some(5),
            ..Default::default()
        };
        let merged = base.merge(&update).unwrap();
        assert_eq!(merged.fl_iteration_num, 5);
        assert_eq!(merged.client_batch_size, base.client_batch_size);
    }

    #[test]
    fn merge_rejects_zero_threshold() {
        let base = HyperParams::default();
        let update = HyperParamsUpdate {
            start_fl_job_threshold: Some(0),
            ..Default::default()
        };
        assert!(base.merge(&update).is_err());
    }

    #[test]
    fn merge_rejects_update_model_ratio_out_of_range() {
        let base = HyperParams::default();
        for bad in [0.0, -0.1, 1.5] {
            let update = HyperParamsUpdate {
                update_model_ratio: Some(bad),
                ..Default::default()
            };
            assert!(base.merge(&update).is_err(), "{bad} should be rejected");
        }
        let update = HyperParamsUpdate {
            update_model_ratio: Some(1.0),
            ..Default::default()
        };
        assert!(base.merge(&update).is_ok());
    }

    #[test]
    fn merge_rejects_non_positive_learning_rate() {
        let base = HyperParams::default();
        let update = HyperParamsUpdate {
            client_learning_rate: Some(0.0),
            ..Default::default()
        };
        assert!(base.merge(&update).is_err());
    }
}
