//! Core error types.
//!
//! Mirrors the teacher's `Layer5Error` shape (`layer5_business_logic/shared/error.rs`):
//! a plain enum with a hand-written `Display`/`Error` impl instead of `thiserror`,
//! plus `From` conversions for the error types that actually cross into this crate
//! on the hot path.

use std::fmt;

/// Result type alias used throughout the coordination core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Caller-visible retcode, returned to clients by the round dispatcher (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RetCode {
    Succeed,
    SucNotReady,
    OutOfTime,
    RequestError,
    SystemError,
    JobNotAvailable,
    ClusterSafeMode,
}

/// Internal error taxonomy (spec §7).
#[derive(Debug)]
pub enum CoreError {
    /// Cache backend unreachable after the single retry (§4.A).
    Unavailable(String),
    /// Payload invalid: schema, iteration mismatch, bad signature, unknown fl_id, missing upstream round.
    RequestError(String),
    /// Unexpected inner failure.
    SystemError(String),
    /// A peer RPC timed out or the reply could not be parsed.
    RpcTimeout(String),
    /// Fatal condition: process should exit non-zero after stopped-callbacks run.
    Fatal(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "cache unavailable: {msg}"),
            Self::RequestError(msg) => write!(f, "request error: {msg}"),
            Self::SystemError(msg) => write!(f, "system error: {msg}"),
            Self::RpcTimeout(msg) => write!(f, "rpc timeout: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::SystemError(e.to_string())
    }
}

impl CoreError {
    /// Round dispatcher translation (spec §4.G step 4 / §7).
    #[must_use]
    pub fn to_retcode(&self) -> RetCode {
        match self {
            Self::Unavailable(_) => RetCode::JobNotAvailable,
            Self::RequestError(_) => RetCode::RequestError,
            Self::RpcTimeout(_) => RetCode::OutOfTime,
            Self::SystemError(_) | Self::Fatal(_) => RetCode::SystemError,
        }
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
