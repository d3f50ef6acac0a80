//! Metrics file writers (spec §6): `metrics.json` (one appended line per
//! finished iteration) and `data_rate.<date>.<address>.json` (one appended
//! line per second of measured send/receive bytes).
//!
//! Grounded on `read_to_string`/file-serving in the teacher's
//! `features/dashboard/handlers.rs`, generalized from read to append-write.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// One line of `metrics.json` (spec §6 summary-metrics schema).
#[derive(Debug, Clone, Serialize)]
pub struct IterationMetrics {
    pub instance_name: String,
    pub fl_name: String,
    pub instance_status: String,
    pub fl_iteration_num: u64,
    pub current_iteration: u64,
    pub metrics_loss: Option<f64>,
    pub metrics_accuracy: Option<f64>,
    pub unsupervised_eval: Option<f64>,
    pub client_visited_info: ClientVisitedInfo,
    pub iteration_result: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub iteration_execution_time_ms: u64,
}

/// Per-round accept/reject/total counts carried inside [`IterationMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct ClientVisitedInfo {
    pub round_counts: std::collections::HashMap<String, (u64, u64)>,
}

/// Appends one JSON line to `metrics.json` under `dir` (spec §6). Creates the
/// file if absent; never truncates, matching the original's append-only log.
pub async fn append_iteration_metrics(dir: &Path, record: &IterationMetrics) -> std::io::Result<()> {
    append_json_line(&dir.join("metrics.json"), record).await
}

/// One second of measured wire traffic for `data_rate.<date>.<address>.json`
/// (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct DataRateSample {
    pub time_ms: u64,
    pub send_bytes: u64,
    pub receive_bytes: u64,
}

/// Path for the current day's data-rate log, e.g. `data_rate.2026-07-27.10.0.0.1_9000.json`.
#[must_use]
pub fn data_rate_path(dir: &Path, date: &str, address: &str) -> PathBuf {
    let sanitized_address = address.replace([':', '/'], "_");
    dir.join(format!("data_rate.{date}.{sanitized_address}.json"))
}

pub async fn append_data_rate_sample(dir: &Path, date: &str, address: &str, sample: &DataRateSample) -> std::io::Result<()> {
    append_json_line(&data_rate_path(dir, date, address), sample).await
}

async fn append_json_line<T: Serialize>(path: &Path, record: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await
}

/// Accumulates per-second send/receive byte counters for one bound address,
/// flushed to disk by the service's periodic tick (spec §6).
#[derive(Debug, Default)]
pub struct DataRateCounter {
    send_bytes: std::sync::atomic::AtomicU64,
    receive_bytes: std::sync::atomic::AtomicU64,
}

impl DataRateCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self, bytes: u64) {
        self.send_bytes.fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_receive(&self, bytes: u64) {
        self.receive_bytes.fetch_add(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    /// Drains the accumulated counters into a sample, resetting both to zero.
    pub fn take_sample(&self, now_ms: u64) -> DataRateSample {
        DataRateSample {
            time_ms: now_ms,
            send_bytes: self.send_bytes.swap(0, std::sync::atomic::Ordering::Relaxed),
            receive_bytes: self.receive_bytes.swap(0, std::sync::atomic::Ordering::Relaxed),
        }
    }
}
