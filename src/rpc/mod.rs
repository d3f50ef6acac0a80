//! Server-to-server RPC plane (spec §4.J) — ping-pong liveness checks, counter/event
//! broadcast, model pull/push, and the collective (ring all-reduce) chunk exchange.
//!
//! Grounded on `server_node.cc`/`collective_ops_impl.cc` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/`.

pub mod mock;
pub mod tcp;

use crate::error::CoreResult;
use crate::model::Model;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates process-wide unique request ids for RPC request/reply matching
/// (spec §4.J: "`request_id` is allocated from a process-wide atomic counter").
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[must_use]
pub fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Ring all-reduce phase tag carried in [`CollectiveMessageMeta`] (spec §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum CollectivePhase {
    ReduceScatter,
    AllGather,
}

/// Matches a chunk send with its corresponding receive (spec §4.J: "recv-side waits
/// for a matching meta").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct CollectiveMessageMeta {
    pub iteration: u64,
    pub weight_name: String,
    pub phase: CollectivePhase,
    pub chunk_index: usize,
    pub for_index: usize,
    pub send_node: String,
    pub recv_node: String,
}

/// `SERVER_BROADCAST_EVENT` payload (spec §4.J table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub count_name: String,
    pub trigger_first: bool,
    pub trigger_last: bool,
    pub cur_iteration_num: u64,
}

/// Transport-agnostic server-to-server link (spec §4.J). Implementations: a
/// real TCP transport ([`tcp::TcpServerLink`]) and an in-process mock for tests
/// ([`mock::InMemoryServerLink`]).
#[allow(async_fn_in_trait)]
pub trait ServerLink: Clone + Send + Sync + 'static {
    /// `SERVER_PING` / `SERVER_PONG`: `true` once the peer has answered.
    async fn ping(&self, node_id: &str, addr: &str) -> CoreResult<bool>;

    /// `SERVER_BROADCAST_EVENT`.
    async fn broadcast_event(&self, node_id: &str, addr: &str, event: BroadcastEvent) -> CoreResult<()>;

    /// `GET_MODEL_WEIGHT`: `None` if the peer lacks that iteration.
    async fn get_model_weight(&self, node_id: &str, addr: &str, iteration: u64) -> CoreResult<Option<Model>>;

    /// `BROADCAST_MODEL_WEIGHT`.
    async fn broadcast_model_weight(&self, node_id: &str, addr: &str, iteration: u64, model: &Model) -> CoreResult<()>;

    /// Sends one ring-all-reduce chunk to `addr`/`node_id` (spec §4.I/§4.J
    /// "Collective (ring chunk)").
    async fn send_chunk(&self, node_id: &str, addr: &str, meta: CollectiveMessageMeta, data: Vec<f32>) -> CoreResult<()>;

    /// Blocks (with a 30s timeout per spec §4.J) until a chunk matching `meta`
    /// has arrived, then returns it.
    async fn recv_chunk(&self, meta: &CollectiveMessageMeta) -> CoreResult<Vec<f32>>;
}

pub const RPC_TIMEOUT_SECS: u64 = 30;
