//! Non-cipher round kernels (spec §4.G/§4.H): `startFLJob`, `updateModel`,
//! `getModel`, `pullWeight`, `pushWeight`, `pushMetrics`.
//!
//! Grounded on `round_kernel.cc`/`fl_context.cc` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/kernel/round/`.
//! Each kernel is a free function rather than a trait method: the round
//! dispatcher (`mod.rs`) already owns admission; these only need the handful
//! of collaborators a given round actually touches.

use crate::cache::{CacheClient, CacheKeys};
use crate::cipher::{AttestationResult, CipherModule};
use crate::compression::{CompressType, Compression};
use crate::counter::{Counter, CounterEvent};
use crate::error::{CoreError, CoreResult, RetCode};
use crate::instance::InstanceContext;
use crate::model::executor::Executor;
use crate::model::{bytes_as_f32, Model};
use crate::registry::ServerRegistry;
use crate::rpc::ServerLink;
use crate::summary::Summary;
use crate::timer::Timer;

use super::{RoundPayload, RoundResponse};

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Participation-time histogram edges (spec §3 "participation-time histogram");
/// not named as a hyper-param in spec §6, so this kernel derives them from
/// `start_fl_job_time_window` as thirds of the window (documented in DESIGN.md).
fn participation_buckets_ms(start_fl_job_time_window_ms: u64) -> (u64, u64) {
    (start_fl_job_time_window_ms / 3, start_fl_job_time_window_ms * 2 / 3)
}

fn device_meta_key(keys: &CacheKeys, iteration: u64) -> String {
    keys.client_bucket(iteration, "DeviceMetas")
}

/// `startFLJob` (spec §4.G/§4.H): admits a client into the current iteration,
/// idempotent per `fl_id`, and returns the latest materialized model.
pub async fn start_fl_job<C: CacheClient, Ci: CipherModule>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    timer: &Timer<C>,
    cipher: &Ci,
    executor: &Executor,
    replay_window_ms: u64,
    fl_id: &str,
    data_size: f64,
    eval_data_size: f64,
    timestamp_ms: u64,
    signature: &[u8],
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    match cipher.verify_attestation(fl_id, timestamp_ms, iteration, signature, now_ms(), replay_window_ms) {
        AttestationResult::Timeout => {
            return Ok(RoundResponse::error(RetCode::OutOfTime, iteration, "unknown fl_id"));
        }
        AttestationResult::Failed => {
            return Ok(RoundResponse::error(RetCode::RequestError, iteration, "bad attestation signature"));
        }
        AttestationResult::Passed => {}
    }

    let bucket = keys.client_bucket(iteration, "startFLJob");
    let already_joined = cache.sismember(&bucket, fl_id).await?;
    if !already_joined {
        cache.sadd(&bucket, fl_id).await?;
        let meta_json = serde_json::to_string(&(data_size, eval_data_size, timestamp_ms))?;
        cache.hset(&device_meta_key(keys, iteration), fl_id, &meta_json).await?;
        let events = counter.count(&instance.instance_name(), "startFLJob").await?;
        // "the first-count handler starts the round's timer, the last-count
        // handler stops it" (spec.md:129).
        if events.contains(&CounterEvent::First) {
            timer.start(&instance.instance_name(), "startFLJob").await?;
        }
        if events.contains(&CounterEvent::Last) {
            timer.stop(&instance.instance_name(), "startFLJob").await?;
        }
    }

    let Some((_, model)) = executor.get_latest_model() else {
        return Ok(RoundResponse::error(RetCode::SystemError, iteration, "model not initialized"));
    };
    Ok(RoundResponse::ok(iteration, RoundPayload::StartFlJobAccepted { selected: true, model }))
}

/// `updateModel` (spec §4.G/§4.H): decodes the client's weight upload,
/// accumulates it into the aggregation buffer, and counts toward both
/// `updateModel` and the per-server `count_for_aggregation` counter.
#[allow(clippy::too_many_arguments)]
pub async fn update_model<C: CacheClient, Ci: CipherModule, Co: Compression>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    timer: &Timer<C>,
    registry: &ServerRegistry<C>,
    cipher: &Ci,
    compression: &Co,
    executor: &Executor,
    summary: &Summary,
    replay_window_ms: u64,
    start_fl_job_time_window_ms: u64,
    fl_id: &str,
    iteration: u64,
    timestamp_ms: u64,
    signature: &[u8],
    compress_type: &str,
    weight_bytes: &HashMap<String, Vec<u8>>,
    data_size: f64,
    upload_loss: f64,
    upload_accuracy: f64,
) -> CoreResult<RoundResponse> {
    let current_iteration = instance.iteration_num();
    if iteration != current_iteration {
        return Ok(RoundResponse::error(
            RetCode::RequestError,
            current_iteration,
            format!("iteration mismatch: client={iteration} server={current_iteration}"),
        ));
    }

    match cipher.verify_attestation(fl_id, timestamp_ms, iteration, signature, now_ms(), replay_window_ms) {
        AttestationResult::Timeout => {
            return Ok(RoundResponse::error(RetCode::OutOfTime, current_iteration, "unknown fl_id"));
        }
        AttestationResult::Failed => {
            return Ok(RoundResponse::error(RetCode::RequestError, current_iteration, "bad attestation signature"));
        }
        AttestationResult::Passed => {}
    }

    let Some((_, base_model)) = executor.get_latest_model() else {
        return Ok(RoundResponse::error(RetCode::SystemError, current_iteration, "model not initialized"));
    };

    let mut data = vec![0u8; base_model.total_size];
    for (name, item) in &base_model.weight_items {
        let Some(bytes) = weight_bytes.get(name) else {
            continue;
        };
        let decoded = compression.decode(CompressType::parse(compress_type), bytes, item.element_count())?;
        let encoded = crate::model::f32_vec_to_bytes(&decoded);
        data[item.offset..item.offset + item.size].copy_from_slice(&encoded);
    }
    let update = Model::new(data, base_model.weight_items.clone());

    let bucket = keys.client_bucket(current_iteration, "updateModel");
    let already_updated = cache.sismember(&bucket, fl_id).await?;
    if already_updated {
        return Ok(RoundResponse::ok(current_iteration, RoundPayload::None));
    }

    executor.handle_model_update(&base_model, &update, data_size)?;
    cache.sadd(&bucket, fl_id).await?;
    let events = counter.count(&instance.instance_name(), "updateModel").await?;
    if events.contains(&CounterEvent::First) {
        timer.start(&instance.instance_name(), "updateModel").await?;
    }
    if events.contains(&CounterEvent::Last) {
        timer.stop(&instance.instance_name(), "updateModel").await?;
    }
    counter
        .count_per_server(&instance.instance_name(), "count_for_aggregation", registry)
        .await?;

    summary.with_accumulator(|acc| {
        acc.record_accept("updateModel");
        acc.record_upload_loss(upload_loss);
        acc.record_upload_accuracy(upload_accuracy);
    });

    if let Some(started_json) = cache.hget(&device_meta_key(keys, current_iteration), fl_id).await? {
        if let Ok((_, _, started_ms)) = serde_json::from_str::<(f64, f64, u64)>(&started_json) {
            let participation_ms = now_ms().saturating_sub(started_ms);
            let (l1, l2) = participation_buckets_ms(start_fl_job_time_window_ms);
            summary.with_accumulator(|acc| acc.record_participation_time(participation_ms, l1, l2));
        }
    }

    Ok(RoundResponse::ok(current_iteration, RoundPayload::None))
}

/// `getModel` (spec §4.G/§4.I): a past iteration is always materialized; the
/// current iteration is only served once aggregation has completed, otherwise
/// `SucNotReady`.
pub async fn get_model<C: CacheClient>(
    instance: &InstanceContext<C>,
    executor: &Executor,
    requested_iteration: u64,
    next_req_time_ms: u64,
) -> CoreResult<RoundResponse> {
    let current_iteration = instance.iteration_num();
    if requested_iteration > current_iteration {
        return Ok(RoundResponse::error(
            RetCode::RequestError,
            current_iteration,
            "requested iteration has not started yet",
        ));
    }

    if requested_iteration < current_iteration {
        return match executor.get_model(requested_iteration) {
            Some(model) => Ok(RoundResponse::ok(current_iteration, RoundPayload::Model { model })),
            None => Ok(RoundResponse::error(RetCode::RequestError, current_iteration, "model no longer retained")),
        };
    }

    if executor.aggregation_done() {
        let Some((_, model)) = executor.get_latest_model() else {
            return Ok(RoundResponse::error(RetCode::SystemError, current_iteration, "model not initialized"));
        };
        Ok(RoundResponse::ok(current_iteration, RoundPayload::Model { model }))
    } else {
        Ok(RoundResponse::not_ready(current_iteration, next_req_time_ms))
    }
}

/// `pullWeight` (spec §4.G/§4.I): same gating as `getModel` restricted to the
/// current iteration, used by clients polling for the freshly aggregated model
/// after `updateModel`. An *aggregation-skipper* server (one excluded from the
/// ring because it had no contributors) forwards to a peer that did aggregate,
/// reusing `GET_MODEL_WEIGHT` (SPEC_FULL §C: `SERVER_PULL_WEIGHT` collapses
/// into `GET_MODEL_WEIGHT` here since both fetch a peer's materialized model
/// for an iteration).
pub async fn pull_weight<C: CacheClient, L: ServerLink>(
    instance: &InstanceContext<C>,
    executor: &Executor,
    link: &L,
    peers: &[(String, String)],
    iteration: u64,
    next_req_time_ms: u64,
) -> CoreResult<RoundResponse> {
    let current_iteration = instance.iteration_num();
    if iteration != current_iteration {
        return Ok(RoundResponse::error(RetCode::RequestError, current_iteration, "iteration mismatch"));
    }

    if executor.aggregation_done() {
        let Some((_, model)) = executor.get_latest_model() else {
            return Ok(RoundResponse::error(RetCode::SystemError, current_iteration, "model not initialized"));
        };
        return Ok(RoundResponse::ok(current_iteration, RoundPayload::Model { model }));
    }

    for (node_id, addr) in peers {
        if let Some(model) = link.get_model_weight(node_id, addr, iteration).await? {
            return Ok(RoundResponse::ok(current_iteration, RoundPayload::Model { model }));
        }
    }
    Ok(RoundResponse::not_ready(current_iteration, next_req_time_ms))
}

/// `pushWeight` (spec §4.G/§4.I): overwrites the local model store entry and
/// broadcasts it to every live peer, used by an aggregation-skipper's peer to
/// push it the freshly aggregated model proactively.
pub async fn push_weight<C: CacheClient, L: ServerLink>(
    executor: &Executor,
    link: &L,
    peers: &[(String, String)],
    iteration: u64,
    model: Model,
) -> CoreResult<RoundResponse> {
    executor.overwrite(iteration, model.clone());
    for (node_id, addr) in peers {
        link.broadcast_model_weight(node_id, addr, iteration, &model).await?;
    }
    Ok(RoundResponse::ok(iteration, RoundPayload::None))
}

/// `pushMetrics` (spec §4.G/§4.H): records a client-reported loss/accuracy into
/// the running summary.
pub fn push_metrics<C: CacheClient>(
    instance: &InstanceContext<C>,
    summary: &Summary,
    _fl_id: &str,
    loss: f64,
    accuracy: Option<f64>,
) -> RoundResponse {
    summary.with_accumulator(|acc| {
        acc.record_upload_loss(loss);
        if let Some(acc_value) = accuracy {
            acc.record_upload_accuracy(acc_value);
        }
    });
    RoundResponse::ok(instance.iteration_num(), RoundPayload::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheClient;
    use crate::cipher::PermissiveCipherModule;
    use crate::compression::IdentityCompression;
    use crate::counter::Counter;
    use crate::model::{f32_vec_to_bytes, WeightItem};
    use crate::registry::ServerRegistry;
    use crate::rpc::mock::InMemoryNetwork;
    use crate::timer::Timer;
    use std::collections::BTreeMap;

    fn seeded_executor() -> Executor {
        let executor = Executor::new(3);
        let mut items = BTreeMap::new();
        items.insert(
            "w".to_string(),
            WeightItem {
                offset: 0,
                size: 8,
                shape: vec![2],
                dtype: "f32".to_string(),
                require_aggr: true,
            },
        );
        executor.initialize(1, Model::new(f32_vec_to_bytes(&[0.0, 0.0]), items));
        executor
    }

    #[tokio::test]
    async fn start_fl_job_is_idempotent_per_client() {
        let cache = InMemoryCacheClient::new();
        let instance = InstanceContext::new(cache.clone(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let keys = CacheKeys::new("lenet", instance.instance_name());
        let counter = Counter::new(cache.clone(), "lenet", 3_600_000);
        counter.register("startFLJob", 3, false);
        let timer = Timer::new(cache.clone(), "lenet", 3_600_000);
        timer.register("startFLJob", 600);
        let cipher = PermissiveCipherModule::new();
        let executor = seeded_executor();

        let r1 = start_fl_job(&cache, &keys, &instance, &counter, &timer, &cipher, &executor, 300_000, "c1", 1.0, 1.0, now_ms(), b"sig")
            .await
            .unwrap();
        assert_eq!(r1.retcode, RetCode::Succeed);
        let r2 = start_fl_job(&cache, &keys, &instance, &counter, &timer, &cipher, &executor, 300_000, "c1", 1.0, 1.0, now_ms(), b"sig")
            .await
            .unwrap();
        assert_eq!(r2.retcode, RetCode::Succeed);
        // A replayed startFLJob from the same client must not double-count toward the threshold.
        assert!(!counter.reach_threshold(&instance.instance_name(), "startFLJob").await.unwrap());
    }

    #[tokio::test]
    async fn start_fl_job_rejects_unknown_client() {
        let cache = InMemoryCacheClient::new();
        let instance = InstanceContext::new(cache.clone(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let keys = CacheKeys::new("lenet", instance.instance_name());
        let counter = Counter::new(cache.clone(), "lenet", 3_600_000);
        counter.register("startFLJob", 3, false);
        let timer = Timer::new(cache.clone(), "lenet", 3_600_000);
        timer.register("startFLJob", 600);
        let cipher = PermissiveCipherModule::new();
        cipher.mark_unknown_client("ghost");
        let executor = seeded_executor();

        let response = start_fl_job(&cache, &keys, &instance, &counter, &timer, &cipher, &executor, 300_000, "ghost", 1.0, 1.0, now_ms(), b"sig")
            .await
            .unwrap();
        assert_eq!(response.retcode, RetCode::OutOfTime);
    }

    #[tokio::test]
    async fn update_model_rejects_stale_iteration() {
        let cache = InMemoryCacheClient::new();
        let instance = InstanceContext::new(cache.clone(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let keys = CacheKeys::new("lenet", instance.instance_name());
        let counter = Counter::new(cache.clone(), "lenet", 3_600_000);
        counter.register("updateModel", 3, false);
        counter.register("count_for_aggregation", 3, true);
        let timer = Timer::new(cache.clone(), "lenet", 3_600_000);
        timer.register("updateModel", 600);
        let registry = ServerRegistry::new(cache.clone(), "lenet", "node-a", "addr-a");
        registry.sync(&instance.instance_name()).await.unwrap();
        let cipher = PermissiveCipherModule::new();
        let compression = IdentityCompression;
        let executor = seeded_executor();
        executor.reset_aggregation_status(&executor.get_latest_model().unwrap().1);
        let summary = Summary::new("node-a");

        let response = update_model(
            &cache, &keys, &instance, &counter, &timer, &registry, &cipher, &compression, &executor, &summary,
            300_000, 300_000, "c1", 999, now_ms(), b"sig", "NO_COMPRESS", &HashMap::new(), 1.0, 0.1, 0.9,
        )
        .await
        .unwrap();
        assert_eq!(response.retcode, RetCode::RequestError);
    }

    #[tokio::test]
    async fn update_model_accumulates_and_counts_once_per_client() {
        let cache = InMemoryCacheClient::new();
        let instance = InstanceContext::new(cache.clone(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let keys = CacheKeys::new("lenet", instance.instance_name());
        let counter = Counter::new(cache.clone(), "lenet", 3_600_000);
        counter.register("updateModel", 3, false);
        counter.register("count_for_aggregation", 3, true);
        let timer = Timer::new(cache.clone(), "lenet", 3_600_000);
        timer.register("updateModel", 600);
        let registry = ServerRegistry::new(cache.clone(), "lenet", "node-a", "addr-a");
        registry.sync(&instance.instance_name()).await.unwrap();
        let cipher = PermissiveCipherModule::new();
        let compression = IdentityCompression;
        let executor = seeded_executor();
        executor.reset_aggregation_status(&executor.get_latest_model().unwrap().1);
        let summary = Summary::new("node-a");

        let mut weight_bytes = HashMap::new();
        weight_bytes.insert("w".to_string(), f32_vec_to_bytes(&[2.0, 4.0]));

        let response = update_model(
            &cache, &keys, &instance, &counter, &timer, &registry, &cipher, &compression, &executor, &summary,
            300_000, 300_000, "c1", 1, now_ms(), b"sig", "NO_COMPRESS", &weight_bytes, 10.0, 0.1, 0.9,
        )
        .await
        .unwrap();
        assert_eq!(response.retcode, RetCode::Succeed);
        assert_eq!(executor.aggregation_data_size(), 10.0);

        // Replaying the same fl_id does not double count.
        let replay = update_model(
            &cache, &keys, &instance, &counter, &timer, &registry, &cipher, &compression, &executor, &summary,
            300_000, 300_000, "c1", 1, now_ms(), b"sig", "NO_COMPRESS", &weight_bytes, 10.0, 0.1, 0.9,
        )
        .await
        .unwrap();
        assert_eq!(replay.retcode, RetCode::Succeed);
        assert_eq!(executor.aggregation_data_size(), 10.0);
    }

    #[tokio::test]
    async fn get_model_returns_not_ready_until_aggregation_done() {
        let cache = InMemoryCacheClient::new();
        let instance = InstanceContext::new(cache.clone(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let executor = seeded_executor();

        let response = get_model(&instance, &executor, instance.iteration_num(), 500).await.unwrap();
        assert_eq!(response.retcode, RetCode::SucNotReady);
    }

    #[tokio::test]
    async fn pull_weight_forwards_to_a_peer_that_has_aggregated() {
        let cache = InMemoryCacheClient::new();
        let instance = InstanceContext::new(cache.clone(), "lenet", 5, vec![]);
        instance.init_and_sync(None).await.unwrap();
        let executor = seeded_executor();

        let net = InMemoryNetwork::new();
        let link = net.link_for("node-a");
        let peer_link = net.link_for("node-b");
        let mut items = BTreeMap::new();
        items.insert(
            "w".to_string(),
            WeightItem { offset: 0, size: 4, shape: vec![1], dtype: "f32".to_string(), require_aggr: true },
        );
        let peer_model = Model::new(f32_vec_to_bytes(&[7.0]), items);
        peer_link
            .broadcast_model_weight("node-b", "addr-b", instance.iteration_num(), &peer_model)
            .await
            .unwrap();

        let peers = vec![("node-b".to_string(), "addr-b".to_string())];
        let response = pull_weight(&instance, &executor, &link, &peers, instance.iteration_num(), 500)
            .await
            .unwrap();
        assert_eq!(response.retcode, RetCode::Succeed);
    }
}
