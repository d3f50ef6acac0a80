//! End-to-end scenarios over mock transports (spec §8): deterministic, no
//! Redis or real network required.

use std::collections::BTreeMap;

use fl_coordinator_core::cache::{CacheClient, CacheKeys, InMemoryCacheClient};
use fl_coordinator_core::cipher::PermissiveCipherModule;
use fl_coordinator_core::compression::IdentityCompression;
use fl_coordinator_core::config::{FLContext, HyperParams};
use fl_coordinator_core::model::{f32_vec_to_bytes, Model, WeightItem};
use fl_coordinator_core::round::{RoundPayload, RoundRequest, RoundResponse};
use fl_coordinator_core::rpc::mock::InMemoryNetwork;
use fl_coordinator_core::service::Service;
use fl_coordinator_core::unsupervised::NoUnsupervisedEval;

type TestService = Service<InMemoryCacheClient, fl_coordinator_core::rpc::mock::InMemoryServerLink, PermissiveCipherModule, IdentityCompression, NoUnsupervisedEval>;

fn ctx(fl_name: &str, server_id: &str, addr: &str) -> FLContext {
    FLContext {
        fl_name: fl_name.to_string(),
        server_id: server_id.to_string(),
        redis_url: "redis://unused".to_string(),
        tcp_bind_addr: addr.to_string(),
        redis_pool_size: 1,
        recovery_iteration: None,
    }
}

fn seed_model() -> Model {
    let mut items = BTreeMap::new();
    items.insert(
        "w".to_string(),
        WeightItem { offset: 0, size: 8, shape: vec![2], dtype: "f32".to_string(), require_aggr: true },
    );
    Model::new(f32_vec_to_bytes(&[0.0, 0.0]), items)
}

async fn build_server(
    fl_name: &str,
    server_id: &str,
    addr: &str,
    cache: InMemoryCacheClient,
    network: &InMemoryNetwork,
    hyper: HyperParams,
) -> TestService {
    build_server_with_cipher(fl_name, server_id, addr, cache, network, hyper, PermissiveCipherModule::new()).await
}

async fn build_server_with_cipher(
    fl_name: &str,
    server_id: &str,
    addr: &str,
    cache: InMemoryCacheClient,
    network: &InMemoryNetwork,
    hyper: HyperParams,
    cipher: PermissiveCipherModule,
) -> TestService {
    let link = network.link_for(server_id);
    let service = Service::new(
        &ctx(fl_name, server_id, addr),
        cache,
        link,
        cipher,
        IdentityCompression,
        NoUnsupervisedEval,
        hyper,
        vec![2, 3, 5, 7],
        std::env::temp_dir().join(format!("fl_scenario_{server_id}_{}", std::process::id())),
    );
    service.seed_initial_model(seed_model());
    service.bootstrap(None).await.unwrap();
    service
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn signed_request(_fl_id: &str) -> (u64, Vec<u8>) {
    (now_ms(), vec![1, 2, 3])
}

/// S1 (spec §8): one server, one client — startFLJob, updateModel, aggregation,
/// then getModel serves the aggregated result.
#[tokio::test]
async fn single_server_happy_path() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams { start_fl_job_threshold: 1, update_model_time_window: 60, ..Default::default() };
    let server = build_server("lenet", "node-a", "addr-a", cache, &network, hyper).await;

    let (timestamp_ms, signature) = signed_request("client-1");
    let start = server
        .dispatch(RoundRequest::StartFlJob {
            fl_id: "client-1".to_string(),
            data_size: 100.0,
            eval_data_size: 10.0,
            timestamp_ms,
            signature: signature.clone(),
        })
        .await;
    assert_eq!(start.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // `handle_model_update` adds an already data-size-weighted contribution and
    // `run_weight_aggregation` divides the ring-summed total by the summed data
    // sizes, so a single contributor's own weighting cancels out here.
    let mut weight_bytes = std::collections::HashMap::new();
    weight_bytes.insert("w".to_string(), f32_vec_to_bytes(&[1.0, 1.0]));
    let update = server
        .dispatch(RoundRequest::UpdateModel {
            fl_id: "client-1".to_string(),
            iteration: 1,
            timestamp_ms,
            signature,
            compress_type: "NO_COMPRESS".to_string(),
            weight_bytes,
            data_size: 1.0,
            upload_loss: 0.3,
            upload_accuracy: 0.9,
        })
        .await;
    assert_eq!(update.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // A single-server ring is trivially complete; the updateModel dispatch above
    // already drove aggregation through to completion.
    let get_model = server.dispatch(RoundRequest::GetModel { iteration: 1 }).await;
    match get_model.payload {
        RoundPayload::Model { model } => assert_eq!(model.weight_data, f32_vec_to_bytes(&[1.0, 1.0])),
        other => panic!("expected Model payload, got {other:?}"),
    }
}

/// A client with an unknown `fl_id` is rejected at the attestation check with
/// `OutOfTime`, never counted toward the threshold; a second, legitimate client
/// is still required before `exchangeKeys` opens.
#[tokio::test]
async fn unknown_client_attestation_times_out() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams { start_fl_job_threshold: 2, ..Default::default() };
    let cipher = PermissiveCipherModule::new();
    cipher.mark_unknown_client("ghost");
    let server = build_server_with_cipher("lenet", "node-a", "addr-a", cache, &network, hyper, cipher).await;

    let (timestamp_ms, signature) = signed_request("ghost");
    let rejected = server
        .dispatch(RoundRequest::StartFlJob {
            fl_id: "ghost".to_string(),
            data_size: 1.0,
            eval_data_size: 1.0,
            timestamp_ms,
            signature: signature.clone(),
        })
        .await;
    assert_eq!(rejected.retcode, fl_coordinator_core::error::RetCode::OutOfTime);

    let legitimate = server
        .dispatch(RoundRequest::StartFlJob {
            fl_id: "client-1".to_string(),
            data_size: 1.0,
            eval_data_size: 1.0,
            timestamp_ms,
            signature,
        })
        .await;
    assert_eq!(legitimate.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // The rejected "ghost" never counted, so threshold 2 still isn't reached by
    // one accepted client: exchangeKeys (gated on startFLJob's threshold) must
    // report not-ready rather than opening early.
    let exchange = server
        .dispatch(RoundRequest::ExchangeKeys {
            fl_id: "client-1".to_string(),
            dh_prime: vec![2, 3],
            c_pk: vec![1],
            s_pk: vec![1],
        })
        .await;
    assert_eq!(exchange.retcode, fl_coordinator_core::error::RetCode::SucNotReady);
}

/// S2 (spec §8): an `updateModel` round that never reaches its threshold times
/// out; `FinishIteration(false, ...)` still advances the iteration, but the
/// iteration it abandoned never got a chance to aggregate.
#[tokio::test]
async fn update_model_round_times_out_without_aggregating() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams {
        start_fl_job_threshold: 2,
        update_model_time_window: 0, // already-expired the instant the round's timer starts
        ..Default::default()
    };
    let server = build_server("lenet", "node-a", "addr-a", cache, &network, hyper).await;

    for fl_id in ["client-1", "client-2"] {
        let (timestamp_ms, signature) = signed_request(fl_id);
        let start = server
            .dispatch(RoundRequest::StartFlJob {
                fl_id: fl_id.to_string(),
                data_size: 1.0,
                eval_data_size: 1.0,
                timestamp_ms,
                signature,
            })
            .await;
        assert_eq!(start.retcode, fl_coordinator_core::error::RetCode::Succeed);
    }

    // Only one of the two required clients reports in, so the threshold of 2
    // is never reached and the timer registered on this first updateModel is
    // already expired (`update_model_time_window: 0`).
    let (timestamp_ms, signature) = signed_request("client-1");
    let mut weight_bytes = std::collections::HashMap::new();
    weight_bytes.insert("w".to_string(), f32_vec_to_bytes(&[9.0, 9.0]));
    let update = server
        .dispatch(RoundRequest::UpdateModel {
            fl_id: "client-1".to_string(),
            iteration: 1,
            timestamp_ms,
            signature,
            compress_type: "NO_COMPRESS".to_string(),
            weight_bytes,
            data_size: 1.0,
            upload_loss: 0.1,
            upload_accuracy: 0.9,
        })
        .await;
    assert_eq!(update.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // `tick` observes the expired timer, sees the threshold unmet, and calls
    // `FinishIteration(false, ...)`, which unconditionally advances the
    // iteration regardless of the failure.
    server.tick().await.unwrap();

    // Iteration 1 is now in the past; its model was never touched by
    // aggregation, so it must still read back as the original seed rather
    // than anything derived from client-1's accepted (but discarded) update.
    let get_model = server.dispatch(RoundRequest::GetModel { iteration: 1 }).await;
    match get_model.payload {
        RoundPayload::Model { model } => assert_eq!(model.weight_data, f32_vec_to_bytes(&[0.0, 0.0])),
        other => panic!("expected Model payload, got {other:?}"),
    }
}

/// S3 (spec §8): two servers ring all-reduce an `updateModel` contribution
/// each, landing on the element-wise mean.
#[tokio::test]
async fn two_server_ring_all_reduce() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams { start_fl_job_threshold: 1, ..Default::default() };
    let node_a = build_server("lenet", "node-a", "addr-a", cache.clone(), &network, hyper.clone()).await;
    let node_b = build_server("lenet", "node-b", "addr-b", cache.clone(), &network, hyper).await;
    // node-a's registry snapshot predates node-b's join; one tick refreshes it
    // so both servers see the same two-member ring.
    node_a.tick().await.unwrap();
    node_b.tick().await.unwrap();

    // Each server's own `count_for_aggregation` threshold is reached by its own
    // single client, which drives that server straight into ring all-reduce
    // (`Service::dispatch`'s post-`updateModel` hook). Both updates must run
    // concurrently or one server's ring step deadlocks waiting on the other's
    // unsent chunk.
    async fn start_and_update(server: &TestService, fl_id: &str, value: f32) -> RoundResponse {
        let (timestamp_ms, signature) = signed_request(fl_id);
        server
            .dispatch(RoundRequest::StartFlJob {
                fl_id: fl_id.to_string(),
                data_size: 1.0,
                eval_data_size: 1.0,
                timestamp_ms,
                signature: signature.clone(),
            })
            .await;

        let mut weight_bytes = std::collections::HashMap::new();
        weight_bytes.insert("w".to_string(), f32_vec_to_bytes(&[value, value]));
        server
            .dispatch(RoundRequest::UpdateModel {
                fl_id: fl_id.to_string(),
                iteration: 1,
                timestamp_ms,
                signature,
                compress_type: "NO_COMPRESS".to_string(),
                weight_bytes,
                data_size: 1.0,
                upload_loss: 0.1,
                upload_accuracy: 0.9,
            })
            .await
    }

    let (update_a, update_b) = tokio::join!(
        start_and_update(&node_a, "client-a", 2.0),
        start_and_update(&node_b, "client-b", 4.0),
    );
    assert_eq!(update_a.retcode, fl_coordinator_core::error::RetCode::Succeed);
    assert_eq!(update_b.retcode, fl_coordinator_core::error::RetCode::Succeed);

    let model_a = node_a.dispatch(RoundRequest::GetModel { iteration: 1 }).await;
    let model_b = node_b.dispatch(RoundRequest::GetModel { iteration: 1 }).await;
    for response in [model_a, model_b] {
        match response.payload {
            RoundPayload::Model { model } => {
                let bytes = fl_coordinator_core::model::bytes_as_f32(&model.weight_data).unwrap();
                assert_eq!(bytes, &[3.0, 3.0]);
            }
            other => panic!("expected Model payload, got {other:?}"),
        }
    }
}

/// S4 (spec §8): three servers share an instance; two ring all-reduce a real
/// `updateModel` contribution each, the third never contributes this
/// iteration (the aggregation-skipper case) and falls back to `pullWeight`,
/// which forwards to the copy the ring's lowest-id member broadcast to it.
#[tokio::test]
async fn three_server_aggregation_skipper_pulls_the_result() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams { start_fl_job_threshold: 1, ..Default::default() };
    let node_a = build_server("lenet", "node-a", "addr-a", cache.clone(), &network, hyper.clone()).await;
    let node_b = build_server("lenet", "node-b", "addr-b", cache.clone(), &network, hyper.clone()).await;
    let node_c = build_server("lenet", "node-c", "addr-c", cache.clone(), &network, hyper).await;
    // Refresh every server's registry snapshot so all three see the same
    // three-member ring before anyone contributes.
    node_a.tick().await.unwrap();
    node_b.tick().await.unwrap();
    node_c.tick().await.unwrap();

    async fn start_and_update(server: &TestService, fl_id: &str, value: f32) -> RoundResponse {
        let (timestamp_ms, signature) = signed_request(fl_id);
        server
            .dispatch(RoundRequest::StartFlJob {
                fl_id: fl_id.to_string(),
                data_size: 1.0,
                eval_data_size: 1.0,
                timestamp_ms,
                signature: signature.clone(),
            })
            .await;

        let mut weight_bytes = std::collections::HashMap::new();
        weight_bytes.insert("w".to_string(), f32_vec_to_bytes(&[value, value]));
        server
            .dispatch(RoundRequest::UpdateModel {
                fl_id: fl_id.to_string(),
                iteration: 1,
                timestamp_ms,
                signature,
                compress_type: "NO_COMPRESS".to_string(),
                weight_bytes,
                data_size: 1.0,
                upload_loss: 0.1,
                upload_accuracy: 0.9,
            })
            .await
    }

    // node-c deliberately never calls updateModel this iteration.
    let (update_a, update_b) = tokio::join!(
        start_and_update(&node_a, "client-a", 2.0),
        start_and_update(&node_b, "client-b", 4.0),
    );
    assert_eq!(update_a.retcode, fl_coordinator_core::error::RetCode::Succeed);
    assert_eq!(update_b.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // node-a and node-b, the only contributors, ring all-reduce to the mean;
    // node-a is the lowest-id ring member, so it broadcasts the result to
    // every live peer excluded from the ring, i.e. node-c alone.
    let pull = node_c.dispatch(RoundRequest::PullWeight { iteration: 1 }).await;
    match pull.payload {
        RoundPayload::Model { model } => {
            let bytes = fl_coordinator_core::model::bytes_as_f32(&model.weight_data).unwrap();
            assert_eq!(bytes, &[3.0, 3.0]);
        }
        other => panic!("expected Model payload, got {other:?}"),
    }
}

/// S5 (spec §4.B): the scheduler rotates to a fresh instance name while this
/// server has aggregated nothing yet; the next tick adopts it, resets to
/// iteration 1, and keeps serving the model nothing has overwritten.
#[tokio::test]
async fn tick_adopts_new_instance_from_scheduler() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams { start_fl_job_threshold: 1, ..Default::default() };
    let server = build_server("lenet", "node-a", "addr-a", cache.clone(), &network, hyper).await;

    // Scheduler rotates the instance out from under the server: a fresh name
    // wins the global key, the same way `instance.rs`'s own
    // `sync_detects_new_instance_and_resets_iteration` test simulates it.
    let name_key = CacheKeys::instance_name_key("lenet");
    cache.del(&name_key).await.unwrap();
    cache.set_ex_nx(&name_key, "i_fresh", 3600).await.unwrap();

    server.tick().await.unwrap();

    let adopted = cache.get(&name_key).await.unwrap();
    assert_eq!(adopted.as_deref(), Some("i_fresh"));

    // Nothing aggregated before the rotation, so the reseeded ring still
    // carries the original model; startFLJob still opens on the new instance.
    let (timestamp_ms, signature) = signed_request("client-1");
    let start = server
        .dispatch(RoundRequest::StartFlJob {
            fl_id: "client-1".to_string(),
            data_size: 1.0,
            eval_data_size: 1.0,
            timestamp_ms,
            signature,
        })
        .await;
    assert_eq!(start.retcode, fl_coordinator_core::error::RetCode::Succeed);
    match start.payload {
        RoundPayload::StartFlJobAccepted { model, .. } => {
            assert_eq!(model.weight_data, f32_vec_to_bytes(&[0.0, 0.0]));
        }
        other => panic!("expected StartFlJobAccepted payload, got {other:?}"),
    }
}

/// S6 (spec §5/spec.md:194): a server restarts mid-instance after a peer
/// finished aggregating an iteration without it. `bootstrap`'s
/// `SyncLatestModelFromOtherServers` step pulls the peer's materialized
/// weight instead of falling back to the placeholder it reseeds with.
#[tokio::test]
async fn restarted_server_recovers_latest_model_from_a_peer() {
    let cache = InMemoryCacheClient::new();
    let network = InMemoryNetwork::new();
    let hyper = HyperParams { start_fl_job_threshold: 1, ..Default::default() };
    let node_a = build_server("lenet", "node-a", "addr-a", cache.clone(), &network, hyper.clone()).await;
    let node_b = build_server("lenet", "node-b", "addr-b", cache.clone(), &network, hyper.clone()).await;
    node_a.tick().await.unwrap();
    node_b.tick().await.unwrap();

    // node-a never contributes this iteration (it's about to crash); only
    // node-b's client reports in, which already meets node-b's own
    // per-server threshold and drives node-b's ring all-reduce alone.
    let (timestamp_ms, signature) = signed_request("client-b");
    node_b
        .dispatch(RoundRequest::StartFlJob {
            fl_id: "client-b".to_string(),
            data_size: 1.0,
            eval_data_size: 1.0,
            timestamp_ms,
            signature: signature.clone(),
        })
        .await;
    let mut weight_bytes = std::collections::HashMap::new();
    weight_bytes.insert("w".to_string(), f32_vec_to_bytes(&[5.0, 5.0]));
    let update = node_b
        .dispatch(RoundRequest::UpdateModel {
            fl_id: "client-b".to_string(),
            iteration: 1,
            timestamp_ms,
            signature,
            compress_type: "NO_COMPRESS".to_string(),
            weight_bytes,
            data_size: 1.0,
            upload_loss: 0.1,
            upload_accuracy: 0.9,
        })
        .await;
    assert_eq!(update.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // node-b re-publishes its own materialized copy via pushWeight so a peer's
    // get_model_weight query (including its own, since pushWeight broadcasts
    // to every live server) can find it.
    let materialized = node_b.dispatch(RoundRequest::GetModel { iteration: 1 }).await;
    let RoundPayload::Model { model } = materialized.payload else {
        panic!("expected node-b to have a materialized iteration-1 model");
    };
    let push = node_b.dispatch(RoundRequest::PushWeight { iteration: 1, model }).await;
    assert_eq!(push.retcode, fl_coordinator_core::error::RetCode::Succeed);

    // node-a crashes and restarts, recovering at iteration 2 (the iteration
    // just after the one node-b finished without it).
    drop(node_a);
    let recovery_ctx = FLContext { recovery_iteration: Some(2), ..ctx("lenet", "node-a", "addr-a") };
    let node_a_restarted = Service::new(
        &recovery_ctx,
        cache,
        network.link_for("node-a"),
        PermissiveCipherModule::new(),
        IdentityCompression,
        NoUnsupervisedEval,
        hyper,
        vec![2, 3, 5, 7],
        std::env::temp_dir().join(format!("fl_scenario_node-a-restarted_{}", std::process::id())),
    );
    node_a_restarted.seed_initial_model(seed_model());
    node_a_restarted.bootstrap(Some(2)).await.unwrap();

    let recovered = node_a_restarted.dispatch(RoundRequest::GetModel { iteration: 1 }).await;
    match recovered.payload {
        RoundPayload::Model { model } => {
            let bytes = fl_coordinator_core::model::bytes_as_f32(&model.weight_data).unwrap();
            assert_eq!(bytes, &[5.0, 5.0]);
        }
        other => panic!("expected node-a to recover node-b's materialized model, got {other:?}"),
    }
}
