//! The coordination core's top-level service (spec §5 main loop) — owns every
//! subsystem and wires the round dispatcher's kernels to them.
//!
//! Grounded on `server.cc`'s `StartServer`/`MainLoop` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/`, and on
//! the teacher's `AppState`/`main.rs` wiring
//! (`service_islands/mod.rs`, `main.rs`) for how subsystems are constructed
//! once and shared behind `Arc`.

use crate::cache::{CacheClient, CacheKeys};
use crate::cipher::CipherModule;
use crate::compression::Compression;
use crate::config::{FLContext, HyperParams};
use crate::counter::{Counter, CounterEvent};
use crate::error::{CoreError, CoreResult, RetCode};
use crate::instance::{InstanceContext, InstanceEvent, InstanceState};
use crate::metrics::{append_iteration_metrics, ClientVisitedInfo, IterationMetrics};
use crate::model::executor::Executor;
use crate::registry::ServerRegistry;
use crate::round::{default_round_table, cipher_rounds, kernels, RoundDispatcher, RoundRequest, RoundResponse};
use crate::rpc::ServerLink;
use crate::summary::Summary;
use crate::task_thread::IterationTaskThread;
use crate::timer::Timer;
use crate::unsupervised::UnsupervisedEval;

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Every subsystem the coordination core needs, generic over the four
/// black-box collaborators (spec §1) plus the cache/RPC backends.
pub struct Service<C: CacheClient, L: ServerLink, Ci: CipherModule, Co: Compression, U: UnsupervisedEval> {
    pub fl_name: String,
    pub node_id: String,
    pub tcp_address: String,
    pub metrics_dir: PathBuf,
    cache: C,
    link: L,
    cipher: Ci,
    compression: Co,
    unsupervised: U,
    hyper: RwLock<HyperParams>,
    instance: InstanceContext<C>,
    registry: ServerRegistry<C>,
    counter: Counter<C>,
    timer: Timer<C>,
    executor: Executor,
    summary: Summary,
    dispatcher: RoundDispatcher,
    task_thread: IterationTaskThread,
    cache_unavailable: AtomicBool,
    iteration_start_ms: AtomicU64,
}

impl<C: CacheClient, L: ServerLink, Ci: CipherModule, Co: Compression, U: UnsupervisedEval> Service<C, L, Ci, Co, U> {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &FLContext,
        cache: C,
        link: L,
        cipher: Ci,
        compression: Co,
        unsupervised: U,
        hyper: HyperParams,
        dh_prime: Vec<u8>,
        metrics_dir: PathBuf,
    ) -> Self {
        let fl_iteration_num = hyper.fl_iteration_num;
        let mut dispatcher = RoundDispatcher::new();
        for round in default_round_table(&hyper) {
            dispatcher.register(round);
        }

        let counter = Counter::new(cache.clone(), &ctx.fl_name, hyper.global_iteration_time_window);
        let timer = Timer::new(cache.clone(), &ctx.fl_name, hyper.global_iteration_time_window);
        for round in default_round_table(&hyper) {
            counter.register(&round.name, round.threshold, round.per_server);
            timer.register(&round.name, round.time_window_secs);
        }
        for cipher_round in [
            "exchangeKeys",
            "shareSecrets",
            "reconstructSecrets",
            "pushListSign",
        ] {
            counter.register(cipher_round, hyper.start_fl_job_threshold, false);
        }

        Self {
            fl_name: ctx.fl_name.clone(),
            node_id: ctx.server_id.clone(),
            tcp_address: ctx.tcp_bind_addr.clone(),
            metrics_dir,
            cache: cache.clone(),
            link,
            cipher,
            compression,
            unsupervised,
            hyper: RwLock::new(hyper),
            instance: InstanceContext::new(cache.clone(), &ctx.fl_name, fl_iteration_num, dh_prime),
            registry: ServerRegistry::new(cache, &ctx.fl_name, &ctx.server_id, &ctx.tcp_bind_addr),
            counter,
            timer,
            executor: Executor::new(3),
            summary: Summary::new(&ctx.server_id),
            dispatcher,
            task_thread: IterationTaskThread::spawn(),
            cache_unavailable: AtomicBool::new(false),
            iteration_start_ms: AtomicU64::new(now_ms()),
        }
    }

    fn keys(&self) -> CacheKeys {
        CacheKeys::new(&self.fl_name, self.instance.instance_name())
    }

    /// `HyperParams::SyncPeriod`/`/newInstance` (SPEC_FULL §B): validates and
    /// merges a hyper-param update on top of the live config, then reinitializes
    /// every registered counter/timer threshold and the count-hash TTL so the
    /// change takes effect without waiting for the next `NewInstance` event.
    pub fn apply_hyper_params_update(&self, update: &crate::config::HyperParamsUpdate) -> Result<(), crate::config::HyperParamsValidationError> {
        let next = self.hyper.read().merge(update)?;
        for round in default_round_table(&next) {
            self.counter.reinit(&round.name, round.threshold);
            self.timer.reinit(&round.name, round.time_window_secs);
        }
        self.counter.set_global_iteration_time_window(next.global_iteration_time_window);
        self.timer.set_global_iteration_time_window(next.global_iteration_time_window);
        *self.hyper.write() = next;
        Ok(())
    }

    /// `Initialize(feature_map)` (spec §4.I): seeds the model a production
    /// binding reads off disk before the first `startFLJob` round opens. Only
    /// meaningful on a fresh instance; a recovered instance already has a model
    /// from a peer's `syncModel`/cache snapshot and should skip this call.
    pub fn seed_initial_model(&self, model: crate::model::Model) {
        self.executor.initialize(self.instance.iteration_num(), model.clone());
        self.executor.reset_aggregation_status(&model);
    }

    /// `StartServer` (spec §5): acquires the registration lock, runs
    /// `ServerPingPong` against already-live peers, then joins the instance.
    pub async fn bootstrap(&self, recovery_iteration: Option<u64>) -> CoreResult<()> {
        while !self.registry.acquire_registration_lock(&self.instance.instance_name()).await? {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        self.registry.sync(&self.instance.instance_name()).await?;
        let peers = self.registry.get_all_servers();
        let link = self.link.clone();
        self.registry
            .ping_pong(&peers, |node_id, addr| {
                let link = link.clone();
                async move { link.ping(&node_id, &addr).await.unwrap_or(false) }
            })
            .await;
        self.sync_latest_model_from_peers(recovery_iteration, &peers).await?;
        self.registry.release_registration_lock(&self.instance.instance_name()).await?;

        self.instance.init_and_sync(recovery_iteration).await?;
        Ok(())
    }

    /// `SyncLatestModelFromOtherServers` (spec.md:194): runs once under the
    /// registration lock on every startup, querying every peer for the
    /// iteration just before the one this node is about to join. The first
    /// non-empty reply is adopted; if every peer answers empty, the model
    /// seeded at process start (or nothing, if this is a fresh instance before
    /// its first iteration) stands.
    async fn sync_latest_model_from_peers(&self, recovery_iteration: Option<u64>, peers: &[(String, String)]) -> CoreResult<()> {
        let Some(target_iteration) = recovery_iteration.and_then(|i| i.checked_sub(1)).filter(|i| *i > 0) else {
            return Ok(());
        };
        for (node_id, addr) in peers {
            if node_id == self.registry.node_id() {
                continue;
            }
            if let Some(model) = self.link.get_model_weight(node_id, addr, target_iteration).await? {
                self.executor.initialize(target_iteration, model.clone());
                self.executor.reset_aggregation_status(&model);
                return Ok(());
            }
        }
        Ok(())
    }

    /// `ExitHandler` (SPEC_FULL §B): removes this node's heartbeat so peers
    /// notice the exit within one `Sync()` tick rather than waiting out the
    /// full heartbeat TTL.
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.registry.stop(&self.instance.instance_name()).await
    }

    /// One `Sync()` tick of the main loop (spec §5): refreshes every
    /// distributed subsystem and reacts to whatever events surface.
    pub async fn tick(&self) -> CoreResult<()> {
        let tick_result: CoreResult<()> = async {
            self.registry.sync(&self.instance.instance_name()).await?;
            let event = self.instance.sync().await?;
            if event != InstanceEvent::None {
                self.handle_instance_event(event).await?;
            }

            let fired = self.timer.sync(&self.instance.instance_name()).await?;
            for name in fired {
                self.handle_timer_fired(&name).await?;
            }
            Ok(())
        }
        .await;

        match &tick_result {
            Ok(()) => self.cache_unavailable.store(false, Ordering::Release),
            Err(e) if e.is_unavailable() => self.cache_unavailable.store(true, Ordering::Release),
            Err(_) => {}
        }
        tick_result
    }

    /// Spec §5's ordered barrier: enter safe mode so newly arriving requests are
    /// rejected with `ClusterSafeMode` (`RoundDispatcher::admit`), drain any
    /// aggregation work already in flight on the task thread, then reset and
    /// adopt the new iteration's state. Safe mode is only lifted once that
    /// drain has completed, so the reset below never races the ring all-reduce
    /// callback it's waiting on.
    async fn handle_instance_event(&self, event: InstanceEvent) -> CoreResult<()> {
        self.instance.set_safe_mode(true);
        self.task_thread.wait_all_task_finish().await;

        self.counter.reset_on_new_iteration();
        self.timer.reset_on_new_iteration();
        self.summary.reset();
        if event == InstanceEvent::NewInstance {
            self.executor.reset(self.instance.iteration_num());
        }
        self.instance.handle_instance_event(event).await?;
        if let Some((_, model)) = self.executor.get_latest_model() {
            self.executor.reset_aggregation_status(&model);
        }
        self.task_thread.set_current_iteration(self.instance.iteration_num());
        self.iteration_start_ms.store(now_ms(), Ordering::Release);

        self.instance.set_safe_mode(false);
        Ok(())
    }

    async fn handle_timer_fired(&self, round_name: &str) -> CoreResult<()> {
        let reached = self.counter.reach_threshold(&self.instance.instance_name(), round_name).await?;
        if !reached && round_name == "updateModel" {
            self.instance.notify_next(false, "updateModel timed out").await?;
        }
        Ok(())
    }

    /// Runs the aggregation once `count_for_aggregation` reaches its threshold
    /// (spec §4.I step 1: ring = live peers ∩ contributors); called by the
    /// binary entry point's event loop after observing the last-event.
    pub async fn run_aggregation(&self) -> CoreResult<()> {
        if self.executor.aggregation_done() {
            return Ok(());
        }
        let Some((_, base_model)) = self.executor.get_latest_model() else {
            return Err(CoreError::SystemError("no base model to aggregate from".to_string()));
        };
        let instance_name = self.instance.instance_name();
        let iteration = self.instance.iteration_num();
        let live = self.registry.get_all_servers();
        let contributors = self.counter.contributors(&instance_name, "count_for_aggregation").await?;
        let ring: Vec<(String, String)> = live
            .iter()
            .filter(|(id, _)| contributors.iter().any(|c| c == id))
            .cloned()
            .collect();
        let Some(local_rank) = ring.iter().position(|(id, _)| id == self.registry.node_id()) else {
            // Aggregation-skipper (spec §4.I step 1): nothing contributed locally
            // this iteration, so there is no buffer to fold into the ring. The
            // lowest-id ring member broadcasts the result once it finishes.
            return Ok(());
        };

        let result = self
            .executor
            .run_weight_aggregation(&self.link, &base_model, &ring, local_rank, iteration, || false)
            .await?;

        if let Some(model) = result {
            let score = self.unsupervised.score(&model);
            self.summary.with_accumulator(|acc| {
                if let Some(v) = score {
                    acc.record_sign_ds(v);
                }
            });
            if ring.first().is_some_and(|(id, _)| id == self.registry.node_id()) {
                for (node_id, addr) in live.iter().filter(|(id, _)| !ring.iter().any(|(r, _)| r == id)) {
                    self.link.broadcast_model_weight(node_id, addr, iteration, &model).await?;
                }
            }
            self.instance.notify_next(true, "aggregation complete").await?;
        }
        Ok(())
    }

    /// Publishes this server's summary and, if it wins the writer lock,
    /// aggregates every server's contribution into one `metrics.json` line
    /// (spec §3/§6).
    pub async fn summarize_iteration(&self, start_time_ms: u64) -> CoreResult<()> {
        let keys = self.keys();
        self.summary.publish(&self.cache, &keys).await?;
        if !self.summary.try_acquire_writer_lock(&self.cache, &keys).await? {
            return Ok(());
        }

        let merged = Summary::read_all(&self.cache, &keys).await?;
        let end_time_ms = now_ms();
        let round_counts = merged
            .round_counts
            .iter()
            .map(|(name, counts)| (name.clone(), (counts.accepted, counts.rejected)))
            .collect();
        let record = IterationMetrics {
            instance_name: self.instance.instance_name(),
            fl_name: self.fl_name.clone(),
            instance_status: format!("{:?}", self.instance.state()),
            fl_iteration_num: self.hyper.read().fl_iteration_num,
            current_iteration: self.instance.iteration_num(),
            metrics_loss: merged.mean_upload_loss(),
            metrics_accuracy: merged.mean_upload_accuracy(),
            unsupervised_eval: (merged.sign_ds_aggregate != 0.0).then_some(merged.sign_ds_aggregate),
            client_visited_info: ClientVisitedInfo { round_counts },
            iteration_result: if self.instance.state() == InstanceState::Disable {
                "failed".to_string()
            } else {
                "success".to_string()
            },
            start_time_ms,
            end_time_ms,
            iteration_execution_time_ms: end_time_ms.saturating_sub(start_time_ms),
        };
        append_iteration_metrics(&self.metrics_dir, &record)
            .await
            .map_err(|e| CoreError::SystemError(e.to_string()))?;
        self.summary.mark_finished(&self.cache, &keys).await?;
        Ok(())
    }

    /// Once every live, contributing server has reported `count_for_aggregation`,
    /// runs the ring all-reduce and folds the finished iteration into
    /// `metrics.json`. A no-op if the threshold isn't reached yet or aggregation
    /// already ran this iteration (spec §4.I).
    async fn maybe_run_aggregation(&self) {
        let start_time_ms = self.iteration_start_ms.load(Ordering::Acquire);
        let instance_name = self.instance.instance_name();
        match self.counter.reach_threshold(&instance_name, "count_for_aggregation").await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(error = %e, "count_for_aggregation threshold check failed");
                return;
            }
        }
        if let Err(e) = self.run_aggregation().await {
            tracing::warn!(error = %e, "aggregation failed");
            return;
        }
        if let Err(e) = self.summarize_iteration(start_time_ms).await {
            tracing::warn!(error = %e, "summarize_iteration failed");
        }
    }

    /// Dispatches one client request through admission, then the matching
    /// kernel (spec §4.G).
    pub async fn dispatch(&self, request: RoundRequest) -> RoundResponse {
        let round_name = request.round_name();
        let cache_unavailable = self.cache_unavailable.load(Ordering::Acquire);
        if let Err(rejection) = self.dispatcher.admit(round_name, &self.instance, cache_unavailable) {
            return rejection;
        }

        let iteration = self.instance.iteration_num();
        let keys = self.keys();
        let replay_window_ms = self.hyper.read().cipher_time_window;
        let start_fl_job_window_ms = self.hyper.read().start_fl_job_time_window;
        let reconstruct_threshold = self.hyper.read().reconstruct_secrets_threshold;
        let next_req_time = now_ms() + 1_000;

        let result: CoreResult<RoundResponse> = match request {
            RoundRequest::StartFlJob { fl_id, data_size, eval_data_size, timestamp_ms, signature } => {
                kernels::start_fl_job(
                    &self.cache, &keys, &self.instance, &self.counter, &self.timer, &self.cipher, &self.executor,
                    replay_window_ms, &fl_id, data_size, eval_data_size, timestamp_ms, &signature,
                )
                .await
            }
            RoundRequest::UpdateModel {
                fl_id, iteration: req_iter, timestamp_ms, signature, compress_type, weight_bytes, data_size, upload_loss, upload_accuracy,
            } => {
                let response = kernels::update_model(
                    &self.cache, &keys, &self.instance, &self.counter, &self.timer, &self.registry, &self.cipher, &self.compression,
                    &self.executor, &self.summary, replay_window_ms, start_fl_job_window_ms, &fl_id, req_iter, timestamp_ms,
                    &signature, &compress_type, &weight_bytes, data_size, upload_loss, upload_accuracy,
                )
                .await;
                if matches!(response, Ok(RoundResponse { retcode: RetCode::Succeed, .. })) {
                    self.task_thread.run_tracked(self.maybe_run_aggregation()).await;
                }
                response
            }
            RoundRequest::GetModel { iteration: req_iter } => {
                kernels::get_model(&self.instance, &self.executor, req_iter, next_req_time).await
            }
            RoundRequest::PullWeight { iteration: req_iter } => {
                let peers = self.registry.get_all_servers();
                kernels::pull_weight(&self.instance, &self.executor, &self.link, &peers, req_iter, next_req_time).await
            }
            RoundRequest::PushWeight { iteration: req_iter, model } => {
                let peers = self.registry.get_all_servers();
                kernels::push_weight(&self.executor, &self.link, &peers, req_iter, model).await
            }
            RoundRequest::PushMetrics { fl_id, loss, accuracy } => {
                Ok(kernels::push_metrics(&self.instance, &self.summary, &fl_id, loss, accuracy))
            }
            RoundRequest::ExchangeKeys { fl_id, dh_prime, c_pk, s_pk } => {
                cipher_rounds::exchange_keys(
                    &self.cache, &keys, &self.instance, &self.counter, &self.cipher, next_req_time, &fl_id, &dh_prime, &c_pk, &s_pk,
                )
                .await
            }
            RoundRequest::GetKeys => {
                cipher_rounds::get_keys(&self.cache, &keys, &self.instance, &self.counter, next_req_time).await
            }
            RoundRequest::ShareSecrets { fl_id, encrypted_shares } => {
                cipher_rounds::share_secrets(
                    &self.cache, &keys, &self.instance, &self.counter, &self.cipher, next_req_time, &fl_id, &encrypted_shares,
                )
                .await
            }
            RoundRequest::GetSecrets => {
                cipher_rounds::get_secrets(&self.cache, &keys, &self.instance, &self.counter, next_req_time).await
            }
            RoundRequest::GetClientList => {
                cipher_rounds::get_client_list(&self.cache, &keys, &self.instance, &self.counter, next_req_time).await
            }
            RoundRequest::ReconstructSecrets { fl_id, shares } => {
                cipher_rounds::reconstruct_secrets(
                    &self.cache, &keys, &self.instance, &self.counter, &self.cipher, reconstruct_threshold, &fl_id, &shares,
                )
                .await
            }
            RoundRequest::PushListSign { fl_id, signature } => {
                cipher_rounds::push_list_sign(
                    &self.cache, &keys, &self.instance, &self.counter, &self.cipher, next_req_time, &fl_id, &signature,
                )
                .await
            }
            RoundRequest::GetListSign => {
                cipher_rounds::get_list_sign(&self.cache, &keys, &self.instance, &self.counter, next_req_time).await
            }
        };

        result.unwrap_or_else(|e| RoundDispatcher::translate_kernel_error(iteration, &e))
    }
}
