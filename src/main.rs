use std::path::PathBuf;
use std::time::Duration;

use fl_coordinator_core::cache::RedisCacheClient;
use fl_coordinator_core::cipher::PermissiveCipherModule;
use fl_coordinator_core::compression::IdentityCompression;
use fl_coordinator_core::config::{FLContext, HyperParams};
use fl_coordinator_core::model::{f32_vec_to_bytes, Model, WeightItem};
use fl_coordinator_core::rpc::tcp::TcpServerLink;
use fl_coordinator_core::service::Service;
use fl_coordinator_core::unsupervised::NoUnsupervisedEval;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ctx = FLContext::from_env()?;
    tracing::info!(fl_name = %ctx.fl_name, server_id = %ctx.server_id, "starting coordination core");

    let cache = RedisCacheClient::connect(&ctx.redis_url, ctx.redis_pool_size).await?;
    let link = TcpServerLink::bind(&ctx.tcp_bind_addr, &ctx.server_id).await?;

    // A production binding supplies real CipherModule/Compression/UnsupervisedEval
    // implementations; these are the deterministic defaults this crate ships
    // (spec §1: cryptography, codecs, and unsupervised scoring are black boxes).
    let service = Service::new(
        &ctx,
        cache,
        link,
        PermissiveCipherModule::new(),
        IdentityCompression,
        NoUnsupervisedEval,
        HyperParams::default(),
        dh_prime_placeholder(),
        metrics_dir(),
    );

    // Seeded unconditionally: on a fresh instance this is the model clients
    // first see; on recovery, `bootstrap`'s peer sync overwrites it if a live
    // peer answers with the prior iteration's real model, and leaves it
    // standing only if every peer comes back empty.
    service.seed_initial_model(initial_model_placeholder());
    service.bootstrap(ctx.recovery_iteration).await?;
    tracing::info!("bootstrap complete, entering main loop");

    // `ExitHandler` (SPEC_FULL §B): a Unix signal flips this loop's exit
    // condition so the server deregisters itself instead of vanishing from
    // peers' live view only once its heartbeat TTL expires.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = service.tick().await {
                    tracing::warn!(error = %e, "tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, deregistering");
                break;
            }
        }
    }

    service.shutdown().await?;
    Ok(())
}

/// A real deployment reads the feature map off the trained model file a
/// production binding points at; this placeholder exists so the binary can
/// reach the first `startFLJob` round without that binding wired in yet.
fn initial_model_placeholder() -> Model {
    let mut items = std::collections::BTreeMap::new();
    items.insert(
        "weight".to_string(),
        WeightItem { offset: 0, size: 4, shape: vec![1], dtype: "f32".to_string(), require_aggr: true },
    );
    Model::new(f32_vec_to_bytes(&[0.0]), items)
}

fn metrics_dir() -> PathBuf {
    std::env::var("FL_METRICS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./metrics"))
}

/// A real deployment provisions a DH prime out-of-band; this placeholder is
/// only large enough to exercise [`fl_coordinator_core::cipher::CipherModule`]'s
/// non-empty check in tests and local runs.
fn dh_prime_placeholder() -> Vec<u8> {
    std::env::var("FL_DH_PRIME_HEX")
        .ok()
        .and_then(|hex| {
            (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
                .collect::<Option<Vec<u8>>>()
        })
        .unwrap_or_else(|| vec![0xFF; 32])
}
