//! Cipher-mode rounds (spec §4.G "cipher rounds" / §4.H): the secure-aggregation
//! key-exchange and secret-sharing protocol gated by [`HyperParams::secure_aggregation`].
//!
//! Grounded on `exchange_keys_kernel.cc`, `get_keys_kernel.cc`, `share_secrets_kernel.cc`,
//! `get_secrets_kernel.cc`, `client_list_kernel.cc`, `reconstruct_secrets_kernel.cc`,
//! and `push_list_sign_kernel.cc`/`get_list_sign_kernel.cc` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/kernel/round/`.
//!
//! Each round stores its per-client submissions in a `client:<iter>:<bucket>`
//! cache hash/set (spec §6 key schema) and is gated on the prior round in the
//! chain having reached its threshold — a client cannot fetch keys before
//! enough peers have exchanged them, cannot reconstruct secrets before enough
//! shares exist, and so on.

use crate::cache::{CacheClient, CacheKeys};
use crate::cipher::CipherModule;
use crate::counter::Counter;
use crate::error::{CoreResult, RetCode};
use crate::instance::InstanceContext;

use super::{RoundPayload, RoundResponse};

use std::collections::HashMap;

fn not_ready_unless_reached(iteration: u64, reached: bool, next_req_time_ms: u64) -> Option<RoundResponse> {
    (!reached).then(|| RoundResponse::not_ready(iteration, next_req_time_ms))
}

/// `exchangeKeys` (spec §4.G): a client submits its DH prime and public keys.
/// Gated on `startFLJob` having reached its threshold.
pub async fn exchange_keys<C: CacheClient, Ci: CipherModule>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    cipher: &Ci,
    next_req_time_ms: u64,
    fl_id: &str,
    dh_prime: &[u8],
    c_pk: &[u8],
    s_pk: &[u8],
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "startFLJob").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }

    if let Err(reason) = cipher.verify_dh_prime(dh_prime) {
        return Ok(RoundResponse::error(RetCode::RequestError, iteration, reason));
    }

    let bucket = keys.client_bucket(iteration, "Keys");
    let already = cache.hexists(&bucket, fl_id).await?;
    if !already {
        let payload = serde_json::to_string(&(dh_prime, c_pk, s_pk))?;
        cache.hset(&bucket, fl_id, &payload).await?;
        cache.sadd(&keys.client_bucket(iteration, "ClientList"), fl_id).await?;
        counter.count(&instance.instance_name(), "exchangeKeys").await?;
    }
    Ok(RoundResponse::ok(iteration, RoundPayload::None))
}

/// `getKeys` (spec §4.G): gated on `exchangeKeys` having reached its threshold;
/// returns every submitted `(dh_prime, c_pk, s_pk)` tuple, keyed by `fl_id`.
pub async fn get_keys<C: CacheClient>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    next_req_time_ms: u64,
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "exchangeKeys").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }
    let raw = cache.hgetall(&keys.client_bucket(iteration, "Keys")).await?;
    let entries: HashMap<String, Vec<u8>> = raw.into_iter().map(|(k, v)| (k, v.into_bytes())).collect();
    Ok(RoundResponse::ok(iteration, RoundPayload::Keys { entries }))
}

/// `shareSecrets` (spec §4.G): a client submits its encrypted shares for every
/// peer it paired with. Gated on `exchangeKeys`.
pub async fn share_secrets<C: CacheClient, Ci: CipherModule>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    cipher: &Ci,
    next_req_time_ms: u64,
    fl_id: &str,
    encrypted_shares: &[u8],
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "exchangeKeys").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }

    if let Err(reason) = cipher.verify_share(fl_id, encrypted_shares) {
        return Ok(RoundResponse::error(RetCode::RequestError, iteration, reason));
    }

    let bucket = keys.client_bucket(iteration, "Secrets");
    let already = cache.hexists(&bucket, fl_id).await?;
    if !already {
        let encoded = String::from_utf8_lossy(encrypted_shares).to_string();
        cache.hset(&bucket, fl_id, &encoded).await?;
        counter.count(&instance.instance_name(), "shareSecrets").await?;
    }
    Ok(RoundResponse::ok(iteration, RoundPayload::None))
}

/// `getSecrets` (spec §4.G): gated on `shareSecrets`.
pub async fn get_secrets<C: CacheClient>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    next_req_time_ms: u64,
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "shareSecrets").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }
    let raw = cache.hgetall(&keys.client_bucket(iteration, "Secrets")).await?;
    let entries: HashMap<String, Vec<u8>> = raw.into_iter().map(|(k, v)| (k, v.into_bytes())).collect();
    Ok(RoundResponse::ok(iteration, RoundPayload::Secrets { entries }))
}

/// `getClientList` (spec §4.G): the set of clients that completed `exchangeKeys`
/// this iteration, used by survivors to know whose shares to reconstruct.
pub async fn get_client_list<C: CacheClient>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    next_req_time_ms: u64,
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "exchangeKeys").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }
    let fl_ids = cache.smembers(&keys.client_bucket(iteration, "ClientList")).await?;
    Ok(RoundResponse::ok(iteration, RoundPayload::ClientList { fl_ids }))
}

/// `reconstructSecrets` (spec §4.G): a survivor submits the shares it collected
/// for a dropped-out client, gated on at least `reconstruct_secrets_threshold`
/// shares being present in the submission itself.
pub async fn reconstruct_secrets<C: CacheClient, Ci: CipherModule>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    cipher: &Ci,
    reconstruct_threshold: u64,
    fl_id: &str,
    shares: &[(String, Vec<u8>)],
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Err(reason) = cipher.verify_reconstruct(shares, reconstruct_threshold) {
        return Ok(RoundResponse::error(RetCode::RequestError, iteration, reason));
    }

    let bucket = keys.client_bucket(iteration, "ReconstructedSecrets");
    let already = cache.hexists(&bucket, fl_id).await?;
    if !already {
        let payload = serde_json::to_string(shares)?;
        cache.hset(&bucket, fl_id, &payload).await?;
        counter.count(&instance.instance_name(), "reconstructSecrets").await?;
    }
    Ok(RoundResponse::ok(iteration, RoundPayload::None))
}

/// `pushListSign` (spec §4.G/§9 SignDS): a client pushes its signature over the
/// list of participants, gated on `getClientList` having been reachable
/// (`exchangeKeys` threshold, same chain).
pub async fn push_list_sign<C: CacheClient, Ci: CipherModule>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    cipher: &Ci,
    next_req_time_ms: u64,
    fl_id: &str,
    signature: &[u8],
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "exchangeKeys").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }

    if let Err(reason) = cipher.verify_list_sign(fl_id, signature) {
        return Ok(RoundResponse::error(RetCode::RequestError, iteration, reason));
    }

    let bucket = keys.client_bucket(iteration, "ListSign");
    let already = cache.hexists(&bucket, fl_id).await?;
    if !already {
        let encoded = String::from_utf8_lossy(signature).to_string();
        cache.hset(&bucket, fl_id, &encoded).await?;
        counter.count(&instance.instance_name(), "pushListSign").await?;
    }
    Ok(RoundResponse::ok(iteration, RoundPayload::None))
}

/// `getListSign` (spec §4.G): gated on `pushListSign`.
pub async fn get_list_sign<C: CacheClient>(
    cache: &C,
    keys: &CacheKeys,
    instance: &InstanceContext<C>,
    counter: &Counter<C>,
    next_req_time_ms: u64,
) -> CoreResult<RoundResponse> {
    let iteration = instance.iteration_num();
    if let Some(resp) = not_ready_unless_reached(
        iteration,
        counter.reach_threshold(&instance.instance_name(), "pushListSign").await?,
        next_req_time_ms,
    ) {
        return Ok(resp);
    }
    let raw = cache.hgetall(&keys.client_bucket(iteration, "ListSign")).await?;
    let entries: HashMap<String, Vec<u8>> = raw.into_iter().map(|(k, v)| (k, v.into_bytes())).collect();
    Ok(RoundResponse::ok(iteration, RoundPayload::Signatures { entries }))
}
