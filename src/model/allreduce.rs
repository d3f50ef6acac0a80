//! Ring all-reduce (spec §4.I "Ring all-reduce" algorithm) — reduce-scatter then
//! all-gather over an ordered ring of peers, with a reduce-to-rank-0 fallback
//! below `n` elements.
//!
//! Grounded on `CollectiveOpsImpl::RingAllReduce`/`RunRingAllReduce` in
//! `examples/original_source/mindspore_federated/fl_arch/ccsrc/server/collective_ops_impl.cc`.

use crate::error::CoreResult;
use crate::rpc::{CollectiveMessageMeta, CollectivePhase, ServerLink};

fn chunk_layout(count: usize, n: usize) -> (Vec<usize>, Vec<usize>) {
    let base = count / n;
    let remainder = count % n;
    let sizes: Vec<usize> = (0..n).map(|i| if i < remainder { base + 1 } else { base }).collect();
    let mut offsets = Vec::with_capacity(n);
    let mut acc = 0;
    for &s in &sizes {
        offsets.push(acc);
        acc += s;
    }
    (sizes, offsets)
}

/// Runs ring all-reduce (sum) over `local` in place.
///
/// `ring` is the ordered `(node_id, addr)` list; `local_rank` is this server's
/// index into it. `should_abort` is polled between every step and mirrors
/// `InstanceContext.HasIterationFailed` (spec §4.I): returning `true` aborts the
/// exchange and this function returns `Ok(false)`.
pub async fn ring_all_reduce<L: ServerLink>(
    link: &L,
    ring: &[(String, String)],
    local_rank: usize,
    iteration: u64,
    weight_name: &str,
    local: &mut [f32],
    should_abort: impl Fn() -> bool,
) -> CoreResult<bool> {
    let n = ring.len();
    if n <= 1 {
        return Ok(true);
    }
    if local.len() < n {
        return reduce_to_rank0_then_broadcast(link, ring, local_rank, iteration, weight_name, local, should_abort).await;
    }

    let (sizes, offsets) = chunk_layout(local.len(), n);
    let send_to_rank = (local_rank + 1) % n;
    let recv_from_rank = (local_rank + n - 1) % n;
    let (send_to_node, send_to_addr) = ring[send_to_rank].clone();
    let (recv_from_node, _recv_from_addr) = ring[recv_from_rank].clone();

    // Phase A: reduce-scatter.
    for i in 0..n - 1 {
        if should_abort() {
            return Ok(false);
        }
        let send_chunk_index = (local_rank + n - i) % n;
        let recv_chunk_index = (local_rank + n - i - 1) % n;

        let send_meta = CollectiveMessageMeta {
            iteration,
            weight_name: weight_name.to_string(),
            phase: CollectivePhase::ReduceScatter,
            chunk_index: send_chunk_index,
            for_index: i,
            send_node: ring[local_rank].0.clone(),
            recv_node: send_to_node.clone(),
        };
        let recv_meta = CollectiveMessageMeta {
            iteration,
            weight_name: weight_name.to_string(),
            phase: CollectivePhase::ReduceScatter,
            chunk_index: recv_chunk_index,
            for_index: i,
            send_node: recv_from_node.clone(),
            recv_node: ring[local_rank].0.clone(),
        };

        let send_chunk = local[offsets[send_chunk_index]..offsets[send_chunk_index] + sizes[send_chunk_index]].to_vec();
        let (send_res, recv_res) = tokio::join!(
            link.send_chunk(&send_to_node, &send_to_addr, send_meta, send_chunk),
            link.recv_chunk(&recv_meta)
        );
        send_res?;
        let recv_chunk = recv_res?;

        let start = offsets[recv_chunk_index];
        let len = sizes[recv_chunk_index];
        for (dst, src) in local[start..start + len].iter_mut().zip(recv_chunk.iter()) {
            *dst += *src;
        }
    }

    // Phase B: all-gather.
    for i in 0..n - 1 {
        if should_abort() {
            return Ok(false);
        }
        let send_chunk_index = (local_rank + n - i + 1) % n;
        let recv_chunk_index = (local_rank + n - i) % n;

        let send_meta = CollectiveMessageMeta {
            iteration,
            weight_name: weight_name.to_string(),
            phase: CollectivePhase::AllGather,
            chunk_index: send_chunk_index,
            for_index: i,
            send_node: ring[local_rank].0.clone(),
            recv_node: send_to_node.clone(),
        };
        let recv_meta = CollectiveMessageMeta {
            iteration,
            weight_name: weight_name.to_string(),
            phase: CollectivePhase::AllGather,
            chunk_index: recv_chunk_index,
            for_index: i,
            send_node: recv_from_node.clone(),
            recv_node: ring[local_rank].0.clone(),
        };

        let send_chunk = local[offsets[send_chunk_index]..offsets[send_chunk_index] + sizes[send_chunk_index]].to_vec();
        let (send_res, recv_res) = tokio::join!(
            link.send_chunk(&send_to_node, &send_to_addr, send_meta, send_chunk),
            link.recv_chunk(&recv_meta)
        );
        send_res?;
        let recv_chunk = recv_res?;

        let start = offsets[recv_chunk_index];
        let len = sizes[recv_chunk_index];
        local[start..start + len].copy_from_slice(&recv_chunk);
    }

    Ok(true)
}

async fn reduce_to_rank0_then_broadcast<L: ServerLink>(
    link: &L,
    ring: &[(String, String)],
    local_rank: usize,
    iteration: u64,
    weight_name: &str,
    local: &mut [f32],
    should_abort: impl Fn() -> bool,
) -> CoreResult<bool> {
    let n = ring.len();
    let (rank0_node, rank0_addr) = ring[0].clone();

    if local_rank != 0 {
        if should_abort() {
            return Ok(false);
        }
        let meta = CollectiveMessageMeta {
            iteration,
            weight_name: weight_name.to_string(),
            phase: CollectivePhase::ReduceScatter,
            chunk_index: local_rank,
            for_index: 0,
            send_node: ring[local_rank].0.clone(),
            recv_node: rank0_node.clone(),
        };
        link.send_chunk(&rank0_node, &rank0_addr, meta, local.to_vec()).await?;
    } else {
        for sender_rank in 1..n {
            if should_abort() {
                return Ok(false);
            }
            let meta = CollectiveMessageMeta {
                iteration,
                weight_name: weight_name.to_string(),
                phase: CollectivePhase::ReduceScatter,
                chunk_index: sender_rank,
                for_index: 0,
                send_node: ring[sender_rank].0.clone(),
                recv_node: ring[0].0.clone(),
            };
            let contribution = link.recv_chunk(&meta).await?;
            for (dst, src) in local.iter_mut().zip(contribution.iter()) {
                *dst += *src;
            }
        }
    }

    if should_abort() {
        return Ok(false);
    }

    if local_rank == 0 {
        for (target_rank, (node_id, addr)) in ring.iter().enumerate().skip(1) {
            let meta = CollectiveMessageMeta {
                iteration,
                weight_name: weight_name.to_string(),
                phase: CollectivePhase::AllGather,
                chunk_index: 0,
                for_index: target_rank,
                send_node: ring[0].0.clone(),
                recv_node: node_id.clone(),
            };
            link.send_chunk(node_id, addr, meta, local.to_vec()).await?;
        }
    } else {
        let meta = CollectiveMessageMeta {
            iteration,
            weight_name: weight_name.to_string(),
            phase: CollectivePhase::AllGather,
            chunk_index: 0,
            for_index: local_rank,
            send_node: rank0_node,
            recv_node: ring[local_rank].0.clone(),
        };
        let reduced = link.recv_chunk(&meta).await?;
        local.copy_from_slice(&reduced);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::InMemoryNetwork;

    async fn run_ring(
        net: &InMemoryNetwork,
        ring: &[(String, String)],
        buffers: Vec<Vec<f32>>,
    ) -> Vec<(bool, Vec<f32>)> {
        let tasks = buffers.into_iter().enumerate().map(|(rank, mut buf)| {
            let link = net.link_for(&ring[rank].0);
            let ring = ring.to_vec();
            async move {
                let ok = ring_all_reduce(&link, &ring, rank, 1, "w", &mut buf, || false).await.unwrap();
                (ok, buf)
            }
        });
        futures::future::join_all(tasks).await
    }

    #[tokio::test]
    async fn three_node_ring_all_reduce_sums_every_contribution() {
        let net = InMemoryNetwork::new();
        let ring = vec![
            ("a".to_string(), "addr-a".to_string()),
            ("b".to_string(), "addr-b".to_string()),
            ("c".to_string(), "addr-c".to_string()),
        ];
        let buffers = vec![vec![1.0f32, 2.0, 3.0, 4.0], vec![10.0, 20.0, 30.0, 40.0], vec![100.0, 200.0, 300.0, 400.0]];
        let results = run_ring(&net, &ring, buffers).await;
        for (ok, buf) in results {
            assert!(ok);
            assert_eq!(buf, vec![111.0, 222.0, 333.0, 444.0]);
        }
    }

    #[tokio::test]
    async fn fallback_path_used_when_elements_fewer_than_ring_size() {
        let net = InMemoryNetwork::new();
        let ring = vec![
            ("a".to_string(), "addr-a".to_string()),
            ("b".to_string(), "addr-b".to_string()),
            ("c".to_string(), "addr-c".to_string()),
        ];
        let buffers = vec![vec![1.0f32], vec![2.0], vec![3.0]];
        let results = run_ring(&net, &ring, buffers).await;
        for (ok, buf) in results {
            assert!(ok);
            assert_eq!(buf, vec![6.0]);
        }
    }

    #[tokio::test]
    async fn abort_flag_stops_the_exchange_early() {
        let net = InMemoryNetwork::new();
        let a = net.link_for("a");
        let ring = vec![("a".to_string(), "addr-a".to_string()), ("b".to_string(), "addr-b".to_string())];
        let mut buf = vec![1.0f32, 2.0];
        let ok = ring_all_reduce(&a, &ring, 0, 1, "w", &mut buf, || true).await.unwrap();
        assert!(!ok);
    }
}
