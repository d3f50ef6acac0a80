//! Iteration-task thread (spec §4.F) — drains callbacks queued by the counter and
//! timer services so aggregation and iteration transitions never race with request
//! handlers.
//!
//! Grounded on `iteration_task_thread.cc`/`iteration_task_thread.h` in
//! `examples/original_source/.../common/distributed_cache/`, translated from a
//! condvar-driven worker thread into a `tokio` task draining an `mpsc` channel —
//! the idiomatic async-Rust shape of the same single-consumer queue, matching the
//! teacher's reach for `tokio::sync` throughout `service_islands`.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Notify};

/// A boxed unit of work enqueued by a counter/timer callback. Tagged with the
/// iteration it belongs to so a stale task dropped in favor of a replacement never
/// mutates next iteration's state.
pub struct Task {
    pub event_iteration_num: u64,
    pub run: Box<dyn FnOnce() + Send + 'static>,
}

/// Single-consumer task queue with a `wait_all_task_finish` barrier (spec §4.F /
/// §5: the main loop awaits this before advancing the iteration).
pub struct IterationTaskThread {
    sender: mpsc::UnboundedSender<Task>,
    current_iteration: AtomicU64,
    idle: std::sync::Arc<Notify>,
    pending: std::sync::Arc<AtomicU64>,
}

impl IterationTaskThread {
    #[must_use]
    pub fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let pending = std::sync::Arc::new(AtomicU64::new(0));
        let idle = std::sync::Arc::new(Notify::new());
        let current_iteration = AtomicU64::new(1);

        let worker_pending = pending.clone();
        let worker_idle = idle.clone();
        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                let result = tokio::task::spawn_blocking(move || {
                    // The closure itself is expected to be a fast, synchronous state
                    // mutation (start/stop timer, kick off all-reduce). Panics are
                    // isolated here instead of killing the worker loop.
                    (task.run)();
                })
                .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, "iteration task panicked");
                }
                if worker_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    worker_idle.notify_waiters();
                }
            }
        });

        Self {
            sender,
            current_iteration,
            idle,
            pending,
        }
    }

    pub fn set_current_iteration(&self, iteration: u64) {
        self.current_iteration.store(iteration, Ordering::Release);
    }

    /// Enqueues `run` tagged with the iteration it applies to. The worker still
    /// executes it regardless of the iteration at drain time — it is the caller's
    /// responsibility to check `event_iteration_num` against the then-current
    /// iteration inside `run` if staleness matters (mirrors the original's
    /// `event_iteration_num` comparison at callback-fire time).
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, event_iteration_num: u64, run: F) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.sender.send(Task {
            event_iteration_num,
            run: Box::new(run),
        });
    }

    #[must_use]
    pub fn current_iteration(&self) -> u64 {
        self.current_iteration.load(Ordering::Acquire)
    }

    /// Tracks one unit of async work (the ring all-reduce callback, which needs
    /// `await` and so can't run as a boxed `enqueue` closure on the
    /// `spawn_blocking` worker) against the same pending counter `enqueue`
    /// uses, so `wait_all_task_finish` blocks on it too.
    pub async fn run_tracked<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let result = fut.await;
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
        result
    }

    /// `WaitAllTaskFinish` (spec §4.F).
    pub async fn wait_all_task_finish(&self) {
        while self.pending.load(Ordering::Acquire) > 0 {
            self.idle.notified().await;
        }
    }
}
