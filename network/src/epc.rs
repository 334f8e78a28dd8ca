//! Execute-produce-consume worker pool.
//!
//! One worker at a time holds the producer role and asks the `TaskProducer`
//! for the next unit of work. When it gets one it hands the role off (waking
//! or spawning another worker) and consumes the task itself. Production from
//! in-memory state therefore never starves behind socket I/O, and only the
//! producer ever blocks, and only inside `produce_task(can_block = true)`,
//! bounded by the producer's own select timeout.
//!
//! The pool grows on demand up to `max_workers` and shrinks back to
//! `min_workers` after `keepalive` of idleness.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{trace, warn};

/// A unit of work handed from the producer to a consumer.
pub type ProducedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of work for the pool.
#[async_trait]
pub trait TaskProducer: Send + Sync + 'static {
    /// Return the next unit of work, or `None` when there is nothing to do.
    /// Only when `can_block` is true may the implementation wait (briefly)
    /// for external readiness.
    async fn produce_task(&self, can_block: bool) -> Option<ProducedTask>;
}

pub struct ExecuteProduceConsume {
    producer: Arc<dyn TaskProducer>,
    /// Single-slot producer role: whoever holds this lock is the producer.
    producer_slot: Mutex<()>,
    /// Live worker tasks.
    workers: AtomicUsize,
    /// Workers currently consuming a task.
    consumers: AtomicUsize,
    min_workers: usize,
    max_workers: usize,
    keepalive: Duration,
    shutting_down: AtomicBool,
    /// Wakes idle workers on shutdown.
    shutdown_wake: Notify,
    /// Signalled whenever a worker exits, for shutdown to observe.
    worker_exit: Notify,
}

impl ExecuteProduceConsume {
    pub fn new(producer: Arc<dyn TaskProducer>, min_workers: usize, max_workers: usize) -> Arc<Self> {
        Arc::new(ExecuteProduceConsume {
            producer,
            producer_slot: Mutex::new(()),
            workers: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            min_workers: min_workers.max(1),
            max_workers: max_workers.max(min_workers.max(1)),
            keepalive: Duration::from_secs(10),
            shutting_down: AtomicBool::new(false),
            shutdown_wake: Notify::new(),
            worker_exit: Notify::new(),
        })
    }

    /// Spawn the initial workers.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.min_workers {
            self.spawn_worker();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    fn spawn_worker(self: &Arc<Self>) {
        self.workers.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.run_worker().await;
            pool.workers.fetch_sub(1, Ordering::SeqCst);
            pool.worker_exit.notify_one();
        });
    }

    /// Make sure someone is free to take over production after we hand a
    /// task off. Idle workers are already queued on the producer slot, so a
    /// spawn is only needed when every live worker is consuming.
    fn ensure_producer_successor(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let live = self.workers.load(Ordering::SeqCst);
        let consuming = self.consumers.load(Ordering::SeqCst);
        if live <= consuming + 1 && live < self.max_workers {
            self.spawn_worker();
        }
    }

    async fn run_worker(self: &Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            // Compete for the producer role, giving up after `keepalive` if
            // the pool is over its floor.
            let slot = tokio::select! {
                slot = self.producer_slot.lock() => slot,
                _ = self.shutdown_wake.notified() => continue,
                _ = tokio::time::sleep(self.keepalive) => {
                    if self.workers.load(Ordering::SeqCst) > self.min_workers {
                        trace!("idle worker retiring");
                        return;
                    }
                    continue;
                }
            };

            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            // Blocking in produce is only safe when every other worker is
            // busy consuming; otherwise an idle worker could be producing
            // instead.
            let consuming = self.consumers.load(Ordering::SeqCst);
            let live = self.workers.load(Ordering::SeqCst);
            let can_block = live == consuming + 1;

            let task = self.producer.produce_task(can_block).await;
            drop(slot);

            match task {
                Some(task) => {
                    self.ensure_producer_successor();
                    self.consumers.fetch_add(1, Ordering::SeqCst);
                    task.await;
                    self.consumers.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    // Nothing to do. A surplus worker retires so the
                    // survivor can produce with blocking allowed; the floor
                    // worker just yields the slot briefly.
                    if !can_block {
                        if self.workers.load(Ordering::SeqCst) > self.min_workers {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            }
        }
    }

    /// Stop producing, wake idle workers and wait up to `grace` for all
    /// workers to drain. Returns whether the pool emptied in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_wake.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        while self.workers.load(Ordering::SeqCst) > 0 {
            let wait = self.worker_exit.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                if self.workers.load(Ordering::SeqCst) > 0 {
                    warn!(
                        remaining = self.workers.load(Ordering::SeqCst),
                        "worker pool failed to drain in time"
                    );
                    return false;
                }
            }
        }
        true
    }
}
