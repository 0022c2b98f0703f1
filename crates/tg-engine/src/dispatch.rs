// dispatch.rs — Bounded, drop-oldest hand-off to the audit and metrics sinks.
//
// `enqueue()` never blocks and never fails: it pushes onto a VecDeque of at
// most `capacity` items, evicting the oldest item when full, and wakes the
// worker. The worker is a tokio task spawned on first use; it drains the
// queue in batches and calls the sinks inside `spawn_blocking`, since audit
// loggers do synchronous file I/O.
//
// A sink that errors or panics is logged and counted. Nothing it does can
// reach the caller of `evaluate()`.
//
// Outside a tokio runtime (or after `shutdown()`), items are delivered
// inline on the calling thread.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use tg_audit::{AuditLogger, DecisionRecord, MetricsCollector, OperationSample};

/// One unit of work for the sinks.
#[derive(Debug, Clone)]
pub enum DispatchItem {
    /// A fresh decision. The record goes to the audit logger (when present)
    /// and the sample to the metrics collector.
    Decision {
        record: Option<DecisionRecord>,
        sample: OperationSample,
    },
    /// An execution outcome reported after the fact.
    Execution(DecisionRecord),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub capacity: usize,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub sink_failures: u64,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<DispatchItem>,
    /// Items taken by the worker but not yet delivered.
    in_flight: usize,
    closed: bool,
}

struct Shared {
    capacity: usize,
    queue: Mutex<Queue>,
    wake: Notify,
    audit: Arc<dyn AuditLogger>,
    metrics: Arc<dyn MetricsCollector>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    sink_failures: AtomicU64,
}

impl Shared {
    fn deliver(&self, item: DispatchItem) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match &item {
            DispatchItem::Decision { record, sample } => {
                let mut failures = 0;
                if let Some(record) = record {
                    if let Err(e) = self.audit.log_decision(record) {
                        tracing::warn!(record_id = %record.record_id, error = %e, "audit sink failed");
                        failures += 1;
                    }
                }
                if let Err(e) = self.metrics.record_operation(sample) {
                    tracing::warn!(error = %e, "metrics sink failed");
                    failures += 1;
                }
                failures
            }
            DispatchItem::Execution(record) => match self.audit.log_decision(record) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::warn!(record_id = %record.record_id, error = %e, "audit sink failed");
                    1
                }
            },
        }));
        match outcome {
            Ok(0) => {}
            Ok(n) => {
                self.sink_failures.fetch_add(n, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::warn!("sink panicked while delivering a record");
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        capacity: usize,
        audit: Arc<dyn AuditLogger>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                capacity: capacity.max(1),
                queue: Mutex::new(Queue::default()),
                wake: Notify::new(),
                audit,
                metrics,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                sink_failures: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Queue an item for the sinks. Never blocks.
    pub fn enqueue(&self, item: DispatchItem) {
        if !self.ensure_worker() {
            self.shared.deliver(item);
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.items.len() >= self.shared.capacity {
                queue.items.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "dispatch queue full, dropped oldest record");
            }
            queue.items.push_back(item);
        }
        self.shared.wake.notify_one();
    }

    /// Spawn the worker if needed. False when items must be delivered inline.
    fn ensure_worker(&self) -> bool {
        if self.shared.queue.lock().closed {
            return false;
        }
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return true;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let shared = Arc::clone(&self.shared);
        *worker = Some(handle.spawn(run_worker(shared)));
        true
    }

    /// Wait until everything queued so far has been delivered.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            {
                let queue = self.shared.queue.lock();
                if queue.items.is_empty() && queue.in_flight == 0 {
                    return true;
                }
            }
            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Deliver what is queued, then stop the worker.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shared.queue.lock().closed = true;
        self.shared.wake.notify_one();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("dispatch worker did not stop within {:?}", timeout);
            }
        }
        // Anything left (worker gone or timed out) is delivered inline.
        let rest: Vec<DispatchItem> = self.shared.queue.lock().items.drain(..).collect();
        for item in rest {
            self.shared.deliver(item);
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            capacity: self.shared.capacity,
            queued: self.shared.queue.lock().items.len(),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            sink_failures: self.shared.sink_failures.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let batch: Vec<DispatchItem> = {
            let mut queue = shared.queue.lock();
            if queue.items.is_empty() {
                if queue.closed {
                    break;
                }
                Vec::new()
            } else {
                let batch: Vec<_> = queue.items.drain(..).collect();
                queue.in_flight = batch.len();
                batch
            }
        };
        if batch.is_empty() {
            shared.wake.notified().await;
            continue;
        }

        let sinks = Arc::clone(&shared);
        let delivered = tokio::task::spawn_blocking(move || {
            for item in batch {
                sinks.deliver(item);
            }
        })
        .await;
        if let Err(e) = delivered {
            tracing::warn!(error = %e, "dispatch batch aborted");
        }
        shared.queue.lock().in_flight = 0;
    }
    tracing::debug!("dispatch worker stopped");
}
