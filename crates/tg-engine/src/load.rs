// load.rs — LoadController: priority admission for classifications.
//
// Below `threshold` concurrent classifications, `admit()` hands out a permit
// immediately. At or above it, callers wait in a max-heap keyed on
// (priority, arrival order): when a permit is dropped, its slot passes
// directly to the highest-priority waiter, so deletions and force pushes are
// never starved behind a flood of routine script runs.
//
// Every wait is bounded by `deadline`. A caller that times out gets
// `EngineError::Overloaded`, which the engine turns into a manual-approval
// decision. Nothing waits forever and nothing is dropped silently.
//
// Slot accounting: `active` counts permits plus slots in transit to a woken
// waiter. A waiter that is woken after it stopped listening (timed out or
// its future was dropped) gives the slot back.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use tg_policy::{has_destructive_marker, Operation, OperationType};

use crate::error::EngineError;

/// Admission priority. Higher is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Routine = 0,
    Standard = 1,
    Elevated = 2,
    Critical = 3,
}

impl Priority {
    /// Destructive markers first, then version control and external
    /// services, then file and CLI work, then scripts and the unknown.
    pub fn of(op: &Operation) -> Self {
        if has_destructive_marker(op) {
            return Priority::Critical;
        }
        match op.effective_type() {
            OperationType::Git | OperationType::Mcp => Priority::Elevated,
            OperationType::File | OperationType::Cli => Priority::Standard,
            OperationType::Script | OperationType::Unknown => Priority::Routine,
        }
    }
}

struct Waiter {
    priority: Priority,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

#[derive(Default)]
struct LoadState {
    active: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Snapshot for `stats()`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LoadStats {
    pub threshold: usize,
    pub active: usize,
    pub queued: usize,
    pub admitted: u64,
    pub waited: u64,
    pub timed_out: u64,
}

pub struct LoadController {
    threshold: usize,
    deadline: Duration,
    state: Mutex<LoadState>,
    admitted: AtomicU64,
    waited: AtomicU64,
    timed_out: AtomicU64,
}

/// One admitted classification. Dropping it frees the slot.
pub struct LoadPermit {
    controller: Arc<LoadController>,
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

/// Removes a waiter that stops listening before it is admitted.
struct QueueTicket<'a> {
    controller: &'a Arc<LoadController>,
    seq: u64,
    armed: bool,
}

impl QueueTicket<'_> {
    /// Leave the queue. True when the slot was already handed to us.
    fn withdraw(&mut self) -> bool {
        self.armed = false;
        let mut state = self.controller.state.lock();
        let before = state.waiters.len();
        let seq = self.seq;
        state.waiters.retain(|w| w.seq != seq);
        state.waiters.len() == before
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.armed && self.withdraw() {
            self.controller.release();
        }
    }
}

impl LoadController {
    pub fn new(threshold: usize, deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            threshold: threshold.max(1),
            deadline,
            state: Mutex::new(LoadState::default()),
            admitted: AtomicU64::new(0),
            waited: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Wait for a classification slot.
    pub async fn admit(self: &Arc<Self>, priority: Priority) -> Result<LoadPermit, EngineError> {
        let (seq, mut woken) = {
            let mut state = self.state.lock();
            if state.active < self.threshold {
                state.active += 1;
                self.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(self.permit());
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter {
                priority,
                seq,
                wake: tx,
            });
            (seq, rx)
        };

        self.waited.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut ticket = QueueTicket {
            controller: self,
            seq,
            armed: true,
        };
        tracing::debug!(?priority, seq, "classification queued under load");

        // The receiver outlives the ticket so a slot sent to us is never lost.
        match tokio::time::timeout(self.deadline, &mut woken).await {
            Ok(Ok(())) => {
                ticket.armed = false;
                self.admitted.fetch_add(1, Ordering::Relaxed);
                Ok(self.permit())
            }
            _ => {
                if ticket.withdraw() {
                    // Woken between the deadline and the withdraw; take it.
                    self.admitted.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.permit());
                }
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(?priority, waited_ms, "admission deadline exceeded");
                Err(EngineError::Overloaded { waited_ms })
            }
        }
    }

    fn permit(self: &Arc<Self>) -> LoadPermit {
        LoadPermit {
            controller: Arc::clone(self),
        }
    }

    /// Pass the slot to the best live waiter, or free it.
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    pub fn stats(&self) -> LoadStats {
        let state = self.state.lock();
        LoadStats {
            threshold: self.threshold,
            active: state.active,
            queued: state.waiters.len(),
            admitted: self.admitted.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_policy::OperationContext;

    fn op(op_type: OperationType, command: &str, args: &[&str]) -> Operation {
        Operation::new(
            op_type,
            command,
            args.iter().copied(),
            OperationContext::new("/repo", "dev", "session-1234"),
        )
    }

    #[test]
    fn priority_ranks_destructive_first() {
        assert_eq!(
            Priority::of(&op(OperationType::Script, "bash", &["x.sh", "--force"])),
            Priority::Critical
        );
        assert_eq!(
            Priority::of(&op(OperationType::Git, "git", &["status"])),
            Priority::Elevated
        );
        assert_eq!(
            Priority::of(&op(OperationType::File, "read", &["a"])),
            Priority::Standard
        );
        assert_eq!(
            Priority::of(&op(OperationType::Script, "bash", &["scripts/a.sh"])),
            Priority::Routine
        );
        assert!(Priority::Critical > Priority::Routine);
    }

    #[tokio::test]
    async fn admits_immediately_below_threshold() {
        let lc = LoadController::new(2, Duration::from_millis(50));
        let a = lc.admit(Priority::Routine).await.unwrap();
        let _b = lc.admit(Priority::Routine).await.unwrap();
        assert_eq!(lc.stats().active, 2);
        drop(a);
        assert_eq!(lc.stats().active, 1);
    }

    #[tokio::test]
    async fn waiter_times_out_when_saturated() {
        let lc = LoadController::new(1, Duration::from_millis(20));
        let _held = lc.admit(Priority::Routine).await.unwrap();
        match lc.admit(Priority::Critical).await {
            Err(EngineError::Overloaded { .. }) => {}
            Err(other) => panic!("expected Overloaded, got {:?}", other),
            Ok(_) => panic!("expected Overloaded, got a permit"),
        }
        let s = lc.stats();
        assert_eq!((s.active, s.queued, s.timed_out), (1, 0, 1));
    }

    #[tokio::test]
    async fn released_slot_goes_to_highest_priority() {
        let lc = LoadController::new(1, Duration::from_secs(5));
        let held = lc.admit(Priority::Routine).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (i, priority) in [Priority::Routine, Priority::Critical, Priority::Standard]
            .into_iter()
            .enumerate()
        {
            let task_lc = lc.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = task_lc.admit(priority).await.unwrap();
                order.lock().push(priority);
                tokio::time::sleep(Duration::from_millis(5)).await;
                i
            }));
            // Let each waiter register before spawning the next.
            while lc.stats().queued < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            *order.lock(),
            vec![Priority::Critical, Priority::Standard, Priority::Routine]
        );
        assert_eq!(lc.stats().active, 0);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_leak_a_slot() {
        let lc = LoadController::new(1, Duration::from_secs(5));
        let held = lc.admit(Priority::Routine).await.unwrap();

        let waiting = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.admit(Priority::Routine).await.map(|_| ()) })
        };
        while lc.stats().queued < 1 {
            tokio::task::yield_now().await;
        }
        waiting.abort();
        let _ = waiting.await;

        drop(held);
        assert_eq!(lc.stats().active, 0);
        assert!(lc.admit(Priority::Routine).await.is_ok());
    }
}
