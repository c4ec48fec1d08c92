//! Generation arbiter
//!
//! The single serialization point between concurrent callers and the scarce
//! inference slots: admission control, a bounded FIFO queue, dispatch to
//! idle slots, deadline watchdogs, and cancellation propagation.
//!
//! `submit` never blocks (accept or reject), and a caller waiting on a
//! result blocks only on that job's own completion channel. The queue lock
//! is held for dequeue/assign bookkeeping only, never across a generation.

mod queue;
pub(crate) mod slot;

use crate::job::{CancelKind, JobEntry, JobId, JobOutcome, JobSpec};
use dashmap::DashMap;
use queue::PendingQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

/// Admission rejections surfaced to the front end.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Queue capacity is exhausted; the caller should retry later.
    #[error("Queue is full ({capacity} jobs pending)")]
    QueueFull { capacity: usize },

    /// The service is draining and admits no new jobs.
    #[error("Service is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("No such job: {0}")]
pub struct UnknownJob(pub JobId);

/// State shared between the arbiter handle and the worker slots.
pub(crate) struct Shared {
    pub jobs: DashMap<JobId, Arc<JobEntry>>,
    pub queue: Mutex<PendingQueue>,
    /// Carries one permit per queued job; slots block here when idle.
    pub ready: Semaphore,
    pub accepting: AtomicBool,
    /// Jobs currently bound to a slot.
    pub running: AtomicUsize,
}

#[derive(Clone)]
pub struct Arbiter {
    shared: Arc<Shared>,
}

impl Arbiter {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: DashMap::new(),
                queue: Mutex::new(PendingQueue::new(queue_capacity)),
                ready: Semaphore::new(0),
                accepting: AtomicBool::new(true),
                running: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Admits a job into the pending queue, or rejects it immediately.
    ///
    /// Never blocks. The optional sink receives token fragments as the
    /// engine produces them; the final outcome is always delivered through
    /// [`Arbiter::await_result`].
    pub fn submit(
        &self,
        spec: JobSpec,
        sink: Option<mpsc::Sender<String>>,
    ) -> Result<JobId, SubmitError> {
        let entry = JobEntry::new(spec, sink);
        let id = entry.id;

        {
            let mut queue = self.shared.queue.lock().unwrap();
            // Checked under the queue lock: `stop_admissions` flips the flag
            // under the same lock, so no submit can slip a job in after the
            // shutdown drain has swept the queue.
            if !self.shared.accepting.load(Ordering::Acquire) {
                return Err(SubmitError::ShuttingDown);
            }
            if !queue.push(id) {
                return Err(SubmitError::QueueFull {
                    capacity: queue.capacity(),
                });
            }
            self.shared.jobs.insert(id, Arc::clone(&entry));
        }
        self.shared.ready.add_permits(1);

        if let Some(deadline) = entry.spec.deadline {
            self.spawn_deadline_watchdog(Arc::clone(&entry), deadline);
        }

        tracing::debug!(job = %id, queued = self.queue_len(), "job queued");
        Ok(id)
    }

    /// Cancels a job on behalf of the caller.
    ///
    /// A queued job is removed and terminates as `Cancelled` immediately; a
    /// running job is signalled and terminates at the engine's next
    /// cancellation checkpoint.
    pub fn cancel(&self, id: JobId) -> Result<(), UnknownJob> {
        let entry = self
            .shared
            .jobs
            .get(&id)
            .map(|e| Arc::clone(&e))
            .ok_or(UnknownJob(id))?;
        self.cancel_entry(&entry, CancelKind::Caller);
        Ok(())
    }

    /// Cancels a job and releases its bookkeeping in the background.
    ///
    /// For callers that go away without collecting the outcome (client
    /// disconnects). Without this, a job whose waiter never returns to
    /// `await_result` would stay in the job table forever.
    pub fn abandon(&self, id: JobId) {
        let Some(entry) = self.shared.jobs.get(&id).map(|e| Arc::clone(&e)) else {
            return;
        };
        self.cancel_entry(&entry, CancelKind::Caller);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut rx = entry.subscribe();
            let _ = rx.wait_for(|outcome| outcome.is_some()).await;
            shared.jobs.remove(&entry.id);
        });
    }

    /// Waits for the job's terminal outcome, then releases its bookkeeping.
    pub async fn await_result(&self, id: JobId) -> Result<JobOutcome, UnknownJob> {
        let entry = self
            .shared
            .jobs
            .get(&id)
            .map(|e| Arc::clone(&e))
            .ok_or(UnknownJob(id))?;

        let mut rx = entry.subscribe();
        let outcome = {
            let guard = rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| UnknownJob(id))?;
            guard.clone()
        };

        self.shared.jobs.remove(&id);
        outcome.ok_or(UnknownJob(id))
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Jobs currently held in the tracking table (queued, running, or
    /// terminal-but-undelivered).
    pub fn tracked_jobs(&self) -> usize {
        self.shared.jobs.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Routes a cancellation to wherever the job currently is: still queued
    /// means remove-and-finalize here; running means the owning slot
    /// finalizes once the engine acknowledges the checkpoint.
    fn cancel_entry(&self, entry: &Arc<JobEntry>, kind: CancelKind) {
        let Some(state_at_request) = entry.request_cancel(kind) else {
            return;
        };

        if state_at_request == crate::job::JobState::Queued {
            let removed = { self.shared.queue.lock().unwrap().remove(entry.id) };
            if removed {
                entry.finalize(kind.outcome());
            }
            // Not removed: a slot already dequeued it and will observe the
            // tripped token.
        }
    }

    fn spawn_deadline_watchdog(&self, entry: Arc<JobEntry>, deadline: tokio::time::Instant) {
        let arbiter = self.clone();
        tokio::spawn(async move {
            let mut done = entry.subscribe();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(job = %entry.id, "deadline expired");
                    arbiter.cancel_entry(&entry, CancelKind::Deadline);
                }
                _ = done.wait_for(|outcome| outcome.is_some()) => {}
            }
        });
    }

    // --- lifecycle hooks -------------------------------------------------

    /// Stops admitting new jobs; `submit` rejects with `ShuttingDown`.
    ///
    /// The flag flips under the queue lock, so once this returns no further
    /// job can enter the queue and the drain that follows is exhaustive.
    pub(crate) fn stop_admissions(&self) {
        let _queue = self.shared.queue.lock().unwrap();
        self.shared.accepting.store(false, Ordering::Release);
    }

    /// Terminates every queued job as `Cancelled`. Nothing is silently
    /// dropped: each drained job gets a terminal state and outcome.
    pub(crate) fn cancel_all_queued(&self) {
        let drained = { self.shared.queue.lock().unwrap().drain() };
        for id in drained {
            if let Some(entry) = self.shared.jobs.get(&id).map(|e| Arc::clone(&e)) {
                entry.request_cancel(CancelKind::Shutdown);
                entry.finalize(JobOutcome::Cancelled);
            }
        }
    }

    /// Trips the cancellation token of every non-terminal job. Used when the
    /// shutdown grace period expires.
    pub(crate) fn force_cancel_running(&self) {
        for entry in self.shared.jobs.iter() {
            let entry = Arc::clone(&entry);
            self.cancel_entry(&entry, CancelKind::Shutdown);
        }
    }

    /// Resolves once no job is bound to any slot. Polling is fine here; this
    /// only runs during drain.
    pub(crate) async fn idle(&self) {
        while self.running() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
