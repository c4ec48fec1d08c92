//! Worker slot
//!
//! Binds one exclusively-owned engine to at most one running job at a time.
//! A slot loop waits for queued work, dequeues the oldest job, runs the
//! generation outside any shared lock, and delivers the terminal outcome.

use super::Shared;
use crate::engine::{GenerateRequest, Generation, InferenceEngine, StopReason};
use crate::job::{CancelKind, JobEntry, JobOutcome};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Releases the running count even if the generation future is torn down,
/// so a slot can never stay marked busy.
struct RunGuard<'a> {
    shared: &'a Shared,
}

impl<'a> RunGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        shared.running.fetch_add(1, Ordering::AcqRel);
        Self { shared }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.shared.running.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) async fn slot_loop<E: InferenceEngine>(
    slot_id: usize,
    engine: E,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    tracing::debug!(slot = slot_id, "worker slot started");

    loop {
        // One semaphore permit per queued job; a permit without a matching
        // queue entry just means the job was cancelled while queued.
        let permit = tokio::select! {
            permit = shared.ready.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };
        permit.forget();

        let popped = { shared.queue.lock().unwrap().pop() };
        let Some(id) = popped else { continue };
        let Some(entry) = shared.jobs.get(&id).map(|e| Arc::clone(&e)) else {
            continue;
        };

        // A deadline that already passed while queued is a timeout, not a run.
        if let Some(deadline) = entry.spec.deadline {
            if deadline <= Instant::now() {
                entry.request_cancel(CancelKind::Deadline);
                entry.finalize(JobOutcome::TimedOut);
                continue;
            }
        }

        if !entry.mark_running() {
            // Finalized between dequeue and dispatch.
            continue;
        }

        let _guard = RunGuard::new(&shared);
        tracing::debug!(slot = slot_id, job = %id, "job dispatched");
        run_job(slot_id, &engine, &entry).await;
    }

    tracing::debug!(slot = slot_id, "worker slot stopped");
}

async fn run_job<E: InferenceEngine>(slot_id: usize, engine: &E, entry: &JobEntry) {
    let req = GenerateRequest {
        system_prompt: entry.spec.system_prompt.clone(),
        prompt: entry.spec.prompt.clone(),
        sampler: entry.spec.sampler.clone(),
        max_tokens: entry.spec.max_tokens,
        cancel: entry.cancel.clone(),
        sink: entry.sink(),
    };

    let outcome = match engine.generate(req).await {
        Ok(generation) => outcome_for(entry, generation),
        Err(e) => {
            tracing::warn!(slot = slot_id, job = %entry.id, error = %e, "generation failed");
            JobOutcome::Failed(e.to_string())
        }
    };

    entry.finalize(outcome);
}

/// Maps the engine result to a terminal outcome. A generation halted at a
/// cancellation checkpoint is attributed to whoever requested it: deadline
/// expiry reports `TimedOut`, everything else `Cancelled`.
fn outcome_for(entry: &JobEntry, generation: Generation) -> JobOutcome {
    match generation.stop {
        StopReason::Cancelled => entry
            .cancel_kind()
            .unwrap_or(CancelKind::Shutdown)
            .outcome(),
        StopReason::EndOfGeneration | StopReason::MaxTokens => {
            JobOutcome::Completed(generation.text)
        }
    }
}
