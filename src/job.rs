//! Job tracking
//!
//! One chat request in flight, from admission through its terminal state.
//! State transitions are monotonic: a job never returns to an earlier state,
//! and the first terminal outcome wins.

use crate::sampler::SamplerConfig;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier of a job.
pub type JobId = Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting in the pending queue.
    Queued,
    /// Bound to a worker slot, generation in progress.
    Running,
    /// Generation finished normally.
    Completed,
    /// The engine reported an error.
    Failed,
    /// Terminated by the caller or by shutdown.
    Cancelled,
    /// Terminated because its deadline expired.
    TimedOut,
}

impl JobState {
    /// Returns true once the job can no longer change state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }

    /// Monotonic transition check. Queued jobs may start running or be
    /// terminated without ever running; running jobs may only terminate.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match self {
            JobState::Queued => matches!(
                next,
                JobState::Running | JobState::Cancelled | JobState::TimedOut
            ),
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Who asked for a job to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// The caller cancelled or disconnected.
    Caller,
    /// The job's deadline expired.
    Deadline,
    /// The service is draining or the grace period ran out.
    Shutdown,
}

impl CancelKind {
    /// The terminal state this cancellation maps to. Deadline expiry is
    /// reported as `TimedOut` to distinguish it from caller-initiated
    /// cancellation.
    pub fn terminal_state(self) -> JobState {
        match self {
            CancelKind::Deadline => JobState::TimedOut,
            CancelKind::Caller | CancelKind::Shutdown => JobState::Cancelled,
        }
    }

    /// The outcome delivered for a job terminated by this cancellation.
    pub fn outcome(self) -> JobOutcome {
        match self {
            CancelKind::Deadline => JobOutcome::TimedOut,
            CancelKind::Caller | CancelKind::Shutdown => JobOutcome::Cancelled,
        }
    }
}

/// Terminal result of a job, delivered through its completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
    TimedOut,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Cancelled => JobState::Cancelled,
            JobOutcome::TimedOut => JobState::TimedOut,
        }
    }
}

/// Immutable description of one chat request.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// User prompt text.
    pub prompt: String,
    /// Optional system prompt prepended via the model's chat template.
    pub system_prompt: Option<String>,
    /// Sampling parameters, passed opaquely to the engine.
    pub sampler: SamplerConfig,
    /// Maximum number of output tokens.
    pub max_tokens: u32,
    /// Absolute deadline, or none.
    pub deadline: Option<Instant>,
}

struct StateCell {
    state: JobState,
    /// First cancellation request wins; consulted when the engine stops at a
    /// cancellation checkpoint to pick the terminal state.
    cancel_requested: Option<CancelKind>,
}

/// Shared bookkeeping for one job.
///
/// Mutated only by the arbiter (state transitions) and the owning worker
/// slot (outcome delivery). The state mutex is held for bookkeeping only,
/// never across generation.
pub(crate) struct JobEntry {
    pub id: JobId,
    pub spec: JobSpec,
    pub cancel: CancellationToken,
    cell: Mutex<StateCell>,
    outcome_tx: watch::Sender<Option<JobOutcome>>,
    sink: Mutex<Option<mpsc::Sender<String>>>,
}

impl JobEntry {
    pub fn new(spec: JobSpec, sink: Option<mpsc::Sender<String>>) -> std::sync::Arc<Self> {
        let (outcome_tx, _) = watch::channel(None);
        std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            spec,
            cancel: CancellationToken::new(),
            cell: Mutex::new(StateCell {
                state: JobState::Queued,
                cancel_requested: None,
            }),
            outcome_tx,
            sink: Mutex::new(sink),
        })
    }

    pub fn state(&self) -> JobState {
        self.cell.lock().unwrap().state
    }

    /// Channel observing the terminal outcome.
    pub fn subscribe(&self) -> watch::Receiver<Option<JobOutcome>> {
        self.outcome_tx.subscribe()
    }

    /// Streaming sink handed to the engine for this generation, if any.
    pub fn sink(&self) -> Option<mpsc::Sender<String>> {
        self.sink.lock().unwrap().clone()
    }

    /// Queued -> Running. Returns false if the job was already terminated
    /// (e.g. cancelled between dequeue and dispatch).
    pub fn mark_running(&self) -> bool {
        let mut cell = self.cell.lock().unwrap();
        if !cell.state.can_transition_to(JobState::Running) {
            return false;
        }
        cell.state = JobState::Running;
        true
    }

    /// Records a cancellation request and trips the token.
    ///
    /// Returns the state the job was in when the request was recorded, or
    /// `None` if the job was already terminal or a cancellation was already
    /// pending. The caller uses the returned state to decide whether the job
    /// must be pulled out of the queue.
    pub fn request_cancel(&self, kind: CancelKind) -> Option<JobState> {
        let state = {
            let mut cell = self.cell.lock().unwrap();
            if cell.state.is_terminal() || cell.cancel_requested.is_some() {
                return None;
            }
            cell.cancel_requested = Some(kind);
            cell.state
        };
        self.cancel.cancel();
        Some(state)
    }

    /// The pending cancellation cause, if one was recorded.
    pub fn cancel_kind(&self) -> Option<CancelKind> {
        self.cell.lock().unwrap().cancel_requested
    }

    /// Moves the job to a terminal state and publishes the outcome.
    ///
    /// The first finalize wins; later calls are ignored. Dropping the sink
    /// here closes the caller's token stream once the job is terminal.
    pub fn finalize(&self, outcome: JobOutcome) -> bool {
        {
            let mut cell = self.cell.lock().unwrap();
            if !cell.state.can_transition_to(outcome.state()) {
                return false;
            }
            cell.state = outcome.state();
        }
        self.sink.lock().unwrap().take();
        tracing::debug!(job = %self.id, state = %outcome.state(), "job finished");
        // send_replace stores the outcome even with no receiver around yet,
        // so a waiter subscribing after finalization still observes it.
        self.outcome_tx.send_replace(Some(outcome));
        true
    }
}
