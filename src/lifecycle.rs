//! Service lifecycle
//!
//! Orchestrates startup (load one model per slot, spawn the slot loops) and
//! shutdown (stop admissions, drain within a grace period, force-cancel the
//! remainder): `Starting -> Ready -> Draining -> Stopped`.

use crate::arbiter::Arbiter;
use crate::config::ServiceConfig;
use crate::engine::llama::{LlamaEngine, LlamaEngineConfig};
use crate::engine::{EngineError, InferenceEngine};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Observable lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

/// Fatal startup failures. The service never reaches `Ready` with a
/// partially initialized pool.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Worker pool must have at least one slot")]
    NoWorkers,

    #[error("Failed to load model for slot {slot}: {source}")]
    ModelLoad {
        slot: usize,
        #[source]
        source: EngineError,
    },
}

/// Owns the arbiter, the worker slot tasks, and the lifecycle state machine.
pub struct Supervisor {
    arbiter: Arbiter,
    state_tx: watch::Sender<LifecycleState>,
    slots: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
    /// Serializes shutdown: one caller drains, later callers block on this
    /// until the service is `Stopped`.
    drain: tokio::sync::Mutex<()>,
}

impl Supervisor {
    /// Loads one model per configured worker slot and brings the service to
    /// `Ready`. Any load failure aborts startup.
    pub async fn start(config: &ServiceConfig) -> Result<Self, StartupError> {
        let mut engines = Vec::with_capacity(config.workers);
        for slot in 0..config.workers {
            let path = config.model_path.clone();
            let engine_config = LlamaEngineConfig {
                gpu_layers: config.gpu_layers,
                context_size: config.context_size,
            };
            tracing::info!(slot, model = %path.display(), "loading model");

            // Model loading is heavy blocking work (file I/O, VRAM upload).
            let engine = tokio::task::spawn_blocking(move || LlamaEngine::load(path, engine_config))
                .await
                .map_err(|e| StartupError::ModelLoad {
                    slot,
                    source: EngineError::Thread(e.to_string()),
                })?
                .map_err(|source| StartupError::ModelLoad { slot, source })?;
            engines.push(engine);
        }

        Self::with_engines(engines, config.queue_capacity)
    }

    /// Builds the supervisor around already-constructed engines, one slot
    /// per engine. Each slot exclusively owns its engine.
    pub fn with_engines<E: InferenceEngine>(
        engines: Vec<E>,
        queue_capacity: usize,
    ) -> Result<Self, StartupError> {
        if engines.is_empty() {
            return Err(StartupError::NoWorkers);
        }

        let (state_tx, _) = watch::channel(LifecycleState::Starting);
        let arbiter = Arbiter::new(queue_capacity);
        let shutdown_token = CancellationToken::new();

        let workers = engines.len();
        let slots = engines
            .into_iter()
            .enumerate()
            .map(|(slot_id, engine)| {
                tokio::spawn(crate::arbiter::slot::slot_loop(
                    slot_id,
                    engine,
                    arbiter.shared(),
                    shutdown_token.clone(),
                ))
            })
            .collect();

        state_tx.send_replace(LifecycleState::Ready);
        tracing::info!(workers, queue_capacity, "service ready");

        Ok(Self {
            arbiter,
            state_tx,
            slots: Mutex::new(slots),
            shutdown_token,
            drain: tokio::sync::Mutex::new(()),
        })
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Channel observing lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Drains and stops the service.
    ///
    /// New submissions are rejected immediately, every queued job terminates
    /// as `Cancelled`, and running jobs get up to `grace` to finish before
    /// their cancellation tokens are tripped. Blocks until all slot tasks
    /// have exited and the state is `Stopped`; concurrent callers block on
    /// the first drain and return only once it is `Stopped` too.
    pub async fn shutdown(&self, grace: Duration) {
        let _drain = self.drain.lock().await;
        if self.state() == LifecycleState::Stopped {
            return;
        }
        self.state_tx.send_replace(LifecycleState::Draining);
        tracing::info!(grace_secs = grace.as_secs_f64(), "draining");

        self.arbiter.stop_admissions();
        self.arbiter.cancel_all_queued();

        if tokio::time::timeout(grace, self.arbiter.idle()).await.is_err() {
            tracing::warn!(
                running = self.arbiter.running(),
                "grace period expired, force-cancelling in-flight jobs"
            );
            self.arbiter.force_cancel_running();
        }

        self.shutdown_token.cancel();
        let handles: Vec<JoinHandle<()>> = self.slots.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.state_tx.send_replace(LifecycleState::Stopped);
        tracing::info!("service stopped");
    }
}
