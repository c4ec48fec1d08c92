//! Inference engine seam
//!
//! The arbiter treats text generation as an opaque capability behind the
//! [`InferenceEngine`] trait: one call, one generation, cancellation polled
//! between token-production steps. The production implementation wraps
//! llama.cpp ([`llama::LlamaEngine`]); tests use a scripted mock.

pub mod gguf;
pub mod llama;

use crate::sampler::SamplerConfig;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors reported by an inference engine
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Engine thread error: {0}")]
    Thread(String),
}

impl From<gguf::GgufError> for EngineError {
    fn from(e: gguf::GgufError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model emitted an end-of-generation token.
    EndOfGeneration,
    /// The output token budget was exhausted.
    MaxTokens,
    /// The cancellation token tripped and generation halted at the next
    /// checkpoint.
    Cancelled,
}

/// Result of one generation.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Full text produced, including anything already streamed.
    pub text: String,
    /// Number of output tokens produced.
    pub tokens: u32,
    pub stop: StopReason,
}

/// Everything the engine needs for one generation.
pub struct GenerateRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub sampler: SamplerConfig,
    pub max_tokens: u32,
    /// Polled between token-production steps; generation halts at the next
    /// checkpoint after it trips, never mid-token.
    pub cancel: CancellationToken,
    /// Optional sink receiving token fragments as they are produced.
    pub sink: Option<mpsc::Sender<String>>,
}

/// A stateful inference context able to run one generation at a time.
///
/// Each worker slot exclusively owns one engine instance for the process
/// lifetime; the trait never requires `&mut self` because implementations
/// serialize generations internally (the llama engine through its dedicated
/// thread).
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    async fn generate(&self, req: GenerateRequest) -> Result<Generation, EngineError>;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scripted engine for arbiter and lifecycle tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Emits a fixed list of fragments with a simulated per-token delay,
    /// honoring the cancellation checkpoint contract between fragments.
    pub(crate) struct MockEngine {
        pub fragments: Vec<String>,
        pub step: Duration,
        /// Prompts in dispatch order, shared across slots.
        pub log: Arc<Mutex<Vec<String>>>,
        pub active: Arc<AtomicUsize>,
        pub peak: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl MockEngine {
        pub fn new(step: Duration) -> Self {
            Self {
                fragments: vec!["hello".to_string(), " ".to_string(), "world".to_string()],
                step,
                log: Arc::new(Mutex::new(Vec::new())),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl InferenceEngine for MockEngine {
        async fn generate(&self, req: GenerateRequest) -> Result<Generation, EngineError> {
            self.log.lock().unwrap().push(req.prompt.clone());
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            let result = self.run(&req).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl MockEngine {
        async fn run(&self, req: &GenerateRequest) -> Result<Generation, EngineError> {
            let mut text = String::new();
            let mut tokens = 0u32;

            for fragment in &self.fragments {
                tokio::select! {
                    _ = tokio::time::sleep(self.step) => {}
                    _ = req.cancel.cancelled() => {
                        return Ok(Generation { text, tokens, stop: StopReason::Cancelled });
                    }
                }

                if self.fail {
                    return Err(EngineError::Inference("scripted failure".to_string()));
                }

                text.push_str(fragment);
                tokens += 1;
                if let Some(sink) = &req.sink {
                    let _ = sink.send(fragment.clone()).await;
                }
                if tokens >= req.max_tokens {
                    return Ok(Generation { text, tokens, stop: StopReason::MaxTokens });
                }
            }

            Ok(Generation {
                text,
                tokens,
                stop: StopReason::EndOfGeneration,
            })
        }
    }
}
