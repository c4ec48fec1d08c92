//! llama.cpp-backed inference engine
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, so each [`LlamaEngine`] owns a dedicated
//! OS thread that holds the model and its generation context. Requests cross
//! over channels; exactly one generation runs against a given engine at a
//! time, which is what keeps the context cache coherent.
//!
//! The process-wide llama backend is initialized once and shared by every
//! engine thread.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;
use std::{sync::mpsc, thread};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;

use crate::engine::{
    gguf, EngineError, GenerateRequest, Generation, InferenceEngine, StopReason,
};

/// The llama backend may only be initialized once per process, regardless of
/// how many engine threads load models.
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))
    })
}

/// Tuning knobs fixed when the model is loaded.
#[derive(Debug, Clone)]
pub struct LlamaEngineConfig {
    /// Number of layers to offload to GPU (0 = CPU only, high value = all to GPU)
    pub gpu_layers: u32,
    /// Context window size
    pub context_size: u32,
}

impl Default for LlamaEngineConfig {
    fn default() -> Self {
        Self {
            gpu_layers: 99,
            context_size: 4096,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

enum EngineCommand {
    Generate {
        req: GenerateRequest,
        reply: oneshot::Sender<Result<Generation, EngineError>>,
    },
    Shutdown,
}

/// One loaded model plus its mutable generation state, owned by a dedicated
/// worker thread.
pub struct LlamaEngine {
    command_tx: Option<Sender<EngineCommand>>,
    thread: Option<JoinHandle<()>>,
    info: LoadedModelInfo,
}

impl LlamaEngine {
    /// Loads a GGUF model and spins up its owning thread.
    ///
    /// Blocks until the model is resident; a load failure tears the thread
    /// down and is returned to the caller.
    pub fn load<P: AsRef<Path>>(path: P, config: LlamaEngineConfig) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();

        // Cheap header check before committing to the full load.
        gguf::validate(&path)?;

        let (command_tx, command_rx) = mpsc::channel();
        let (loaded_tx, loaded_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("llama-engine".to_string())
            .spawn(move || engine_thread(path, config, command_rx, loaded_tx))
            .map_err(|e| EngineError::Thread(e.to_string()))?;

        let info = loaded_rx
            .recv()
            .map_err(|e| EngineError::Thread(e.to_string()))??;

        tracing::info!(
            model = %info.path,
            params = info.param_count,
            vocab = info.vocab_size,
            ctx_train = info.context_length,
            "model loaded"
        );

        Ok(Self {
            command_tx: Some(command_tx),
            thread: Some(thread),
            info,
        })
    }

    /// Information about the loaded model.
    pub fn info(&self) -> &LoadedModelInfo {
        &self.info
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(EngineCommand::Shutdown);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[async_trait::async_trait]
impl InferenceEngine for LlamaEngine {
    async fn generate(&self, req: GenerateRequest) -> Result<Generation, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or_else(|| EngineError::Thread("engine thread stopped".to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx
            .send(EngineCommand::Generate {
                req,
                reply: reply_tx,
            })
            .map_err(|e| EngineError::Thread(e.to_string()))?;

        reply_rx
            .await
            .map_err(|e| EngineError::Thread(e.to_string()))?
    }
}

/// Engine thread main: loads the model, reports the result, then serves
/// generation commands until shutdown.
fn engine_thread(
    path: PathBuf,
    config: LlamaEngineConfig,
    command_rx: Receiver<EngineCommand>,
    loaded_tx: Sender<Result<LoadedModelInfo, EngineError>>,
) {
    let model = match load_model(&path, &config) {
        Ok((model, info)) => {
            let _ = loaded_tx.send(Ok(info));
            model
        }
        Err(e) => {
            let _ = loaded_tx.send(Err(e));
            return;
        }
    };

    while let Ok(command) = command_rx.recv() {
        match command {
            EngineCommand::Generate { req, reply } => {
                let result = run_generation(&model, &config, req);
                let _ = reply.send(result);
            }
            EngineCommand::Shutdown => break,
        }
    }

    tracing::debug!("engine thread exiting");
}

fn load_model(
    path: &Path,
    config: &LlamaEngineConfig,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let backend = backend()?;

    let model_params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    Ok((model, info))
}

fn run_generation(
    model: &LlamaModel,
    config: &LlamaEngineConfig,
    req: GenerateRequest,
) -> Result<Generation, EngineError> {
    let prompt = match build_prompt(model, req.system_prompt.as_deref(), &req.prompt) {
        Ok(templated) => templated,
        Err(error) => {
            tracing::warn!("Chat template not applied: {error}");
            match &req.system_prompt {
                Some(system) => format!("{system}\n\n{}", req.prompt),
                None => req.prompt.clone(),
            }
        }
    };

    // Use the configured context size, capped at the model's trained length
    // with a 2K floor.
    let n_ctx = std::cmp::min(config.context_size, model.n_ctx_train()).max(2048);
    let n_ctx = NonZeroU32::new(n_ctx)
        .ok_or_else(|| EngineError::ContextCreate("context size is zero".to_string()))?;

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_batch(512);

    let mut ctx = model
        .new_context(backend()?, ctx_params)
        .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;

    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    decode_loop(&mut ctx, model, tokens, req)
}

/// Applies the model's chat template to the system and user messages.
fn build_prompt(
    model: &LlamaModel,
    system_prompt: Option<&str>,
    user_prompt: &str,
) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system_prompt {
        messages.push(
            LlamaChatMessage::new("system".to_string(), system.to_string())
                .map_err(|e| format!("Failed to build system message: {e}"))?,
        );
    }
    messages.push(
        LlamaChatMessage::new("user".to_string(), user_prompt.to_string())
            .map_err(|e| format!("Failed to build user message: {e}"))?,
    );

    model
        .apply_chat_template(&template, &messages, true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

/// Token production loop. The cancellation token is checked once per
/// iteration, so a cancelled job halts within the cost of one token.
fn decode_loop(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    prompt_tokens: Vec<llama_cpp_2::token::LlamaToken>,
    req: GenerateRequest,
) -> Result<Generation, EngineError> {
    let mut batch = LlamaBatch::new(512, 1);

    for (i, token) in prompt_tokens.iter().enumerate() {
        let is_last = i == prompt_tokens.len() - 1;
        batch
            .add(*token, i as i32, &[0], is_last)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
    }

    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(e.to_string()))?;

    let seed = req.sampler.resolve_seed();
    let mut sampler = if req.sampler.temperature < 0.01 {
        // Greedy sampling for near-zero temperature
        LlamaSampler::greedy()
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(req.sampler.top_k as i32),
            LlamaSampler::top_p(req.sampler.top_p, 1),
            LlamaSampler::temp(req.sampler.temperature),
            LlamaSampler::dist(seed),
        ])
    };

    let mut n_decoded = prompt_tokens.len() as i32;
    let mut text = String::new();
    let mut produced = 0u32;
    let mut assembler = Utf8Assembler::new();
    let mut stream = FragmentStream::new(req.sink.clone());
    let mut stop = StopReason::MaxTokens;

    for _ in 0..req.max_tokens {
        if req.cancel.is_cancelled() {
            tracing::debug!("generation halted at cancellation checkpoint");
            stop = StopReason::Cancelled;
            break;
        }

        let new_token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(new_token);

        if model.is_eog_token(new_token) {
            stop = StopReason::EndOfGeneration;
            break;
        }

        let token_bytes = model
            .token_to_bytes(new_token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(e.to_string()))?;

        if let Some(fragment) = assembler.push(&token_bytes) {
            text.push_str(&fragment);
            stream.push(fragment);
        }

        produced += 1;

        batch.clear();
        batch
            .add(new_token, n_decoded, &[0], true)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(e.to_string()))?;
        n_decoded += 1;
    }

    if let Some(rest) = assembler.flush() {
        text.push_str(&rest);
        stream.push(rest);
    }
    stream.flush();

    Ok(Generation {
        text,
        tokens: produced,
        stop,
    })
}

/// Forwards fragments to the caller's sink without ever blocking the engine
/// thread, so the cancellation checkpoint stays reachable even when a client
/// stops draining its stream.
///
/// A full sink buffers the fragment and coalesces it into the next
/// successful send; a closed sink (client gone) stops forwarding entirely.
/// The full text is accumulated separately, so nothing is lost from the
/// terminal outcome.
struct FragmentStream {
    sink: Option<tokio::sync::mpsc::Sender<String>>,
    backlog: String,
}

impl FragmentStream {
    fn new(sink: Option<tokio::sync::mpsc::Sender<String>>) -> Self {
        Self {
            sink,
            backlog: String::new(),
        }
    }

    fn push(&mut self, fragment: String) {
        if self.sink.is_none() {
            return;
        }
        if self.backlog.is_empty() {
            self.backlog = fragment;
        } else {
            self.backlog.push_str(&fragment);
        }
        self.flush();
    }

    fn flush(&mut self) {
        let Some(sink) = &self.sink else { return };
        if self.backlog.is_empty() {
            return;
        }
        match sink.try_send(std::mem::take(&mut self.backlog)) {
            Ok(()) => {}
            Err(TrySendError::Full(pending)) => self.backlog = pending,
            Err(TrySendError::Closed(_)) => {
                self.sink = None;
                self.backlog.clear();
            }
        }
    }
}

/// Re-assembles token byte sequences into valid UTF-8 fragments.
///
/// Tokens can split multi-byte characters, so bytes are buffered until a
/// complete character is available; truly invalid bytes are dropped.
struct Utf8Assembler {
    buf: Vec<u8>,
}

impl Utf8Assembler {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends token bytes and returns the longest valid UTF-8 prefix, if
    /// any complete characters are available.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buf.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.buf) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.buf.clear();
                    break;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    if valid_len > 0 {
                        // Guaranteed valid up to valid_len.
                        out.push_str(std::str::from_utf8(&self.buf[..valid_len]).unwrap_or(""));
                    }
                    match e.error_len() {
                        // Invalid byte sequence: skip it and keep scanning.
                        Some(bad) => {
                            self.buf.drain(..valid_len + bad);
                        }
                        // Incomplete trailing character: keep it buffered.
                        None => {
                            self.buf.drain(..valid_len);
                            break;
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Returns whatever valid text remains buffered at end of generation.
    fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_ascii_passthrough() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"hello"), Some("hello".to_string()));
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn test_assembler_split_multibyte() {
        // "é" is 0xC3 0xA9; deliver it one byte per token.
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[0xC3]), None);
        assert_eq!(assembler.push(&[0xA9]), Some("é".to_string()));
    }

    #[test]
    fn test_assembler_emits_prefix_keeps_suffix() {
        // "ab" followed by the first byte of a multi-byte char.
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[b'a', b'b', 0xE2]), Some("ab".to_string()));
        assert_eq!(assembler.push(&[0x82, 0xAC]), Some("€".to_string()));
    }

    #[test]
    fn test_assembler_drops_invalid_byte() {
        let mut assembler = Utf8Assembler::new();
        // 0xFF can never start a valid sequence.
        assert_eq!(assembler.push(&[b'x', 0xFF, b'y']), Some("xy".to_string()));
    }

    #[test]
    fn test_assembler_flush_incomplete() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[0xC3]), None);
        // Lossy flush turns the dangling byte into a replacement character.
        assert_eq!(assembler.flush(), Some("\u{FFFD}".to_string()));
    }

    #[test]
    fn test_fragment_stream_coalesces_instead_of_blocking() {
        // Capacity-one sink with a stalled receiver: pushes must return
        // immediately and later fragments coalesce into one message.
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let mut stream = FragmentStream::new(Some(tx));

        stream.push("a".to_string());
        stream.push("b".to_string());
        stream.push("c".to_string());
        assert_eq!(rx.try_recv().unwrap(), "a");

        stream.push("d".to_string());
        assert_eq!(rx.try_recv().unwrap(), "bcd");
    }

    #[test]
    fn test_fragment_stream_stops_on_closed_sink() {
        let (tx, rx) = tokio::sync::mpsc::channel::<String>(1);
        drop(rx);
        let mut stream = FragmentStream::new(Some(tx));
        stream.push("a".to_string());
        stream.flush();
        assert!(stream.sink.is_none());
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = LlamaEngineConfig::default();
        assert_eq!(config.gpu_layers, 99);
        assert_eq!(config.context_size, 4096);
    }
}
