//! Startup configuration
//!
//! All knobs are supplied at startup: a JSON config file, environment
//! variables, and CLI flags (flags win). Nothing is runtime-mutable; a
//! restart deliberately loses all queued and in-flight jobs.

use crate::sampler::SamplerConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    /// Address the gRPC server listens on
    pub listen_addr: String,
    /// Worker pool size: bounds real generation concurrency
    pub workers: usize,
    /// Pending queue capacity: submissions beyond this are rejected
    pub queue_capacity: usize,
    /// Default maximum number of tokens to generate, and the cap for
    /// per-request overrides
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Seconds to wait for in-flight jobs during shutdown
    pub grace_period_secs: u64,
    /// Default system prompt applied when the request does not carry one
    pub system_prompt: Option<String>,
    /// Default sampling temperature
    pub temperature: f32,
    /// Default top-p (nucleus sampling) parameter
    pub top_p: f32,
    /// Default top-k sampling parameter
    pub top_k: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            listen_addr: "127.0.0.1:50051".to_string(),
            workers: 1,
            queue_capacity: 32,
            max_tokens: 512,
            context_size: 4096,
            gpu_layers: 99,
            grace_period_secs: 30,
            system_prompt: None,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
        }
    }
}

impl ServiceConfig {
    /// Loads and validates a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Merges file, environment, and flag sources, then validates.
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::read(path)?,
            None => Self::default(),
        };

        if let Some(model) = args.model {
            config.model_path = model;
        }
        if let Some(listen) = args.listen {
            config.listen_addr = listen;
        }
        if let Some(workers) = args.workers {
            config.workers = workers;
        }
        if let Some(capacity) = args.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(grace) = args.grace_period_secs {
            config.grace_period_secs = grace;
        }
        if let Some(gpu_layers) = args.gpu_layers {
            config.gpu_layers = gpu_layers;
        }

        config.validate()?;
        Ok(config)
    }

    /// Ensures required values are present and clamps the rest into
    /// acceptable ranges.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "model_path is required (--model <path>)".to_string(),
            ));
        }
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Invalid("listen_addr must not be empty".to_string()));
        }

        if self.workers == 0 {
            self.workers = 1;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = 1;
        }
        if self.max_tokens == 0 {
            self.max_tokens = 512;
        }
        if self.context_size == 0 {
            self.context_size = 4096;
        }

        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.top_k == 0 {
            self.top_k = 40;
        }

        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Default sampler built from the configured parameters; the seed stays
    /// unpinned so each job derives a fresh one.
    pub fn default_sampler(&self) -> SamplerConfig {
        SamplerConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            seed: None,
        }
    }
}

/// Command-line interface
#[derive(Debug, Parser)]
#[command(name = "chatd", about = "Chat completion daemon backed by llama.cpp")]
pub struct CliArgs {
    /// Path to a JSON config file; flags override file values
    #[arg(long, env = "CHATD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the GGUF model file
    #[arg(long, env = "CHATD_MODEL")]
    pub model: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:50051
    #[arg(long, env = "CHATD_LISTEN")]
    pub listen: Option<String>,

    /// Worker pool size
    #[arg(long, env = "CHATD_WORKERS")]
    pub workers: Option<usize>,

    /// Pending queue capacity
    #[arg(long, env = "CHATD_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Shutdown grace period in seconds
    #[arg(long, env = "CHATD_GRACE_PERIOD_SECS")]
    pub grace_period_secs: Option<u64>,

    /// Number of GPU layers to offload
    #[arg(long, env = "CHATD_GPU_LAYERS")]
    pub gpu_layers: Option<u32>,
}
