//! Sampling parameters
//!
//! Per-job sampler settings passed through to the inference engine, plus
//! seed derivation for jobs that do not pin one.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sampling parameters for one generation.
///
/// These are opaque to the arbiter; only the engine interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Pinned sampler seed, the full 32-bit range llama.cpp samples with.
    /// When `None`, a fresh seed is derived per job so identical prompts do
    /// not silently produce identical output.
    pub seed: Option<u32>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            seed: None,
        }
    }
}

impl SamplerConfig {
    /// Clamp all parameters into acceptable ranges.
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = 40;
        }
    }

    /// Returns the seed to sample with: the pinned seed if the caller set
    /// one, otherwise a freshly derived seed.
    pub fn resolve_seed(&self) -> u32 {
        match self.seed {
            Some(seed) => seed,
            None => derive_seed(),
        }
    }
}

/// Derives a fresh seed from a monotonic counter mixed with wall-clock nanos.
///
/// The counter guarantees two jobs created in the same clock tick still get
/// distinct seeds.
fn derive_seed() -> u32 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() << 32) | u64::from(d.subsec_nanos()))
        .unwrap_or(0);

    let mixed = nanos
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(count.wrapping_mul(0x2545_F491_4F6C_DD1D));
    (mixed ^ (mixed >> 32)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_defaults() {
        let sampler = SamplerConfig::default();
        assert!((sampler.temperature - 0.7).abs() < 0.001);
        assert!((sampler.top_p - 0.95).abs() < 0.001);
        assert_eq!(sampler.top_k, 40);
        assert!(sampler.seed.is_none());
    }

    #[test]
    fn test_validate_clamps() {
        let mut sampler = SamplerConfig {
            temperature: 5.0,
            top_p: 1.5,
            top_k: 0,
            seed: None,
        };
        sampler.validate();
        assert_eq!(sampler.temperature, 2.0);
        assert_eq!(sampler.top_p, 1.0);
        assert_eq!(sampler.top_k, 40);

        sampler.temperature = -1.0;
        sampler.validate();
        assert_eq!(sampler.temperature, 0.0);
    }

    #[test]
    fn test_pinned_seed_is_stable() {
        let sampler = SamplerConfig {
            seed: Some(42),
            ..SamplerConfig::default()
        };
        assert_eq!(sampler.resolve_seed(), 42);
        assert_eq!(sampler.resolve_seed(), 42);
    }

    #[test]
    fn test_pinned_seed_full_range() {
        // Every distinct 32-bit pin resolves to itself, no truncation.
        let sampler = SamplerConfig {
            seed: Some(u32::MAX),
            ..SamplerConfig::default()
        };
        assert_eq!(sampler.resolve_seed(), u32::MAX);
    }

    #[test]
    fn test_unpinned_seeds_differ() {
        let sampler = SamplerConfig::default();
        let a = sampler.resolve_seed();
        let b = sampler.resolve_seed();
        assert_ne!(a, b);
    }
}
