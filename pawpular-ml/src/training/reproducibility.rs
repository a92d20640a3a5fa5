//! Seeding and environment capture.

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Seed for fold `fold`: `seed + fold`.
pub fn fold_seed(seed: u64, fold: usize) -> u64 {
    seed.wrapping_add(fold as u64)
}

/// Fresh RNG for one fold; model init and batch shuffling draw from it.
pub fn fold_rng(seed: u64, fold: usize) -> StdRng {
    StdRng::seed_from_u64(fold_seed(seed, fold))
}

/// Where and how a run was produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSnapshot {
    pub version: String,
    pub platform: String,
    pub arch: String,
    pub git_hash: Option<String>,
    /// `settings.gpus` as configured.
    pub gpus: String,
    pub timestamp: DateTime<Utc>,
    /// sha256 over the environment variables that influence a run.
    pub env_vars_hash: String,
}

impl EnvironmentSnapshot {
    pub fn capture(git_hash: Option<String>, gpus: &str) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            git_hash,
            gpus: gpus.to_string(),
            timestamp: Utc::now(),
            env_vars_hash: Self::compute_env_vars_hash(),
        }
    }

    fn compute_env_vars_hash() -> String {
        let mut hasher = Sha256::new();
        for var in ["CUDA_VISIBLE_DEVICES", "RUST_LOG", "PAWPULAR_PARAMS__SEED"] {
            let value = std::env::var(var).unwrap_or_default();
            hasher.update(var.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}
