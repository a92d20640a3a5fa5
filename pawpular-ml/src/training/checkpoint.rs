//! Best-checkpoint bookkeeping for a run directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::MlError;

pub const MANIFEST_FILE: &str = "checkpoints.json";

/// One persisted best model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntry {
    pub fold: usize,
    pub epoch: usize,
    pub loss: f64,
    pub score: f64,
    pub path: PathBuf,
    /// sha256 of the file contents.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Tracks the best checkpoint per fold in `{output}/checkpoints.json`.
pub struct CheckpointStore {
    output_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// `{output}/{model_name}_fold{fold}_best.json`, with `/` in the name replaced.
    pub fn path_for(&self, model_name: &str, fold: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}_fold{fold}_best.json", model_name.replace('/', "-")))
    }

    fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE)
    }

    pub fn list(&self) -> Result<Vec<CheckpointEntry>, MlError> {
        Ok(pawpular_core::persistence::read_json(&self.manifest_path())?.unwrap_or_default())
    }

    /// Record the file at `path` as the best for `fold`, replacing any earlier entry.
    pub fn record(
        &self,
        fold: usize,
        epoch: usize,
        loss: f64,
        score: f64,
        path: &Path,
    ) -> Result<CheckpointEntry, MlError> {
        let bytes = std::fs::read(path)
            .map_err(|e| MlError::not_found(format!("checkpoint {}: {e}", path.display())))?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        let entry = CheckpointEntry {
            fold,
            epoch,
            loss,
            score,
            path: path.to_path_buf(),
            hash,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut entries = self.list()?;
        entries.retain(|e| e.fold != fold);
        entries.push(entry.clone());
        entries.sort_by_key(|e| e.fold);
        pawpular_core::persistence::write_json_atomic(&self.manifest_path(), &entries)?;
        Ok(entry)
    }

    pub fn best_for_fold(&self, fold: usize) -> Result<Option<CheckpointEntry>, MlError> {
        Ok(self.list()?.into_iter().find(|e| e.fold == fold))
    }

    /// Re-hash the file behind `entry` and compare with the manifest.
    pub fn verify(&self, entry: &CheckpointEntry) -> Result<bool, MlError> {
        let bytes = std::fs::read(&entry.path)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)) == entry.hash)
    }
}
