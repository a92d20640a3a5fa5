//! JSON-lines metrics log in the run directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use pawpular_core::persistence::append_json_line;
use serde::{Deserialize, Serialize};

use super::MetricReporter;
use crate::error::MlError;

pub const METRICS_FILE: &str = "metrics.jsonl";

/// One line of `metrics.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricRecord {
    Param {
        key: String,
        value: String,
    },
    Metric {
        key: String,
        value: f64,
        step: usize,
        timestamp: i64,
    },
    Finish {
        loss: Option<f64>,
        timestamp: i64,
    },
}

pub struct LocalReporter {
    path: PathBuf,
}

impl LocalReporter {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(METRICS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every record written so far.
    pub fn read_records(&self) -> Result<Vec<MetricRecord>, MlError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        std::fs::read_to_string(&self.path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(MlError::from))
            .collect()
    }
}

#[async_trait]
impl MetricReporter for LocalReporter {
    fn name(&self) -> &str {
        "local"
    }

    async fn log_params(&mut self, params: &[(String, String)]) -> Result<(), MlError> {
        for (key, value) in params {
            append_json_line(
                &self.path,
                &MetricRecord::Param {
                    key: key.clone(),
                    value: value.clone(),
                },
            )?;
        }
        Ok(())
    }

    async fn log_metric(&mut self, key: &str, value: f64, step: usize) -> Result<(), MlError> {
        append_json_line(
            &self.path,
            &MetricRecord::Metric {
                key: key.to_string(),
                value,
                step,
                timestamp: Utc::now().timestamp_millis(),
            },
        )?;
        Ok(())
    }

    async fn finish(&mut self, loss: Option<f64>, _artifacts_dir: &Path) -> Result<(), MlError> {
        append_json_line(
            &self.path,
            &MetricRecord::Finish {
                loss,
                timestamp: Utc::now().timestamp_millis(),
            },
        )?;
        Ok(())
    }
}
