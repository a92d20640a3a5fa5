//! Experiment tracking.
//!
//! Every backend implements [`MetricReporter`]; training code talks to a
//! [`Reporters`] list and never branches on which backends are active.

pub mod local;
pub mod mlflow;
pub mod wandb;

pub use local::LocalReporter;
pub use mlflow::{MlflowClient, MlflowReporter};
pub use wandb::{WandbClient, WandbReporter};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pawpular_core::{HttpTransport, RunConfig};

use crate::error::MlError;

/// A tracking sink.
#[async_trait]
pub trait MetricReporter: Send + Sync {
    fn name(&self) -> &str;

    /// Record flattened `(key, value)` parameters.
    async fn log_params(&mut self, params: &[(String, String)]) -> Result<(), MlError>;

    async fn log_metric(&mut self, key: &str, value: f64, step: usize) -> Result<(), MlError>;

    /// Attach a single output file to the run. Backends that upload the
    /// whole artifact directory on [`finish`](Self::finish) ignore this.
    async fn save_file(&mut self, _path: &Path) -> Result<(), MlError> {
        Ok(())
    }

    /// Close the run, recording the final `loss` if there is one and
    /// uploading files from `artifacts_dir`.
    async fn finish(&mut self, loss: Option<f64>, artifacts_dir: &Path) -> Result<(), MlError>;
}

/// Ordered fan-out over the registered reporters.
#[derive(Default)]
pub struct Reporters {
    reporters: Vec<Box<dyn MetricReporter>>,
}

impl Reporters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reporter: Box<dyn MetricReporter>) {
        tracing::debug!(reporter = reporter.name(), "Registered reporter");
        self.reporters.push(reporter);
    }

    pub fn names(&self) -> Vec<&str> {
        self.reporters.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }

    pub async fn log_params(&mut self, params: &[(String, String)]) -> Result<(), MlError> {
        for r in &mut self.reporters {
            r.log_params(params).await?;
        }
        Ok(())
    }

    pub async fn log_metric(&mut self, key: &str, value: f64, step: usize) -> Result<(), MlError> {
        for r in &mut self.reporters {
            r.log_metric(key, value, step).await?;
        }
        Ok(())
    }

    pub async fn save_file(&mut self, path: &Path) -> Result<(), MlError> {
        for r in &mut self.reporters {
            r.save_file(path).await?;
        }
        Ok(())
    }

    pub async fn finish(&mut self, loss: Option<f64>, artifacts_dir: &Path) -> Result<(), MlError> {
        for r in &mut self.reporters {
            r.finish(loss, artifacts_dir).await?;
        }
        Ok(())
    }
}

/// Run identity handed to remote backends when a run starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_name: String,
    pub commit: Option<String>,
    /// Value for the W&B `job_type`.
    pub job_type: String,
    /// Flattened config stored with the W&B run.
    pub config: Vec<(String, String)>,
}

/// `(file name, contents)` for every regular file directly inside `dir`, by name.
pub(crate) fn artifact_files(dir: &Path) -> Result<Vec<(String, Vec<u8>)>, MlError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push((name, std::fs::read(entry.path())?));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Register the local reporter plus every enabled remote backend.
///
/// Remote runs are created here, so an unreachable tracking server fails
/// the command before any training happens.
pub async fn setup_reporters(
    config: &RunConfig,
    run_dir: &Path,
    transport: Arc<dyn HttpTransport>,
    ctx: &RunContext,
) -> Result<Reporters, MlError> {
    let mut reporters = Reporters::new();
    reporters.register(Box::new(LocalReporter::new(run_dir)));

    if config.mlflow.enabled {
        let client = MlflowClient::new(config.mlflow.tracking_uri.clone(), transport.clone());
        let reporter = MlflowReporter::start(client, &config.mlflow.experiment, ctx).await?;
        reporters.register(Box::new(reporter));
    }

    if config.wandb.enabled {
        let client = WandbClient::from_config(&config.wandb, transport.clone())?;
        let reporter = WandbReporter::start(client, &config.wandb, ctx).await?;
        reporters.register(Box::new(reporter));
    }

    tracing::info!(reporters = ?reporters.names(), "Tracking configured");
    Ok(reporters)
}
