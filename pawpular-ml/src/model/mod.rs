//! Model seam: the traits the fold loop trains through, plus the built-in
//! linear regressor.

pub mod linear;
pub mod loss;
pub mod meter;
pub mod optim;

pub use linear::{LinearFactory, LinearModel};
pub use meter::AverageMeter;

use pawpular_core::{Criterion, RunConfig};
use rand::rngs::StdRng;
use std::path::Path;

use crate::data::Sample;
use crate::error::MlError;

/// Output of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochResult {
    pub average_loss: f64,
    /// Raw model outputs in row order, before post-processing.
    pub predictions: Vec<f64>,
}

/// One pass over a data partition.
pub trait EpochRunner {
    /// Train for one epoch, updating parameters in place. Returns the average loss.
    fn train_epoch(
        &mut self,
        samples: &[Sample],
        epoch: usize,
        rng: &mut StdRng,
    ) -> Result<f64, MlError>;

    fn validate_epoch(&self, samples: &[Sample]) -> Result<EpochResult, MlError>;
}

/// Something whose parameters can be written to disk.
pub trait Checkpointable {
    /// Persist parameters to `path`, returning the number of bytes written.
    fn save_checkpoint(&self, path: &Path) -> Result<u64, MlError>;
}

pub trait Model: EpochRunner + Checkpointable {
    /// Raw outputs for unlabeled feature rows.
    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f64>, MlError>;
}

/// Shape information a factory needs to build a fresh model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub n_features: usize,
    pub n_train: usize,
}

/// Builds models from configuration and restores them from checkpoints.
pub trait ModelFactory {
    /// Fresh model; all random initialization draws from `rng`.
    fn build(
        &self,
        config: &RunConfig,
        spec: ModelSpec,
        rng: &mut StdRng,
    ) -> Result<Box<dyn Model>, MlError>;

    fn load(&self, config: &RunConfig, path: &Path) -> Result<Box<dyn Model>, MlError>;
}

/// Factory for `params.model_name`. Names are `family/variant`; only the
/// `linear` family is built in.
pub fn factory_for(model_name: &str) -> Result<Box<dyn ModelFactory>, MlError> {
    match model_name.split('/').next().unwrap_or_default() {
        "linear" => Ok(Box::new(LinearFactory)),
        other => Err(MlError::model(format!(
            "unknown model family '{other}' in '{model_name}'"
        ))),
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Map raw outputs onto the target range.
///
/// Logit-based criteria go through a sigmoid first; everything is then
/// multiplied by `target_scale`, undoing the target normalization.
pub fn postprocess(raw: &[f64], criterion: Criterion, target_scale: f64) -> Vec<f64> {
    raw.iter()
        .map(|&p| {
            let p = match criterion {
                Criterion::BceWithLogits => sigmoid(p),
                Criterion::Mse | Criterion::Rmse => p,
            };
            p * target_scale
        })
        .collect()
}
