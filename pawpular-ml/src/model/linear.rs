//! Linear regressor over the metadata columns, trained by mini-batch
//! gradient descent.

use std::path::Path;
use std::time::Instant;

use pawpular_core::{Criterion, RunConfig};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::loss::loss_and_grad;
use super::meter::{AverageMeter, time_since};
use super::optim::{LrScheduler, Optimizer};
use super::{Checkpointable, EpochResult, EpochRunner, Model, ModelFactory, ModelSpec};
use crate::data::Sample;
use crate::error::MlError;

/// On-disk form of a trained [`LinearModel`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearCheckpoint {
    pub model_name: String,
    pub criterion: Criterion,
    pub n_features: usize,
    /// Feature weights followed by the bias.
    pub weights: Vec<f64>,
}

pub struct LinearModel {
    model_name: String,
    criterion: Criterion,
    weights: Vec<f64>,
    optimizer: Optimizer,
    scheduler: LrScheduler,
    batch_size: usize,
    print_freq: usize,
    global_step: usize,
}

/// Number of optimizer steps one epoch over `n` rows takes.
///
/// A trailing partial batch is dropped unless it is the only batch.
pub fn steps_per_epoch(n: usize, batch_size: usize) -> usize {
    if n == 0 {
        0
    } else if n < batch_size {
        1
    } else {
        n / batch_size
    }
}

impl LinearModel {
    fn new(config: &RunConfig, weights: Vec<f64>, n_train: usize) -> Self {
        let params = &config.params;
        Self {
            model_name: params.model_name.clone(),
            criterion: params.criterion,
            optimizer: Optimizer::from_params(params, weights.len()),
            scheduler: LrScheduler::new(params, steps_per_epoch(n_train, params.batch_size)),
            weights,
            batch_size: params.batch_size,
            print_freq: config.settings.print_freq.max(1),
            global_step: 0,
        }
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    fn n_features(&self) -> usize {
        self.weights.len() - 1
    }

    fn forward(&self, features: &[f32]) -> Result<f64, MlError> {
        if features.len() != self.n_features() {
            return Err(MlError::model(format!(
                "expected {} features, got {}",
                self.n_features(),
                features.len()
            )));
        }
        let bias = self.weights[self.n_features()];
        Ok(features
            .iter()
            .zip(&self.weights)
            .map(|(x, w)| f64::from(*x) * w)
            .sum::<f64>()
            + bias)
    }

    fn checkpoint(&self) -> LinearCheckpoint {
        LinearCheckpoint {
            model_name: self.model_name.clone(),
            criterion: self.criterion,
            n_features: self.n_features(),
            weights: self.weights.clone(),
        }
    }
}

impl EpochRunner for LinearModel {
    fn train_epoch(
        &mut self,
        samples: &[Sample],
        epoch: usize,
        rng: &mut StdRng,
    ) -> Result<f64, MlError> {
        let steps = steps_per_epoch(samples.len(), self.batch_size);
        if steps == 0 {
            return Err(MlError::training("no training samples"));
        }
        let mut order: Vec<usize> = (0..samples.len()).collect();
        order.shuffle(rng);

        let start = Instant::now();
        let mut losses = AverageMeter::new();
        for (step, batch) in order.chunks(self.batch_size).take(steps).enumerate() {
            let outputs = batch
                .iter()
                .map(|&i| self.forward(&samples[i].features))
                .collect::<Result<Vec<_>, _>>()?;
            let targets: Vec<f64> = batch.iter().map(|&i| samples[i].target).collect();
            let (loss, grad_out) = loss_and_grad(self.criterion, &outputs, &targets);

            let n_features = self.n_features();
            let mut grads = vec![0.0; self.weights.len()];
            for (&i, g) in batch.iter().zip(&grad_out) {
                for (j, x) in samples[i].features.iter().enumerate() {
                    grads[j] += g * f64::from(*x);
                }
                grads[n_features] += g;
            }

            let lr = self.scheduler.lr(self.global_step, epoch);
            self.optimizer.step(&mut self.weights, &grads, lr);
            self.global_step += 1;
            losses.update(loss, batch.len());

            if step % self.print_freq == 0 || step + 1 == steps {
                tracing::info!(
                    "Epoch: [{}][{}/{}] Elapsed {} Loss: {:.4}({:.4}) LR: {:.8}",
                    epoch + 1,
                    step,
                    steps,
                    time_since(start, (step + 1) as f64 / steps as f64),
                    losses.val,
                    losses.avg,
                    lr
                );
            }
        }
        Ok(losses.avg)
    }

    fn validate_epoch(&self, samples: &[Sample]) -> Result<EpochResult, MlError> {
        if samples.is_empty() {
            return Err(MlError::training("no validation samples"));
        }
        let mut losses = AverageMeter::new();
        let mut predictions = Vec::with_capacity(samples.len());
        for batch in samples.chunks(self.batch_size.max(1)) {
            let outputs = batch
                .iter()
                .map(|s| self.forward(&s.features))
                .collect::<Result<Vec<_>, _>>()?;
            let targets: Vec<f64> = batch.iter().map(|s| s.target).collect();
            let (loss, _) = loss_and_grad(self.criterion, &outputs, &targets);
            losses.update(loss, batch.len());
            predictions.extend(outputs);
        }
        Ok(EpochResult {
            average_loss: losses.avg,
            predictions,
        })
    }
}

impl Checkpointable for LinearModel {
    fn save_checkpoint(&self, path: &Path) -> Result<u64, MlError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.checkpoint())?;
        // Written in place; an interrupted write leaves a truncated file.
        std::fs::write(path, &bytes)?;
        Ok(bytes.len() as u64)
    }
}

impl Model for LinearModel {
    fn predict(&self, features: &[Vec<f32>]) -> Result<Vec<f64>, MlError> {
        features.iter().map(|f| self.forward(f)).collect()
    }
}

/// Builds and restores [`LinearModel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearFactory;

impl ModelFactory for LinearFactory {
    fn build(
        &self,
        config: &RunConfig,
        spec: ModelSpec,
        rng: &mut StdRng,
    ) -> Result<Box<dyn Model>, MlError> {
        if spec.n_features == 0 {
            return Err(MlError::model("linear model needs at least one feature"));
        }
        if config.params.batch_size == 0 {
            return Err(MlError::model("batch_size must be positive"));
        }
        let bound = 1.0 / (spec.n_features as f64).sqrt();
        let weights = (0..=spec.n_features)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        Ok(Box::new(LinearModel::new(config, weights, spec.n_train)))
    }

    fn load(&self, config: &RunConfig, path: &Path) -> Result<Box<dyn Model>, MlError> {
        let bytes = std::fs::read(path)
            .map_err(|e| MlError::not_found(format!("{}: {e}", path.display())))?;
        let ckpt: LinearCheckpoint = serde_json::from_slice(&bytes)?;
        if ckpt.weights.len() != ckpt.n_features + 1 {
            return Err(MlError::model(format!(
                "corrupt checkpoint {}: {} weights for {} features",
                path.display(),
                ckpt.weights.len(),
                ckpt.n_features
            )));
        }
        if ckpt.n_features != config.params.feature_columns.len() {
            return Err(MlError::model(format!(
                "checkpoint {} has {} features, config has {}",
                path.display(),
                ckpt.n_features,
                config.params.feature_columns.len()
            )));
        }
        let mut model = LinearModel::new(config, ckpt.weights, 0);
        model.criterion = ckpt.criterion;
        Ok(Box::new(model))
    }
}
