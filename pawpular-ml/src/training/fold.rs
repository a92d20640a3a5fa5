//! Training loop for a single fold.

use std::path::PathBuf;
use std::time::Instant;

use pawpular_core::RunConfig;
use rand::rngs::StdRng;

use super::checkpoint::CheckpointStore;
use super::early_stopping::{Decision, EarlyStopping, StopPolicy};
use super::scorer::{PREDS_COLUMN, rmse};
use crate::data::{Table, split};
use crate::error::MlError;
use crate::model::{ModelFactory, ModelSpec, postprocess};

/// What one fold hands back to the run.
#[derive(Debug, Clone)]
pub struct FoldResult {
    pub fold: usize,
    /// Validation rows with the best epoch's predictions in `preds`.
    pub valid: Table,
    pub best_score: f64,
    pub best_loss: f64,
    pub best_epoch: usize,
    pub epochs_run: usize,
    pub checkpoint: PathBuf,
}

/// Shared inputs for every fold of a run.
pub struct FoldContext<'a> {
    pub config: &'a RunConfig,
    pub factory: &'a dyn ModelFactory,
    pub checkpoints: &'a CheckpointStore,
}

/// Train `fold` of `folds` until the epoch budget runs out or early stopping fires.
pub fn train_fold(
    ctx: &FoldContext<'_>,
    folds: &Table,
    fold: usize,
    rng: &mut StdRng,
) -> Result<FoldResult, MlError> {
    let params = &ctx.config.params;
    if params.epoch == 0 {
        return Err(MlError::invalid_input("params.epoch must be at least 1"));
    }
    tracing::info!("========== fold: {} training ==========", fold);

    let (train, mut valid) = split(folds, fold)?;
    let train_samples = train.samples(
        &params.feature_columns,
        &params.target_column,
        params.target_scale,
    )?;
    let valid_samples = valid.samples(
        &params.feature_columns,
        &params.target_column,
        params.target_scale,
    )?;
    let valid_labels = valid.f64_column(&params.target_column)?;

    let mut model = ctx.factory.build(
        ctx.config,
        ModelSpec {
            n_features: params.feature_columns.len(),
            n_train: train_samples.len(),
        },
        rng,
    )?;

    let checkpoint = ctx.checkpoints.path_for(&params.model_name, fold);
    let mut es = EarlyStopping::new(
        StopPolicy::new(params.es_patience, params.es_delta),
        checkpoint.clone(),
    );

    let mut epochs_run = 0;
    let mut best_epoch = 0;
    for epoch in 0..params.epoch {
        let start = Instant::now();
        let avg_loss = model.train_epoch(&train_samples, epoch, rng)?;
        let result = model.validate_epoch(&valid_samples)?;
        epochs_run += 1;

        if !result.average_loss.is_finite() {
            return Err(MlError::training(format!(
                "fold {fold} epoch {}: validation loss is {}",
                epoch + 1,
                result.average_loss
            )));
        }

        let preds = postprocess(&result.predictions, params.criterion, params.target_scale);
        let score = rmse(&valid_labels, &preds)?;

        tracing::info!(
            fold,
            epoch = epoch + 1,
            train_loss = avg_loss,
            val_loss = result.average_loss,
            score,
            "Epoch {} - avg_train_loss: {:.4}  avg_val_loss: {:.4}  time: {:.0}s",
            epoch + 1,
            avg_loss,
            result.average_loss,
            start.elapsed().as_secs_f64()
        );
        tracing::info!("Epoch {} - Score: {:.4}", epoch + 1, score);

        let decision = es.step(result.average_loss, score, &preds, model.as_ref())?;
        if decision == Decision::Improved {
            best_epoch = epoch;
            ctx.checkpoints
                .record(fold, epoch, result.average_loss, score, &checkpoint)?;
        }
        if es.stopped() {
            tracing::info!(fold, epoch = epoch + 1, "Early stopping");
            break;
        }
    }

    let state = es.into_state();
    let (Some(best_score), Some(best_predictions)) = (state.best_score, state.best_predictions)
    else {
        return Err(MlError::training(format!("fold {fold} produced no accepted epoch")));
    };
    valid.set_f64_column(PREDS_COLUMN, &best_predictions)?;

    Ok(FoldResult {
        fold,
        valid,
        best_score,
        best_loss: state.best_loss,
        best_epoch,
        epochs_run,
        checkpoint,
    })
}
