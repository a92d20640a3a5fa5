//! Whole-run orchestration: folds, out-of-fold scoring, artifacts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pawpular_core::notify::result_message;
use pawpular_core::{RunConfig, SlackNotifier, flatten_params};
use serde::{Deserialize, Serialize};

use super::checkpoint::CheckpointStore;
use super::fold::{FoldContext, FoldResult, train_fold};
use super::reproducibility::{EnvironmentSnapshot, fold_rng};
use super::scorer::get_result;
use crate::data::{Inputs, Table, make_folds};
use crate::error::MlError;
use crate::inference::{SUBMISSION_OUTPUT, predict_test, write_submission};
use crate::model::ModelFactory;
use crate::tracking::Reporters;

pub const OOF_FILE: &str = "oof_df.csv";
pub const SUMMARY_FILE: &str = "summary.json";

/// Per-fold line of the run summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoldSummary {
    pub fold: usize,
    pub score: f64,
    pub loss: f64,
    pub best_epoch: usize,
    pub epochs_run: usize,
    pub checkpoint: PathBuf,
}

impl From<&FoldResult> for FoldSummary {
    fn from(r: &FoldResult) -> Self {
        Self {
            fold: r.fold,
            score: r.best_score,
            loss: r.best_loss,
            best_epoch: r.best_epoch,
            epochs_run: r.epochs_run,
            checkpoint: r.checkpoint.clone(),
        }
    }
}

/// Persisted as `summary.json` at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub model_name: String,
    pub folds: Vec<FoldSummary>,
    pub score: f64,
    /// Mean of the per-fold best validation losses.
    pub loss: f64,
    pub oof_path: PathBuf,
    pub submission_path: Option<PathBuf>,
    pub environment: EnvironmentSnapshot,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A configured training run over all folds.
pub struct TrainingRun {
    config: RunConfig,
    run_dir: PathBuf,
    factory: Box<dyn ModelFactory>,
    reporters: Reporters,
    notifier: Option<SlackNotifier>,
    commit: Option<String>,
}

impl TrainingRun {
    pub fn new(config: RunConfig, run_dir: PathBuf, factory: Box<dyn ModelFactory>) -> Self {
        Self {
            config,
            run_dir,
            factory,
            reporters: Reporters::new(),
            notifier: None,
            commit: None,
        }
    }

    pub fn with_reporters(mut self, reporters: Reporters) -> Self {
        self.reporters = reporters;
        self
    }

    pub fn with_notifier(mut self, notifier: SlackNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_commit(mut self, commit: Option<String>) -> Self {
        self.commit = commit;
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Train every fold, score the out-of-fold table and write the artifacts.
    pub async fn run(mut self, inputs: Inputs) -> Result<RunSummary, MlError> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        std::fs::create_dir_all(&self.run_dir)?;
        let params = self.config.params.clone();
        tracing::info!(
            %run_id,
            run_dir = %self.run_dir.display(),
            model = %params.model_name,
            "Started."
        );

        let mut train = inputs.train;
        make_folds(&mut train, &params)?;
        self.reporters
            .log_params(&flatten_params("", &params)?)
            .await?;

        let store = CheckpointStore::new(&self.run_dir);
        let ctx = FoldContext {
            config: &self.config,
            factory: self.factory.as_ref(),
            checkpoints: &store,
        };

        let mut results = Vec::with_capacity(params.n_fold);
        for fold in 0..params.n_fold {
            let mut rng = fold_rng(params.seed, fold);
            let result = train_fold(&ctx, &train, fold, &mut rng)?;
            get_result(&result.valid, &params.target_column, fold, &mut self.reporters).await?;
            results.push(result);
        }

        let valids: Vec<Table> = results.iter().map(|r| r.valid.clone()).collect();
        let oof = Table::concat(&valids)?;
        if oof.len() != train.len() {
            return Err(MlError::training(format!(
                "out-of-fold table has {} rows, expected {}",
                oof.len(),
                train.len()
            )));
        }
        oof.unique_ids(&params.id_column)?;

        tracing::info!("========== CV ==========");
        let score =
            get_result(&oof, &params.target_column, params.n_fold, &mut self.reporters).await?;
        let oof_path = self.run_dir.join(OOF_FILE);
        oof.write_csv(&oof_path)?;

        let loss = results.iter().map(|r| r.best_loss).sum::<f64>() / results.len() as f64;

        let submission_path = match &inputs.test {
            Some((test, template)) => {
                let checkpoints: Vec<PathBuf> =
                    results.iter().map(|r| r.checkpoint.clone()).collect();
                let preds = predict_test(test, &checkpoints, self.factory.as_ref(), &self.config)?;
                let ids = test.unique_ids(&params.id_column)?;
                let path = self.run_dir.join(SUBMISSION_OUTPUT);
                write_submission(template, &ids, &preds, &self.config, &path)?;
                Some(path)
            }
            None => None,
        };

        let summary = RunSummary {
            run_id,
            model_name: params.model_name.clone(),
            folds: results.iter().map(FoldSummary::from).collect(),
            score,
            loss,
            oof_path,
            submission_path,
            environment: EnvironmentSnapshot::capture(
                self.commit.clone(),
                &self.config.settings.gpus,
            ),
            started_at,
            finished_at: Utc::now(),
        };
        pawpular_core::persistence::write_json_atomic(&self.run_dir.join(SUMMARY_FILE), &summary)?;

        self.reporters.finish(Some(loss), &self.run_dir).await?;

        if let Some(notifier) = &self.notifier {
            notifier
                .send(&result_message(score, loss, &params.model_name))
                .await;
        }

        tracing::info!(score, loss, "Done.");
        Ok(summary)
    }
}
