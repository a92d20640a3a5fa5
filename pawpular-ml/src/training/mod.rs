//! K-fold training: early stopping, checkpoints, per-fold loop, scoring and
//! the run aggregator.

pub mod checkpoint;
pub mod early_stopping;
pub mod fold;
pub mod reproducibility;
pub mod runner;
pub mod scorer;

pub use checkpoint::{CheckpointEntry, CheckpointStore};
pub use early_stopping::{Decision, EarlyStopping, EarlyStoppingState, StopPolicy};
pub use fold::{FoldContext, FoldResult, train_fold};
pub use runner::{RunSummary, TrainingRun};
pub use scorer::{PREDS_COLUMN, get_result, rmse};
