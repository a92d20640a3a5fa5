//! Tabular inputs: CSV tables, fold assignment and splits.

pub mod folds;
pub mod table;

pub use folds::{FOLD_COLUMN, assign_folds, make_folds, split};
pub use table::{Sample, Table};

use pawpular_core::RunConfig;

use crate::error::MlError;

pub const TRAIN_FILE: &str = "train.csv";
pub const TEST_FILE: &str = "test.csv";
pub const SUBMISSION_FILE: &str = "sample_submission.csv";

/// The competition files found under `settings.dirs.input`.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub train: Table,
    /// Test records and the submission template, when both are present.
    pub test: Option<(Table, Table)>,
}

/// Load `train.csv`, plus `test.csv` and `sample_submission.csv` when present.
pub fn load_inputs(config: &RunConfig) -> Result<Inputs, MlError> {
    let dir = &config.settings.dirs.input;
    let train_path = dir.join(TRAIN_FILE);
    if !train_path.exists() {
        return Err(MlError::not_found(format!("{}", train_path.display())));
    }
    let train = Table::read_csv(&train_path)?;
    if train.is_empty() {
        return Err(MlError::dataset(format!("{} has no rows", train_path.display())));
    }

    let test_path = dir.join(TEST_FILE);
    let sub_path = dir.join(SUBMISSION_FILE);
    let test = if test_path.exists() && sub_path.exists() {
        Some((Table::read_csv(&test_path)?, Table::read_csv(&sub_path)?))
    } else {
        tracing::info!(dir = %dir.display(), "No test/submission files, inference will be skipped");
        None
    };

    tracing::info!(
        train_rows = train.len(),
        test_rows = test.as_ref().map(|(t, _)| t.len()).unwrap_or(0),
        "Loaded inputs"
    );
    Ok(Inputs { train, test })
}
