//! Test-set prediction from per-fold checkpoints.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use pawpular_core::RunConfig;

use crate::data::Table;
use crate::error::MlError;
use crate::model::{ModelFactory, postprocess};

pub const SUBMISSION_OUTPUT: &str = "submission.csv";

/// Average of every fold model's post-processed predictions on `test`.
pub fn predict_test(
    test: &Table,
    checkpoints: &[PathBuf],
    factory: &dyn ModelFactory,
    config: &RunConfig,
) -> Result<Vec<f64>, MlError> {
    if checkpoints.is_empty() {
        return Err(MlError::invalid_input("no checkpoints to predict with"));
    }
    let params = &config.params;
    let features = test.features(&params.feature_columns)?;
    let mut sums = vec![0.0; features.len()];

    for path in checkpoints {
        let model = factory.load(config, path)?;
        let raw = model.predict(&features)?;
        let preds = postprocess(&raw, params.criterion, params.target_scale);
        for (s, p) in sums.iter_mut().zip(preds) {
            *s += p;
        }
        tracing::debug!(checkpoint = %path.display(), "Predicted test set");
    }

    let n = checkpoints.len() as f64;
    Ok(sums.into_iter().map(|s| s / n).collect())
}

/// Fill the template's target column by identifier and write it to `path`.
pub fn write_submission(
    template: &Table,
    ids: &[String],
    preds: &[f64],
    config: &RunConfig,
    path: &Path,
) -> Result<Table, MlError> {
    if ids.len() != preds.len() {
        return Err(MlError::invalid_input(format!(
            "{} ids for {} predictions",
            ids.len(),
            preds.len()
        )));
    }
    let params = &config.params;
    let by_id: HashMap<&str, f64> = ids
        .iter()
        .map(String::as_str)
        .zip(preds.iter().copied())
        .collect();

    let values = template
        .column(&params.id_column)?
        .into_iter()
        .map(|id| {
            by_id.get(id).map(|p| p.to_string()).ok_or_else(|| {
                MlError::invalid_input(format!(
                    "no prediction for {} '{id}'",
                    params.id_column
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut submission = template.clone();
    submission.set_column(&params.target_column, values)?;
    submission.write_csv(path)?;
    tracing::info!(path = %path.display(), rows = submission.len(), "Wrote submission");
    Ok(submission)
}
