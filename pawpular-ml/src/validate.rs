//! Blend of previously produced out-of-fold predictions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use pawpular_core::RunConfig;
use pawpular_core::flatten_params;

use crate::data::Table;
use crate::error::MlError;
use crate::training::runner::OOF_FILE;
use crate::training::scorer::{PREDS_COLUMN, get_result};
use crate::tracking::Reporters;

pub const VALIDATION_FILE: &str = "validation_df.csv";

/// `{base_results}/{name}/oof_df.csv`.
pub fn base_oof_path(config: &RunConfig, name: &str) -> PathBuf {
    config.settings.dirs.base_results.join(name).join(OOF_FILE)
}

/// Read every configured base OOF table.
pub fn load_base_oofs(config: &RunConfig) -> Result<Vec<Table>, MlError> {
    if config.validate.base_results.is_empty() {
        return Err(MlError::invalid_input("validate.base_results is empty"));
    }
    config
        .validate
        .base_results
        .iter()
        .map(|name| {
            let path = base_oof_path(config, name);
            if !path.exists() {
                return Err(MlError::not_found(format!("{}", path.display())));
            }
            Table::read_csv(&path)
        })
        .collect()
}

/// Join each base table's `preds` onto `train` as `preds{n}` and average them into `preds`.
pub fn blend(train: &Table, bases: &[Table], id_column: &str) -> Result<Table, MlError> {
    let ids = train.unique_ids(id_column)?;
    let mut out = train.clone();
    let mut columns = Vec::with_capacity(bases.len());

    for (n, base) in bases.iter().enumerate() {
        let by_id: HashMap<&str, f64> = base
            .column(id_column)?
            .into_iter()
            .zip(base.f64_column(PREDS_COLUMN)?)
            .collect();
        let preds = ids
            .iter()
            .map(|id| {
                by_id.get(id.as_str()).copied().ok_or_else(|| {
                    MlError::invalid_input(format!(
                        "base result {n} has no row for {id_column} '{id}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.set_f64_column(&format!("{PREDS_COLUMN}{n}"), &preds)?;
        columns.push(preds);
    }

    let k = columns.len().max(1) as f64;
    let mean: Vec<f64> = (0..ids.len())
        .map(|i| columns.iter().map(|c| c[i]).sum::<f64>() / k)
        .collect();
    out.set_f64_column(PREDS_COLUMN, &mean)?;
    Ok(out)
}

/// Blend the configured base results, score the blend and write `validation_df.csv`.
pub async fn run_validation(
    config: &RunConfig,
    train: &Table,
    output_dir: &Path,
    reporters: &mut Reporters,
) -> Result<f64, MlError> {
    reporters
        .log_params(&flatten_params("validate", &config.validate)?)
        .await?;
    let bases = load_base_oofs(config)?;
    let blended = blend(train, &bases, &config.params.id_column)?;
    let score = get_result(
        &blended,
        &config.params.target_column,
        config.params.n_fold,
        reporters,
    )
    .await?;
    let path = output_dir.join(VALIDATION_FILE);
    blended.write_csv(&path)?;
    reporters.save_file(&path).await?;
    tracing::info!(bases = bases.len(), score, "Validation blend done");
    Ok(score)
}
