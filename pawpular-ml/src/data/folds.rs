//! Fold assignment and per-fold train/validation splits.

use pawpular_core::{FoldStrategy, ParamsConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::data::table::Table;
use crate::error::MlError;

/// Column holding each row's fold index.
pub const FOLD_COLUMN: &str = "fold";

/// Sturges' rule: `floor(1 + log2(n))`.
pub fn sturges_bins(n_rows: usize) -> usize {
    if n_rows <= 1 {
        return 1;
    }
    (1.0 + (n_rows as f64).log2()).floor() as usize
}

/// Equal-width bin index of every target.
pub fn bin_targets(targets: &[f64], n_bins: usize) -> Vec<usize> {
    let n_bins = n_bins.max(1);
    let (min, max) = targets
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
            (lo.min(t), hi.max(t))
        });
    let width = (max - min) / n_bins as f64;
    targets
        .iter()
        .map(|&t| {
            if width <= 0.0 || !width.is_finite() {
                0
            } else {
                (((t - min) / width) as usize).min(n_bins - 1)
            }
        })
        .collect()
}

/// Assign a fold in `[0, n_fold)` to each of `n_rows` rows.
///
/// `Kfold` shuffles all rows and deals them round-robin. `Stratified` groups
/// rows by target bin, shuffles inside each bin and deals round-robin across
/// bins so each fold sees a similar target distribution. The same inputs and
/// seed always give the same assignment.
pub fn assign_folds(
    n_rows: usize,
    n_fold: usize,
    seed: u64,
    strategy: FoldStrategy,
    targets: Option<&[f64]>,
    n_bins: Option<usize>,
) -> Result<Vec<usize>, MlError> {
    if n_fold < 2 {
        return Err(MlError::invalid_input(format!(
            "n_fold must be at least 2, got {n_fold}"
        )));
    }
    if n_fold > n_rows {
        return Err(MlError::invalid_input(format!(
            "n_fold ({n_fold}) exceeds number of rows ({n_rows})"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let order: Vec<usize> = match strategy {
        FoldStrategy::Kfold => {
            let mut idx: Vec<usize> = (0..n_rows).collect();
            idx.shuffle(&mut rng);
            idx
        }
        FoldStrategy::Stratified => {
            let targets = targets.ok_or_else(|| {
                MlError::invalid_input("stratified folds need target values")
            })?;
            if targets.len() != n_rows {
                return Err(MlError::invalid_input(format!(
                    "{} targets for {n_rows} rows",
                    targets.len()
                )));
            }
            let n_bins = n_bins.unwrap_or_else(|| sturges_bins(n_rows));
            let bins = bin_targets(targets, n_bins);
            let mut groups: Vec<Vec<usize>> = vec![Vec::new(); n_bins.max(1)];
            for (row, &b) in bins.iter().enumerate() {
                groups[b].push(row);
            }
            let mut order = Vec::with_capacity(n_rows);
            for mut group in groups {
                group.shuffle(&mut rng);
                order.extend(group);
            }
            order
        }
    };

    let mut folds = vec![0; n_rows];
    for (pos, row) in order.into_iter().enumerate() {
        folds[row] = pos % n_fold;
    }
    Ok(folds)
}

/// Write the fold column onto `table` according to `params`.
pub fn make_folds(table: &mut Table, params: &ParamsConfig) -> Result<(), MlError> {
    let targets = match params.fold_strategy {
        FoldStrategy::Stratified => Some(table.f64_column(&params.target_column)?),
        FoldStrategy::Kfold => None,
    };
    let folds = assign_folds(
        table.len(),
        params.n_fold,
        params.seed,
        params.fold_strategy,
        targets.as_deref(),
        params.n_bins,
    )?;
    table.set_column(FOLD_COLUMN, folds.iter().map(|f| f.to_string()).collect())?;

    let mut counts = vec![0usize; params.n_fold];
    for f in &folds {
        counts[*f] += 1;
    }
    tracing::info!(strategy = ?params.fold_strategy, ?counts, "Assigned folds");
    Ok(())
}

/// Split into (train, valid) where valid holds the rows of `fold`.
pub fn split(table: &Table, fold: usize) -> Result<(Table, Table), MlError> {
    let folds = table.usize_column(FOLD_COLUMN)?;
    let (valid, train): (Vec<usize>, Vec<usize>) =
        (0..table.len()).partition(|&i| folds[i] == fold);
    if valid.is_empty() {
        return Err(MlError::dataset(format!("fold {fold} has no validation rows")));
    }
    if train.is_empty() {
        return Err(MlError::dataset(format!("fold {fold} has no training rows")));
    }
    Ok((table.select(&train), table.select(&valid)))
}
