//! RMSE scoring of prediction tables.

use crate::data::Table;
use crate::error::MlError;
use crate::tracking::Reporters;

/// Column holding model predictions on validation and OOF tables.
pub const PREDS_COLUMN: &str = "preds";

/// Root mean squared error.
pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MlError> {
    if y_true.is_empty() {
        return Err(MlError::invalid_input("rmse of empty input"));
    }
    if y_true.len() != y_pred.len() {
        return Err(MlError::invalid_input(format!(
            "rmse length mismatch: {} targets vs {} predictions",
            y_true.len(),
            y_pred.len()
        )));
    }
    let mse = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>()
        / y_true.len() as f64;
    Ok(mse.sqrt())
}

/// Score `table`'s `preds` column against `target_column`, log it and report
/// metric `score` at `step`.
pub async fn get_result(
    table: &Table,
    target_column: &str,
    step: usize,
    reporters: &mut Reporters,
) -> Result<f64, MlError> {
    let preds = table.f64_column(PREDS_COLUMN)?;
    let labels = table.f64_column(target_column)?;
    let score = rmse(&labels, &preds)?;
    tracing::info!("Score: {:.5}", score);
    reporters.log_metric("score", score, step).await?;
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::LocalReporter;
    use crate::tracking::local::MetricRecord;

    #[test]
    fn test_rmse_known_values() {
        assert_eq!(rmse(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap(), 0.0);
        assert_eq!(rmse(&[0.0, 0.0], &[3.0, 4.0]).unwrap(), 12.5_f64.sqrt());
    }

    #[test]
    fn test_rmse_rejects_bad_input() {
        assert!(matches!(rmse(&[], &[]), Err(MlError::InvalidInput(_))));
        assert!(matches!(rmse(&[1.0], &[1.0, 2.0]), Err(MlError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_get_result_reports_score() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::from_rows(
            vec!["Id".into(), "Pawpularity".into(), PREDS_COLUMN.into()],
            vec![
                vec!["a".into(), "30".into(), "33".into()],
                vec!["b".into(), "50".into(), "46".into()],
            ],
        )
        .unwrap();
        let mut reporters = Reporters::new();
        reporters.register(Box::new(LocalReporter::new(dir.path())));

        let score = get_result(&table, "Pawpularity", 3, &mut reporters).await.unwrap();
        assert!((score - 12.5_f64.sqrt()).abs() < 1e-12);

        let records = LocalReporter::new(dir.path()).read_records().unwrap();
        assert!(matches!(
            &records[0],
            MetricRecord::Metric { key, step: 3, value, .. } if key == "score" && *value == score
        ));
    }

    #[tokio::test]
    async fn test_get_result_needs_preds() {
        let table = Table::from_rows(vec!["Pawpularity".into()], vec![vec!["1".into()]]).unwrap();
        assert!(get_result(&table, "Pawpularity", 0, &mut Reporters::new()).await.is_err());
    }
}
