//! Loss functions with their gradients w.r.t. the raw model output.

use pawpular_core::Criterion;

const RMSE_EPS: f64 = 1e-12;

/// Mean loss over a batch and `d loss / d output` for every element.
///
/// `targets` are normalized (already divided by the target scale).
pub fn loss_and_grad(criterion: Criterion, outputs: &[f64], targets: &[f64]) -> (f64, Vec<f64>) {
    let n = outputs.len().max(1) as f64;
    match criterion {
        Criterion::Mse => {
            let loss = outputs
                .iter()
                .zip(targets)
                .map(|(o, t)| (o - t).powi(2))
                .sum::<f64>()
                / n;
            let grad = outputs
                .iter()
                .zip(targets)
                .map(|(o, t)| 2.0 * (o - t) / n)
                .collect();
            (loss, grad)
        }
        Criterion::Rmse => {
            let mse = outputs
                .iter()
                .zip(targets)
                .map(|(o, t)| (o - t).powi(2))
                .sum::<f64>()
                / n;
            let rmse = (mse + RMSE_EPS).sqrt();
            let grad = outputs
                .iter()
                .zip(targets)
                .map(|(o, t)| (o - t) / (n * rmse))
                .collect();
            (rmse, grad)
        }
        Criterion::BceWithLogits => {
            // max(z, 0) - z*y + ln(1 + e^-|z|), stable for large |z|
            let loss = outputs
                .iter()
                .zip(targets)
                .map(|(z, y)| z.max(0.0) - z * y + (-z.abs()).exp().ln_1p())
                .sum::<f64>()
                / n;
            let grad = outputs
                .iter()
                .zip(targets)
                .map(|(z, y)| (super::sigmoid(*z) - y) / n)
                .collect();
            (loss, grad)
        }
    }
}

/// Mean loss only.
pub fn loss(criterion: Criterion, outputs: &[f64], targets: &[f64]) -> f64 {
    loss_and_grad(criterion, outputs, targets).0
}
