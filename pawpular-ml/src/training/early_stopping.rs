//! Early stopping on validation loss.
//!
//! [`EarlyStoppingState::update`] is the pure transition; [`EarlyStopping`]
//! wraps it and persists the model whenever an epoch is accepted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MlError;
use crate::model::Checkpointable;

/// Stopping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopPolicy {
    /// Non-improving epochs tolerated before stopping; `<= 0` disables stopping.
    pub patience: i64,
    /// Margin a loss must beat the best loss by to count as an improvement.
    pub delta: f64,
}

impl StopPolicy {
    pub fn new(patience: i64, delta: f64) -> Self {
        Self { patience, delta }
    }

    pub fn disabled(&self) -> bool {
        self.patience <= 0
    }
}

/// Outcome of one [`EarlyStoppingState::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// New best; the caller should persist the model.
    Improved,
    /// No improvement; counter incremented but still below patience.
    NoImprovement { counter: usize },
    /// Counter reached patience.
    Stopped { counter: usize },
    /// No improvement with stopping disabled; nothing changed.
    Ignored,
}

impl Decision {
    pub fn is_improved(&self) -> bool {
        matches!(self, Decision::Improved)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStoppingState {
    pub best_score: Option<f64>,
    pub best_loss: f64,
    pub best_predictions: Option<Vec<f64>>,
    pub counter: usize,
    pub stopped: bool,
}

impl Default for EarlyStoppingState {
    fn default() -> Self {
        Self {
            best_score: None,
            best_loss: f64::INFINITY,
            best_predictions: None,
            counter: 0,
            stopped: false,
        }
    }
}

impl EarlyStoppingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one epoch's validation result into the state.
    ///
    /// The first call is always accepted. After that an epoch is accepted
    /// only when `val_loss < best_loss + delta`; `score` is recorded but
    /// never consulted. Once stopped, the state no longer changes.
    pub fn update(
        mut self,
        policy: &StopPolicy,
        val_loss: f64,
        score: f64,
        predictions: &[f64],
    ) -> (Self, Decision) {
        if self.stopped {
            let counter = self.counter;
            return (self, Decision::Stopped { counter });
        }

        let first = self.best_score.is_none();
        if !first && val_loss >= self.best_loss + policy.delta {
            if policy.disabled() {
                return (self, Decision::Ignored);
            }
            self.counter += 1;
            let counter = self.counter;
            if counter as i64 >= policy.patience {
                self.stopped = true;
                return (self, Decision::Stopped { counter });
            }
            return (self, Decision::NoImprovement { counter });
        }

        self.best_score = Some(score);
        self.best_loss = val_loss;
        self.best_predictions = Some(predictions.to_vec());
        self.counter = 0;
        (self, Decision::Improved)
    }
}

/// Stateful tracker for one fold. Saves a checkpoint on every improvement.
#[derive(Debug)]
pub struct EarlyStopping {
    policy: StopPolicy,
    state: EarlyStoppingState,
    checkpoint_path: PathBuf,
    saved_bytes: u64,
}

impl EarlyStopping {
    pub fn new(policy: StopPolicy, checkpoint_path: PathBuf) -> Self {
        Self {
            policy,
            state: EarlyStoppingState::new(),
            checkpoint_path,
            saved_bytes: 0,
        }
    }

    /// Record an epoch; persists `model` when it is the new best.
    pub fn step<M: Checkpointable + ?Sized>(
        &mut self,
        val_loss: f64,
        score: f64,
        predictions: &[f64],
        model: &M,
    ) -> Result<Decision, MlError> {
        let (next, decision) =
            std::mem::take(&mut self.state).update(&self.policy, val_loss, score, predictions);
        self.state = next;

        match decision {
            Decision::Improved => {
                self.saved_bytes = model.save_checkpoint(&self.checkpoint_path)?;
                tracing::debug!(
                    path = %self.checkpoint_path.display(),
                    val_loss,
                    score,
                    "Saved best checkpoint"
                );
            }
            Decision::NoImprovement { counter } | Decision::Stopped { counter } => {
                tracing::info!(
                    "EarlyStopping counter: {} out of {}",
                    counter,
                    self.policy.patience
                );
            }
            Decision::Ignored => {}
        }
        Ok(decision)
    }

    pub fn state(&self) -> &EarlyStoppingState {
        &self.state
    }

    pub fn stopped(&self) -> bool {
        self.state.stopped
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Size of the last checkpoint written, 0 if none yet.
    pub fn saved_bytes(&self) -> u64 {
        self.saved_bytes
    }

    pub fn into_state(self) -> EarlyStoppingState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingModel {
        saves: Cell<usize>,
    }

    impl Checkpointable for CountingModel {
        fn save_checkpoint(&self, _path: &Path) -> Result<u64, MlError> {
            self.saves.set(self.saves.get() + 1);
            Ok(8)
        }
    }

    fn run(policy: StopPolicy, losses: &[f64]) -> (EarlyStoppingState, Vec<Decision>) {
        let mut state = EarlyStoppingState::new();
        let mut decisions = Vec::new();
        for (i, loss) in losses.iter().enumerate() {
            let (next, d) = state.update(&policy, *loss, i as f64, &[*loss]);
            state = next;
            decisions.push(d);
        }
        (state, decisions)
    }

    #[test]
    fn test_first_call_always_accepts() {
        let (state, decisions) = run(StopPolicy::new(1, 0.0), &[f64::MAX]);
        assert_eq!(decisions, vec![Decision::Improved]);
        assert_eq!(state.best_score, Some(0.0));
        assert_eq!(state.best_loss, f64::MAX);
        assert_eq!(state.counter, 0);
    }

    #[test]
    fn test_stops_when_counter_reaches_patience() {
        let (state, decisions) = run(StopPolicy::new(2, 0.0), &[1.0, 1.0, 1.5]);
        assert_eq!(
            decisions,
            vec![
                Decision::Improved,
                Decision::NoImprovement { counter: 1 },
                Decision::Stopped { counter: 2 },
            ]
        );
        assert!(state.stopped);
        assert_eq!(state.best_loss, 1.0);
        assert_eq!(state.best_predictions, Some(vec![1.0]));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let (state, decisions) = run(StopPolicy::new(3, 0.0), &[1.0, 2.0, 0.5, 0.6]);
        assert_eq!(decisions[2], Decision::Improved);
        assert_eq!(decisions[3], Decision::NoImprovement { counter: 1 });
        assert_eq!(state.counter, 1);
        assert_eq!(state.best_score, Some(2.0));
    }

    #[test]
    fn test_zero_patience_never_stops_or_counts() {
        let (state, decisions) = run(StopPolicy::new(0, 0.0), &[1.0, 2.0, 3.0, 4.0]);
        assert!(!state.stopped);
        assert_eq!(state.counter, 0);
        assert!(decisions[1..].iter().all(|d| *d == Decision::Ignored));
    }

    #[test]
    fn test_delta_is_added_to_best_loss() {
        // loss < best + delta is accepted, even if slightly worse
        let (state, _) = run(StopPolicy::new(2, 0.1), &[1.0, 1.05]);
        assert_eq!(state.best_loss, 1.05);
        let (state, decisions) = run(StopPolicy::new(2, 0.1), &[1.0, 1.1]);
        assert_eq!(state.best_loss, 1.0);
        assert_eq!(decisions[1], Decision::NoImprovement { counter: 1 });
    }

    #[test]
    fn test_stopped_state_is_terminal() {
        let (state, _) = run(StopPolicy::new(1, 0.0), &[1.0, 2.0]);
        assert!(state.stopped);
        let (state, d) = state.update(&StopPolicy::new(1, 0.0), 0.1, 9.0, &[]);
        assert_eq!(d, Decision::Stopped { counter: 1 });
        assert_eq!(state.best_loss, 1.0);
    }

    #[test]
    fn test_wrapper_saves_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let model = CountingModel {
            saves: Cell::new(0),
        };
        let mut es = EarlyStopping::new(StopPolicy::new(5, 0.0), dir.path().join("m.json"));
        for loss in [3.0, 2.0, 2.5, 1.0, 1.0] {
            es.step(loss, -loss, &[loss], &model).unwrap();
        }
        assert_eq!(model.saves.get(), 3);
        assert_eq!(es.saved_bytes(), 8);
        assert_eq!(es.state().best_loss, 1.0);
        assert!(!es.stopped());
    }
}
