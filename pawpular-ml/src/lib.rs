//! # pawpular-ml: k-fold training, scoring and tracking
//!
//! Data loading and fold assignment, the model seam with a built-in linear
//! regressor, the per-fold training loop with early stopping, RMSE scoring,
//! experiment tracking backends, test-set inference and OOF blending.

// Foundation
pub mod error;

// Data & models
pub mod data;
pub mod model;

// Training
pub mod training;

// Tracking
pub mod tracking;

// Outputs
pub mod inference;
pub mod validate;

pub use data::{Inputs, Sample, Table, load_inputs};
pub use error::MlError;
pub use model::{Model, ModelFactory, factory_for};
pub use tracking::{MetricReporter, Reporters, RunContext, setup_reporters};
pub use training::{RunSummary, TrainingRun, get_result, rmse};
