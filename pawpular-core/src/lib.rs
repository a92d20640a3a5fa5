//! # pawpular-core
//!
//! Shared plumbing for the pawpular training harness: layered configuration,
//! parameter flattening, run-artifact persistence, outbound HTTP, Slack
//! notification and git revision lookup.

pub mod config;
pub mod error;
pub mod flatten;
pub mod git;
pub mod http;
pub mod notify;
pub mod persistence;

pub use config::{
    ConfigSources, Criterion, FoldStrategy, OptimizerKind, ParamsConfig, RunConfig,
    SchedulerKind, load_config, load_config_from,
};
pub use error::CoreError;
pub use flatten::{flatten_params, flatten_value};
pub use http::{HttpTransport, ReqwestTransport};
pub use notify::SlackNotifier;
