//! Configuration system for pawpular.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config (or an explicit file) -> environment -> `key.path=value` overrides.
//! The debug override is applied last, after extraction.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreError;

/// File name looked up in the workspace directory.
pub const WORKSPACE_CONFIG_FILE: &str = "pawpular.toml";

/// Prefix for environment overrides (`PAWPULAR_PARAMS__EPOCH=3`).
pub const ENV_PREFIX: &str = "PAWPULAR_";

/// Top-level configuration for one experiment run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub mlflow: MlflowConfig,
    #[serde(default)]
    pub wandb: WandbConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
}

/// Execution settings that are not hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Fast-iteration mode; see [`RunConfig::apply_debug_overrides`].
    #[serde(default)]
    pub debug: bool,
    /// Requested accelerator ids, recorded with the run.
    #[serde(default)]
    pub gpus: String,
    /// Log training progress every N optimizer steps.
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    /// Job type labels; the first one is sent to W&B.
    #[serde(default = "default_job_type")]
    pub job_type: Vec<String>,
    #[serde(default)]
    pub dirs: DirsConfig,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            gpus: String::new(),
            print_freq: default_print_freq(),
            job_type: default_job_type(),
            dirs: DirsConfig::default(),
        }
    }
}

fn default_print_freq() -> usize {
    100
}

fn default_job_type() -> Vec<String> {
    vec!["training".to_string()]
}

/// Input and output directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    /// Holds `train.csv`, `test.csv` and `sample_submission.csv`.
    #[serde(default = "default_input_dir")]
    pub input: PathBuf,
    /// Root for per-run output directories.
    #[serde(default = "default_output_dir")]
    pub output: PathBuf,
    /// Root holding previous runs for validation blends.
    #[serde(default = "default_base_results_dir")]
    pub base_results: PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            input: default_input_dir(),
            output: default_output_dir(),
            base_results: default_base_results_dir(),
        }
    }
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("input")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_base_results_dir() -> PathBuf {
    PathBuf::from("base_results")
}

/// Loss function used during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    #[serde(rename = "MSELoss")]
    Mse,
    #[serde(rename = "RMSELoss")]
    Rmse,
    #[serde(rename = "BCEWithLogitsLoss")]
    BceWithLogits,
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criterion::Mse => write!(f, "MSELoss"),
            Criterion::Rmse => write!(f, "RMSELoss"),
            Criterion::BceWithLogits => write!(f, "BCEWithLogitsLoss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Constant,
    Cosine,
    Step,
}

/// How rows are dealt into folds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldStrategy {
    Kfold,
    Stratified,
}

/// Hyperparameters. This subtree is what gets logged to tracking backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_n_fold")]
    pub n_fold: usize,
    #[serde(default = "default_epoch")]
    pub epoch: usize,
    /// Early-stopping patience; zero or negative disables halting.
    #[serde(default = "default_es_patience")]
    pub es_patience: i64,
    /// Minimum loss decrease that counts as an improvement.
    #[serde(default)]
    pub es_delta: f64,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_criterion")]
    pub criterion: Criterion,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Step scheduler: decay every `step_size` epochs by `gamma`.
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fold_strategy")]
    pub fold_strategy: FoldStrategy,
    /// Target bins for stratified folds; Sturges' rule when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_bins: Option<usize>,
    /// Targets are divided by this for training and predictions multiplied back.
    #[serde(default = "default_target_scale")]
    pub target_scale: f64,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_target_column")]
    pub target_column: String,
    #[serde(default = "default_feature_columns")]
    pub feature_columns: Vec<String>,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            n_fold: default_n_fold(),
            epoch: default_epoch(),
            es_patience: default_es_patience(),
            es_delta: 0.0,
            model_name: default_model_name(),
            criterion: default_criterion(),
            optimizer: default_optimizer(),
            scheduler: default_scheduler(),
            lr: default_lr(),
            min_lr: default_min_lr(),
            weight_decay: 0.0,
            momentum: default_momentum(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            batch_size: default_batch_size(),
            fold_strategy: default_fold_strategy(),
            n_bins: None,
            target_scale: default_target_scale(),
            id_column: default_id_column(),
            target_column: default_target_column(),
            feature_columns: default_feature_columns(),
        }
    }
}

fn default_seed() -> u64 {
    440
}

fn default_n_fold() -> usize {
    5
}

fn default_epoch() -> usize {
    20
}

fn default_es_patience() -> i64 {
    3
}

fn default_model_name() -> String {
    "linear/metadata".to_string()
}

fn default_criterion() -> Criterion {
    Criterion::BceWithLogits
}

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Adam
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::Cosine
}

fn default_lr() -> f64 {
    1e-2
}

fn default_min_lr() -> f64 {
    1e-5
}

fn default_momentum() -> f64 {
    0.9
}

fn default_step_size() -> usize {
    5
}

fn default_gamma() -> f64 {
    0.5
}

fn default_batch_size() -> usize {
    64
}

fn default_fold_strategy() -> FoldStrategy {
    FoldStrategy::Stratified
}

fn default_target_scale() -> f64 {
    100.0
}

fn default_id_column() -> String {
    "Id".to_string()
}

fn default_target_column() -> String {
    "Pawpularity".to_string()
}

fn default_feature_columns() -> Vec<String> {
    [
        "Subject Focus",
        "Eyes",
        "Face",
        "Near",
        "Action",
        "Accessory",
        "Group",
        "Collage",
        "Human",
        "Occlusion",
        "Info",
        "Blur",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// MLflow tracking server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlflowConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tracking_uri")]
    pub tracking_uri: String,
    #[serde(default = "default_experiment")]
    pub experiment: String,
}

impl Default for MlflowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tracking_uri: default_tracking_uri(),
            experiment: default_experiment(),
        }
    }
}

fn default_tracking_uri() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_experiment() -> String {
    "pawpularity".to_string()
}

/// Weights & Biases connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WandbConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub entity: String,
    #[serde(default = "default_experiment")]
    pub project: String,
    #[serde(default = "default_wandb_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_wandb_api_key_env")]
    pub api_key_env: String,
    /// Upload the run directory's files to the run when it finishes.
    #[serde(default)]
    pub save_artifacts: bool,
}

impl Default for WandbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entity: String::new(),
            project: default_experiment(),
            base_url: default_wandb_base_url(),
            api_key_env: default_wandb_api_key_env(),
            save_artifacts: false,
        }
    }
}

fn default_wandb_base_url() -> String {
    "https://api.wandb.ai".to_string()
}

fn default_wandb_api_key_env() -> String {
    "WANDB_API_KEY".to_string()
}

/// Slack result notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Name of the environment variable holding the webhook URL.
    #[serde(default = "default_webhook_env")]
    pub webhook_env: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_env: default_webhook_env(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_webhook_env() -> String {
    "SLACK_WEBHOOK_URL".to_string()
}

/// Validation blend inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateConfig {
    /// Directory names under `settings.dirs.base_results`.
    #[serde(default)]
    pub base_results: Vec<String>,
}

impl RunConfig {
    /// Force the fast-iteration settings when `settings.debug` is set.
    ///
    /// Returns whether anything was overridden.
    pub fn apply_debug_overrides(&mut self) -> bool {
        if !self.settings.debug {
            return false;
        }
        self.mlflow.enabled = false;
        self.wandb.enabled = false;
        self.settings.print_freq = 10;
        self.params.n_fold = 3;
        self.params.epoch = 1;
        tracing::info!("Debug mode: n_fold=3, epoch=1, tracking disabled");
        true
    }

    /// Per-run output directory, `{dirs.output}/{date}/{time}`.
    pub fn run_dir(&self, now: chrono::DateTime<chrono::Local>) -> PathBuf {
        self.settings
            .dirs
            .output
            .join(now.format("%Y-%m-%d").to_string())
            .join(now.format("%H-%M-%S").to_string())
    }

    /// Model name safe for use in file names.
    pub fn sanitized_model_name(&self) -> String {
        self.params.model_name.replace('/', "-")
    }
}

/// Parse a `key.path=value` override.
///
/// The value is read as a TOML scalar or array when it parses as one and kept
/// as a plain string otherwise, so `params.epoch=5` yields an integer and
/// `params.model_name=resnet18` a string.
pub fn parse_override(raw: &str) -> Result<(String, toml::Value), CoreError> {
    let (key, value) = raw.split_once('=').ok_or_else(|| CoreError::InvalidOverride {
        raw: raw.to_string(),
        reason: "expected key=value".to_string(),
    })?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(CoreError::InvalidOverride {
            raw: raw.to_string(),
            reason: "empty key segment".to_string(),
        });
    }
    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

/// Where the layers outside the workspace come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSources {
    /// User-level config file; skipped when `None` or absent on disk.
    pub user_config: Option<PathBuf>,
    /// Prefix of environment variables merged as a layer; `None` skips it.
    pub env_prefix: Option<String>,
}

impl ConfigSources {
    /// `~/.config/pawpular/config.toml` (per platform) and `PAWPULAR_*` variables.
    pub fn system() -> Self {
        Self {
            user_config: directories::ProjectDirs::from("dev", "pawpular", "pawpular")
                .map(|dirs| dirs.config_dir().join("config.toml")),
            env_prefix: Some(ENV_PREFIX.to_string()),
        }
    }

    /// Only defaults, workspace or explicit file, and overrides.
    pub fn isolated() -> Self {
        Self::default()
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. `overrides` (`key.path=value`)
/// 2. Environment variables (`PAWPULAR_PARAMS__EPOCH`, ...)
/// 3. `config_file`, or `<workspace>/pawpular.toml` when no file is given
/// 4. User config (`~/.config/pawpular/config.toml`)
/// 5. Built-in defaults
///
/// The debug override is not applied here.
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: &[String],
) -> Result<RunConfig, CoreError> {
    load_config_from(&ConfigSources::system(), workspace, config_file, overrides)
}

/// [`load_config`] with explicit user and environment layers.
pub fn load_config_from(
    sources: &ConfigSources,
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: &[String],
) -> Result<RunConfig, CoreError> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(user_config) = sources.user_config.as_deref().filter(|p| p.exists()) {
        figment = figment.merge(Toml::file(user_config));
    }

    match config_file {
        Some(path) => {
            if !path.exists() {
                return Err(CoreError::ConfigNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            if let Some(ws) = workspace {
                let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
                if ws_config.exists() {
                    figment = figment.merge(Toml::file(&ws_config));
                }
            }
        }
    }

    if let Some(prefix) = &sources.env_prefix {
        figment = figment.merge(Env::prefixed(prefix).split("__"));
    }

    for raw in overrides {
        let (key, value) = parse_override(raw)?;
        figment = figment.merge(Serialized::default(&key, value));
    }

    figment.extract().map_err(|e| CoreError::Config(Box::new(e)))
}
