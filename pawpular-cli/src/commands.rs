//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use crate::Invocation;
use anyhow::Context;
use pawpular_core::config::WORKSPACE_CONFIG_FILE;
use pawpular_core::{HttpTransport, ReqwestTransport, RunConfig, SlackNotifier, flatten_params};
use pawpular_ml::tracking::mlflow::MlflowClient;
use pawpular_ml::tracking::wandb::{RunPath, WandbClient};
use pawpular_ml::{RunContext, TrainingRun, factory_for, load_inputs, setup_reporters};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// JSON log written into each run directory.
pub const LOG_FILE: &str = "pawpular.log";

/// Resolved configuration written next to the run artifacts.
pub const RESOLVED_CONFIG_FILE: &str = "config.toml";

/// Load the layered configuration, apply the debug override and anchor
/// relative directories at the workspace.
pub fn load(
    workspace: &Path,
    config_file: Option<&Path>,
    overrides: &[String],
) -> anyhow::Result<RunConfig> {
    let mut config = pawpular_core::load_config(Some(workspace), config_file, overrides)
        .context("Failed to load config")?;
    config.apply_debug_overrides();
    let dirs = &mut config.settings.dirs;
    for dir in [&mut dirs.input, &mut dirs.output, &mut dirs.base_results] {
        if dir.is_relative() {
            *dir = workspace.join(&*dir);
        }
    }
    Ok(config)
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, inv: &Invocation) -> anyhow::Result<()> {
    let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new());
    handle_with_transport(command, inv, transport).await
}

async fn handle_with_transport(
    command: Commands,
    inv: &Invocation,
    transport: Arc<dyn HttpTransport>,
) -> anyhow::Result<()> {
    match command {
        Commands::Train { overrides } => handle_train(&overrides.overrides, inv, transport).await,
        Commands::Validate { overrides } => {
            handle_validate(&overrides.overrides, inv, transport).await
        }
        Commands::Params { overrides } => handle_params(&overrides.overrides, inv, transport).await,
        Commands::UpdateLb { run_path, score } => {
            let config = load(&inv.workspace, inv.config_file.as_deref(), &[])?;
            let run = RunPath::parse(&run_path)?;
            let client = WandbClient::from_config(&config.wandb, transport)?;
            client
                .update_summary(&run, "LB", serde_json::json!(score))
                .await
                .with_context(|| format!("Failed to update summary of {run}"))?;
            println!("Updated {run}: LB = {score}");
            Ok(())
        }
        Commands::DeleteModel { name } => {
            let config = load(&inv.workspace, inv.config_file.as_deref(), &[])?;
            let client = MlflowClient::new(config.mlflow.tracking_uri.clone(), transport);
            client
                .delete_registered_model(&name)
                .await
                .with_context(|| format!("Failed to delete registered model '{name}'"))?;
            println!("Deleted registered model '{name}'");
            Ok(())
        }
        Commands::Notify { text } => {
            let config = load(&inv.workspace, inv.config_file.as_deref(), &[])?;
            let notifier = SlackNotifier::from_config(&config.slack, transport);
            if !notifier.is_configured() {
                println!(
                    "Slack webhook not configured (set {}), nothing sent",
                    config.slack.webhook_env
                );
                return Ok(());
            }
            if notifier.send(&text).await {
                println!("Sent.");
            }
            Ok(())
        }
        Commands::Config { action } => handle_config(action, inv),
    }
}

fn handle_config(action: ConfigAction, inv: &Invocation) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            std::fs::create_dir_all(&inv.workspace)?;
            let config_path = inv.workspace.join(WORKSPACE_CONFIG_FILE);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RunConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show { overrides } => {
            let config = load(
                &inv.workspace,
                inv.config_file.as_deref(),
                &overrides.overrides,
            )?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Output directory for this invocation, computed now when `main` did not.
fn run_dir(inv: &Invocation, config: &RunConfig) -> PathBuf {
    inv.run_dir
        .clone()
        .unwrap_or_else(|| config.run_dir(chrono::Local::now()))
}

/// `{date}_{time}` from the last two components of the run directory.
fn run_name(run_dir: &Path) -> String {
    let parts: Vec<String> = run_dir
        .components()
        .rev()
        .take(2)
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.into_iter().rev().collect::<Vec<_>>().join("_")
}

fn commit(workspace: &Path) -> Option<String> {
    match pawpular_core::git::commit_hash(workspace) {
        Ok(hash) => Some(hash),
        Err(e) => {
            tracing::warn!(error = %e, "No git revision, runs will not be tagged");
            None
        }
    }
}

fn run_context(
    config: &RunConfig,
    run_dir: &Path,
    commit: Option<String>,
) -> anyhow::Result<RunContext> {
    let mut params = flatten_params("", &config.params)?;
    if let Some(hash) = &commit {
        params.push(("commit".to_string(), hash.clone()));
    }
    Ok(RunContext {
        run_name: run_name(run_dir),
        commit,
        job_type: config
            .settings
            .job_type
            .first()
            .cloned()
            .unwrap_or_else(|| "training".to_string()),
        config: params,
    })
}

/// Create the run directory and record the resolved configuration in it.
fn prepare_run_dir(config: &RunConfig, run_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("Failed to create {}", run_dir.display()))?;
    pawpular_core::persistence::write_atomic(
        &run_dir.join(RESOLVED_CONFIG_FILE),
        toml::to_string_pretty(config)?.as_bytes(),
    )?;
    Ok(())
}

async fn handle_train(
    overrides: &[String],
    inv: &Invocation,
    transport: Arc<dyn HttpTransport>,
) -> anyhow::Result<()> {
    let config = load(&inv.workspace, inv.config_file.as_deref(), overrides)?;
    let run_dir = run_dir(inv, &config);
    prepare_run_dir(&config, &run_dir)?;

    let commit = commit(&inv.workspace);
    let ctx = run_context(&config, &run_dir, commit.clone())?;
    let reporters = setup_reporters(&config, &run_dir, transport.clone(), &ctx)
        .await
        .context("Failed to set up tracking")?;
    let notifier = SlackNotifier::from_config(&config.slack, transport);

    let inputs = load_inputs(&config).context("Failed to load inputs")?;
    let factory = factory_for(&config.params.model_name)?;

    let summary = TrainingRun::new(config, run_dir, factory)
        .with_reporters(reporters)
        .with_notifier(notifier)
        .with_commit(commit)
        .run(inputs)
        .await
        .context("Training failed")?;

    println!("CV score: {:.5}  loss: {:.5}", summary.score, summary.loss);
    println!("OOF predictions: {}", summary.oof_path.display());
    if let Some(path) = &summary.submission_path {
        println!("Submission: {}", path.display());
    }
    Ok(())
}

async fn handle_validate(
    overrides: &[String],
    inv: &Invocation,
    transport: Arc<dyn HttpTransport>,
) -> anyhow::Result<()> {
    let mut config = load(&inv.workspace, inv.config_file.as_deref(), overrides)?;
    config.settings.job_type = vec!["validation".to_string()];
    let run_dir = run_dir(inv, &config);
    prepare_run_dir(&config, &run_dir)?;

    let ctx = run_context(&config, &run_dir, commit(&inv.workspace))?;
    let mut reporters = setup_reporters(&config, &run_dir, transport, &ctx)
        .await
        .context("Failed to set up tracking")?;

    let inputs = load_inputs(&config).context("Failed to load inputs")?;
    let score =
        pawpular_ml::validate::run_validation(&config, &inputs.train, &run_dir, &mut reporters)
            .await
            .context("Validation failed")?;
    reporters.finish(None, &run_dir).await?;

    println!("Blend score: {score:.5}");
    Ok(())
}

async fn handle_params(
    overrides: &[String],
    inv: &Invocation,
    transport: Arc<dyn HttpTransport>,
) -> anyhow::Result<()> {
    let config = load(&inv.workspace, inv.config_file.as_deref(), overrides)?;
    // Keys carry the section name here (`params.seed`), unlike training runs.
    let params = flatten_params("params", &config.params)?;
    for (key, value) in &params {
        println!("{key}={value}");
    }

    if config.mlflow.enabled {
        let client = MlflowClient::new(config.mlflow.tracking_uri.clone(), transport);
        let experiment = client
            .get_or_create_experiment(&config.mlflow.experiment)
            .await?;
        let run_name = format!("params_{}", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let (run_id, _) = client.create_run(&experiment, &run_name).await?;
        for (key, value) in &params {
            client.log_param(&run_id, key, value).await?;
        }
        client.finish_run(&run_id).await?;
        println!("Logged {} params to MLflow run {run_id}", params.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Overrides;
    use pawpular_core::http::RecordingTransport;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn invocation(workspace: &Path) -> Invocation {
        Invocation {
            workspace: workspace.to_path_buf(),
            config_file: None,
            run_dir: None,
        }
    }

    fn overrides(raw: &[&str]) -> Overrides {
        Overrides {
            overrides: raw.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn write_train_csv(dir: &Path, n: usize) {
        std::fs::create_dir_all(dir).unwrap();
        let mut csv = String::from("Id,Eyes,Face,Pawpularity\n");
        for i in 0..n {
            let eyes = i % 2;
            let face = (i / 2) % 2;
            let target = 20 + 30 * eyes + 10 * face + (i % 7);
            csv.push_str(&format!("img{i:03},{eyes},{face},{target}\n"));
        }
        std::fs::write(dir.join("train.csv"), csv).unwrap();
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, &invocation(dir.path())).await.unwrap();

        let config_path = dir.path().join(WORKSPACE_CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: RunConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.params.n_fold, 5);
        assert_eq!(parsed.params.target_column, "Pawpularity");
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path());
        let config_path = dir.path().join(WORKSPACE_CONFIG_FILE);
        std::fs::write(&config_path, "[params]\nepoch = 7\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, &inv).await.unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert_eq!(content, "[params]\nepoch = 7\n");
    }

    #[tokio::test]
    async fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Config {
            action: ConfigAction::Show {
                overrides: Overrides::default(),
            },
        };
        assert!(handle_command(command, &invocation(dir.path())).await.is_ok());
    }

    #[test]
    fn test_load_anchors_dirs_and_applies_debug() {
        let dir = TempDir::new().unwrap();
        let config = load(dir.path(), None, &["settings.debug=true".to_string()]).unwrap();
        assert_eq!(config.settings.dirs.input, dir.path().join("input"));
        assert_eq!(config.settings.dirs.output, dir.path().join("output"));
        assert_eq!(config.params.n_fold, 3);
        assert_eq!(config.params.epoch, 1);
    }

    #[test]
    fn test_load_rejects_bad_override() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path(), None, &["no-equals-sign".to_string()]).is_err());
    }

    #[test]
    fn test_run_name_from_dir() {
        let path = Path::new("/out/2026-10-17/09-30-00");
        assert_eq!(run_name(path), "2026-10-17_09-30-00");
    }

    #[tokio::test]
    async fn test_params_logs_to_mlflow() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(serde_json::json!({ "experiment": { "experiment_id": "3" } }));
        transport.push_json(serde_json::json!({
            "run": { "info": {
                "run_id": "r1",
                "artifact_uri": "mlflow-artifacts:/3/r1/artifacts"
            } }
        }));

        let command = Commands::Params {
            overrides: overrides(&[
                "mlflow.enabled=true",
                "mlflow.tracking_uri=http://mlflow.test",
            ]),
        };
        handle_with_transport(command, &invocation(dir.path()), transport.clone())
            .await
            .unwrap();

        let expected = flatten_params("", &RunConfig::default().params).unwrap().len();
        let logged = transport.requests_to("runs/log-parameter");
        assert_eq!(logged.len(), expected);
        assert!(logged.iter().all(|r| {
            r.json().unwrap()["key"]
                .as_str()
                .is_some_and(|k| k.starts_with("params."))
        }));
        assert!(
            logged
                .iter()
                .any(|r| r.json().unwrap()["key"] == "params.seed")
        );
        assert_eq!(transport.requests_to("runs/update").len(), 1);
    }

    #[tokio::test]
    async fn test_notify_without_webhook_sends_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[slack]\nwebhook_env = \"PAWPULAR_TEST_WEBHOOK_NEVER_SET\"\n",
        )
        .unwrap();
        let transport = Arc::new(RecordingTransport::new());

        let command = Commands::Notify {
            text: "hello".into(),
        };
        handle_with_transport(command, &invocation(dir.path()), transport.clone())
            .await
            .unwrap();
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_update_lb_rejects_bad_run_path() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let command = Commands::UpdateLb {
            run_path: "just-a-run".into(),
            score: 17.5,
        };
        let result =
            handle_with_transport(command, &invocation(dir.path()), transport.clone()).await;
        assert!(result.is_err());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_train_writes_run_dir() {
        let dir = TempDir::new().unwrap();
        write_train_csv(&dir.path().join("input"), 30);
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            "[slack]\nenabled = false\n",
        )
        .unwrap();
        let run_dir = dir.path().join("output").join("run");
        let inv = Invocation {
            run_dir: Some(run_dir.clone()),
            ..invocation(dir.path())
        };

        let command = Commands::Train {
            overrides: overrides(&[
                "params.n_fold=3",
                "params.epoch=2",
                "params.batch_size=4",
                "params.criterion=MSELoss",
                r#"params.feature_columns=["Eyes", "Face"]"#,
            ]),
        };
        handle_with_transport(command, &inv, Arc::new(RecordingTransport::new()))
            .await
            .unwrap();

        assert!(run_dir.join(RESOLVED_CONFIG_FILE).exists());
        assert!(run_dir.join(pawpular_ml::training::runner::OOF_FILE).exists());
        assert!(run_dir.join(pawpular_ml::training::runner::SUMMARY_FILE).exists());
        let resolved: RunConfig =
            toml::from_str(&std::fs::read_to_string(run_dir.join(RESOLVED_CONFIG_FILE)).unwrap())
                .unwrap();
        assert_eq!(resolved.params.n_fold, 3);
    }
}
