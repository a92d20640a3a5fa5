//! Weights & Biases tracking through its GraphQL and file-stream APIs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pawpular_core::HttpTransport;
use pawpular_core::config::WandbConfig;
use pawpular_core::http::{Auth, HttpRequest};
use serde_json::{Map, Value, json};

use super::{MetricReporter, RunContext, artifact_files};
use crate::error::MlError;

const UPSERT_BUCKET: &str = r#"mutation UpsertBucket(
  $id: String, $name: String, $project: String, $entity: String, $config: JSONString,
  $jobType: String, $commit: String, $displayName: String, $summaryMetrics: JSONString
) {
  upsertBucket(input: {
    id: $id, name: $name, modelName: $project, entityName: $entity, config: $config,
    jobType: $jobType, commit: $commit, displayName: $displayName,
    summaryMetrics: $summaryMetrics
  }) {
    bucket { id name project { name entity { name } } }
  }
}"#;

const RUN_SUMMARY: &str = r#"query RunSummary($entity: String!, $project: String!, $name: String!) {
  project(name: $project, entityName: $entity) {
    run(name: $name) { id summaryMetrics }
  }
}"#;

const RUN_UPLOAD_URLS: &str = r#"query RunUploadUrls(
  $name: String!, $files: [String]!, $entity: String, $run: String!
) {
  model(name: $name, entityName: $entity) {
    bucket(name: $run) {
      id
      files(names: $files) { edges { node { name url(upload: true) } } }
    }
  }
}"#;

const HISTORY_FILE: &str = "wandb-history.jsonl";
const SUMMARY_FILE: &str = "wandb-summary.json";

/// A run as addressed by the W&B API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPath {
    pub entity: String,
    pub project: String,
    pub run: String,
}

impl RunPath {
    /// Parse `entity/project/run` (an optional `runs/` segment before the id is accepted).
    pub fn parse(raw: &str) -> Result<Self, MlError> {
        let parts: Vec<&str> = raw.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            [entity, project, run] | [entity, project, "runs", run]
                if !entity.is_empty() && !project.is_empty() && !run.is_empty() =>
            {
                Ok(Self {
                    entity: entity.to_string(),
                    project: project.to_string(),
                    run: run.to_string(),
                })
            }
            _ => Err(MlError::invalid_input(format!(
                "run path must be entity/project/run_id, got '{raw}'"
            ))),
        }
    }
}

impl std::fmt::Display for RunPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.project, self.run)
    }
}

pub struct WandbClient {
    base_url: String,
    api_key: String,
    transport: Arc<dyn HttpTransport>,
}

impl WandbClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            transport,
        }
    }

    /// Read the API key from the environment variable named in `config`.
    pub fn from_config(
        config: &WandbConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, MlError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                MlError::Config(format!("W&B enabled but {} is not set", config.api_key_env))
            })?;
        Ok(Self::new(config.base_url.clone(), api_key, transport))
    }

    fn auth(&self) -> Auth {
        Auth::Basic {
            user: "api".into(),
            password: self.api_key.clone(),
        }
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, MlError> {
        let url = format!("{}/graphql", self.base_url);
        let request = HttpRequest::post_json(
            url.clone(),
            json!({ "query": query, "variables": variables }),
        )
        .with_auth(self.auth());
        let body = self.transport.send(request).await?.into_json(&url)?;
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(MlError::tracking(format!("W&B GraphQL error: {errors}")));
        }
        Ok(body["data"].clone())
    }

    /// Create or update a run. Returns the bucket's `(id, entity)`.
    pub async fn upsert_run(&self, variables: Value) -> Result<(String, String), MlError> {
        let data = self.graphql(UPSERT_BUCKET, variables).await?;
        let bucket = &data["upsertBucket"]["bucket"];
        let id = bucket["id"]
            .as_str()
            .ok_or_else(|| MlError::tracking(format!("no bucket id in {data}")))?;
        let entity = bucket["project"]["entity"]["name"].as_str().unwrap_or_default();
        Ok((id.to_string(), entity.to_string()))
    }

    /// Post to the run's file stream.
    pub async fn file_stream(&self, run: &RunPath, payload: Value) -> Result<(), MlError> {
        let url = format!(
            "{}/files/{}/{}/{}/file_stream",
            self.base_url, run.entity, run.project, run.run
        );
        let request = HttpRequest::post_json(url.clone(), payload).with_auth(self.auth());
        self.transport.send(request).await?.into_json(&url)?;
        Ok(())
    }

    /// Upload `(name, contents)` pairs as files of `run`.
    ///
    /// Upload URLs come from the GraphQL API; the contents are PUT to each
    /// one and the file stream is told which names arrived.
    pub async fn upload_files(
        &self,
        run: &RunPath,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<(), MlError> {
        if files.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
        let data = self
            .graphql(
                RUN_UPLOAD_URLS,
                json!({
                    "name": run.project,
                    "entity": run.entity,
                    "run": run.run,
                    "files": names,
                }),
            )
            .await?;
        let edges = data["model"]["bucket"]["files"]["edges"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut uploaded = Vec::with_capacity(files.len());
        for (name, bytes) in files {
            let url = edges
                .iter()
                .map(|e| &e["node"])
                .find(|node| node["name"].as_str() == Some(name.as_str()))
                .and_then(|node| node["url"].as_str())
                .ok_or_else(|| MlError::tracking(format!("no upload url for {name}")))?;
            let resp = self
                .transport
                .send(HttpRequest::put_bytes(url.to_string(), bytes))
                .await?;
            if !resp.is_success() {
                return Err(MlError::tracking(format!(
                    "upload of {name} failed with status {}",
                    resp.status
                )));
            }
            uploaded.push(name);
        }
        tracing::info!(run = %run, files = uploaded.len(), "Uploaded files to W&B");
        self.file_stream(run, json!({ "uploaded": uploaded })).await
    }

    /// Set `key` in an existing run's summary, keeping the other summary values.
    pub async fn update_summary(
        &self,
        run: &RunPath,
        key: &str,
        value: Value,
    ) -> Result<(), MlError> {
        let data = self
            .graphql(
                RUN_SUMMARY,
                json!({ "entity": run.entity, "project": run.project, "name": run.run }),
            )
            .await?;
        let found = &data["project"]["run"];
        let id = found["id"]
            .as_str()
            .ok_or_else(|| MlError::not_found(format!("W&B run {run}")))?;

        let mut summary: Map<String, Value> = match found["summaryMetrics"].as_str() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Map::new(),
        };
        summary.insert(key.to_string(), value);

        self.upsert_run(json!({
            "id": id,
            "summaryMetrics": Value::Object(summary).to_string(),
        }))
        .await?;
        tracing::info!(run = %run, key, "Updated W&B summary");
        Ok(())
    }
}

/// W&B `config` payload: every key wrapped as `{"value": ...}`.
fn wandb_config(params: &[(String, String)]) -> Value {
    let map: Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), json!({ "value": v })))
        .collect();
    Value::Object(map)
}

/// One W&B run.
pub struct WandbReporter {
    client: WandbClient,
    run: RunPath,
    bucket_id: String,
    history_offset: usize,
    summary: Map<String, Value>,
    config: Vec<(String, String)>,
    save_artifacts: bool,
}

impl WandbReporter {
    pub async fn start(
        client: WandbClient,
        config: &WandbConfig,
        ctx: &RunContext,
    ) -> Result<Self, MlError> {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let mut variables = json!({
            "name": run_id,
            "project": config.project,
            "config": wandb_config(&ctx.config).to_string(),
            "jobType": ctx.job_type,
            "displayName": ctx.run_name,
        });
        if !config.entity.is_empty() {
            variables["entity"] = json!(config.entity);
        }
        if let Some(commit) = &ctx.commit {
            variables["commit"] = json!(commit);
        }
        let (bucket_id, entity) = client.upsert_run(variables).await?;
        let entity = if entity.is_empty() {
            config.entity.clone()
        } else {
            entity
        };
        let run = RunPath {
            entity,
            project: config.project.clone(),
            run: run_id,
        };
        tracing::info!(run = %run, "Started W&B run");
        Ok(Self {
            client,
            run,
            bucket_id,
            history_offset: 0,
            summary: Map::new(),
            config: ctx.config.clone(),
            save_artifacts: config.save_artifacts,
        })
    }

    pub fn run_path(&self) -> &RunPath {
        &self.run
    }
}

#[async_trait]
impl MetricReporter for WandbReporter {
    fn name(&self) -> &str {
        "wandb"
    }

    async fn log_params(&mut self, params: &[(String, String)]) -> Result<(), MlError> {
        self.config.extend(params.iter().cloned());
        self.client
            .upsert_run(json!({
                "id": self.bucket_id,
                "config": wandb_config(&self.config).to_string(),
            }))
            .await?;
        Ok(())
    }

    async fn log_metric(&mut self, key: &str, value: f64, step: usize) -> Result<(), MlError> {
        let row = json!({
            key: value,
            "_step": step,
            "_timestamp": Utc::now().timestamp(),
        });
        self.summary.insert(key.to_string(), json!(value));
        self.client
            .file_stream(
                &self.run,
                json!({ "files": { HISTORY_FILE: {
                    "offset": self.history_offset,
                    "content": [row.to_string()],
                } } }),
            )
            .await?;
        self.history_offset += 1;
        Ok(())
    }

    async fn save_file(&mut self, path: &Path) -> Result<(), MlError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MlError::invalid_input(format!("not a file: {}", path.display())))?;
        let bytes = std::fs::read(path)?;
        self.client.upload_files(&self.run, vec![(name, bytes)]).await
    }

    async fn finish(&mut self, loss: Option<f64>, artifacts_dir: &Path) -> Result<(), MlError> {
        if let Some(loss) = loss {
            self.summary.insert("loss".into(), json!(loss));
        }
        if self.save_artifacts {
            let files = artifact_files(artifacts_dir)?;
            self.client.upload_files(&self.run, files).await?;
        }
        self.client
            .file_stream(
                &self.run,
                json!({ "files": { SUMMARY_FILE: {
                    "offset": 0,
                    "content": [Value::Object(self.summary.clone()).to_string()],
                } } }),
            )
            .await?;
        self.client
            .file_stream(&self.run, json!({ "complete": true, "exitcode": 0 }))
            .await?;
        tracing::info!(run = %self.run, "Finished W&B run");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawpular_core::http::{Body, RecordingTransport};

    fn bucket(entity: &str) -> Value {
        json!({ "data": { "upsertBucket": { "bucket": {
            "id": "QnVja2V0OjE=", "name": "abc",
            "project": { "name": "pawpularity", "entity": { "name": entity } }
        } } } })
    }

    fn ctx() -> RunContext {
        RunContext {
            run_name: "2026-10-17/12-00-00".into(),
            commit: Some("deadbeef".into()),
            job_type: "training".into(),
            config: vec![("params.seed".into(), "440".into())],
        }
    }

    #[test]
    fn test_run_path_parse() {
        let p = RunPath::parse("me/paw/abc123").unwrap();
        assert_eq!(p.to_string(), "me/paw/abc123");
        assert_eq!(RunPath::parse("me/paw/runs/abc123").unwrap(), p);
        assert!(RunPath::parse("me/paw").is_err());
        assert!(RunPath::parse("me//abc").is_err());
    }

    #[tokio::test]
    async fn test_start_and_log() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(bucket("team"));
        let client = WandbClient::new("https://api.wandb.ai/", "k", transport.clone());
        let mut reporter = WandbReporter::start(client, &WandbConfig::default(), &ctx())
            .await
            .unwrap();
        assert_eq!(reporter.run_path().entity, "team");

        let upsert = &transport.requests_to("/graphql")[0];
        let vars = &upsert.json().unwrap()["variables"];
        assert_eq!(vars["jobType"], "training");
        assert_eq!(vars["commit"], "deadbeef");
        assert_eq!(vars["config"], r#"{"params.seed":{"value":"440"}}"#);
        assert_eq!(
            upsert.auth,
            Auth::Basic {
                user: "api".into(),
                password: "k".into()
            }
        );

        reporter.log_metric("score", 18.0, 0).await.unwrap();
        reporter.log_metric("score", 17.0, 1).await.unwrap();
        reporter.finish(Some(0.6), Path::new(".")).await.unwrap();

        let streams = transport.requests_to("/file_stream");
        assert_eq!(streams.len(), 4);
        assert!(streams[0].url.starts_with("https://api.wandb.ai/files/team/pawpularity/"));
        assert_eq!(streams[1].json().unwrap()["files"][HISTORY_FILE]["offset"], 1);
        let summary = streams[2].json().unwrap()["files"][SUMMARY_FILE]["content"][0]
            .as_str()
            .unwrap()
            .to_string();
        let summary: Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(summary["score"], 17.0);
        assert_eq!(summary["loss"], 0.6);
        assert_eq!(streams[3].json().unwrap()["complete"], true);
    }

    fn upload_urls(names: &[&str]) -> Value {
        let edges: Vec<Value> = names
            .iter()
            .map(|n| {
                let url = format!("https://storage.test/{n}?sig=1");
                json!({ "node": { "name": n, "url": url } })
            })
            .collect();
        json!({ "data": { "model": { "bucket": { "id": "b", "files": { "edges": edges } } } } })
    }

    #[tokio::test]
    async fn test_finish_uploads_run_dir_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oof_df.csv"), "Id,preds\na,1\n").unwrap();
        std::fs::write(dir.path().join("summary.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(bucket("team"));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport.clone());
        let config = WandbConfig {
            save_artifacts: true,
            ..WandbConfig::default()
        };
        let mut reporter = WandbReporter::start(client, &config, &ctx()).await.unwrap();

        transport.push_json(upload_urls(&["oof_df.csv", "summary.json"]));
        reporter.finish(Some(0.5), dir.path()).await.unwrap();

        let query = &transport.requests_to("/graphql")[1];
        assert_eq!(
            query.json().unwrap()["variables"]["files"],
            json!(["oof_df.csv", "summary.json"])
        );
        let puts: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.url.starts_with("https://storage.test/"))
            .collect();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0].url, "https://storage.test/oof_df.csv?sig=1");
        assert_eq!(puts[0].body, Body::Bytes(b"Id,preds\na,1\n".to_vec()));

        let streams = transport.requests_to("/file_stream");
        assert_eq!(
            streams[0].json().unwrap()["uploaded"],
            json!(["oof_df.csv", "summary.json"])
        );
        assert_eq!(streams.last().unwrap().json().unwrap()["complete"], true);
    }

    #[tokio::test]
    async fn test_finish_skips_upload_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oof_df.csv"), "Id\n").unwrap();
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(bucket("team"));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport.clone());
        let mut reporter = WandbReporter::start(client, &WandbConfig::default(), &ctx())
            .await
            .unwrap();
        reporter.finish(None, dir.path()).await.unwrap();

        assert_eq!(transport.requests_to("/graphql").len(), 1);
        assert!(transport.requests().iter().all(|r| r.url.contains("api.wandb.ai")));
    }

    #[tokio::test]
    async fn test_save_file_uploads_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("validation_df.csv");
        std::fs::write(&path, "Id,preds\n").unwrap();
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(bucket("team"));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport.clone());
        let mut reporter = WandbReporter::start(client, &WandbConfig::default(), &ctx())
            .await
            .unwrap();

        transport.push_json(upload_urls(&["validation_df.csv"]));
        reporter.save_file(&path).await.unwrap();
        assert_eq!(
            transport.requests_to("validation_df.csv?sig=1")[0].body,
            Body::Bytes(b"Id,preds\n".to_vec())
        );
    }

    #[tokio::test]
    async fn test_upload_without_url_is_fatal() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(upload_urls(&[]));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport);
        let run = RunPath::parse("me/paw/abc").unwrap();
        assert!(matches!(
            client.upload_files(&run, vec![("a.csv".into(), vec![1])]).await,
            Err(MlError::Tracking(_))
        ));
    }

    #[tokio::test]
    async fn test_update_summary_merges() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(json!({ "data": { "project": { "run": {
            "id": "UnVuOjE=", "summaryMetrics": "{\"loss\": 0.6}"
        } } } }));
        transport.push_json(bucket("me"));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport.clone());
        let run = RunPath::parse("me/paw/abc").unwrap();
        client.update_summary(&run, "LB", json!(17.9)).await.unwrap();

        let reqs = transport.requests();
        let vars = &reqs[1].json().unwrap()["variables"];
        assert_eq!(vars["id"], "UnVuOjE=");
        let summary: Value =
            serde_json::from_str(vars["summaryMetrics"].as_str().unwrap()).unwrap();
        assert_eq!(summary, json!({ "loss": 0.6, "LB": 17.9 }));
    }

    #[tokio::test]
    async fn test_update_summary_unknown_run() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(json!({ "data": { "project": { "run": null } } }));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport);
        let run = RunPath::parse("me/paw/nope").unwrap();
        assert!(matches!(
            client.update_summary(&run, "LB", json!(1.0)).await,
            Err(MlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_graphql_errors_are_fatal() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(json!({ "errors": [{ "message": "permission denied" }] }));
        let client = WandbClient::new("https://api.wandb.ai", "k", transport);
        assert!(matches!(
            WandbReporter::start(client, &WandbConfig::default(), &ctx()).await,
            Err(MlError::Tracking(_))
        ));
    }
}
