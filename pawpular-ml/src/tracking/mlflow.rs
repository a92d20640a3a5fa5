//! MLflow tracking over its REST API.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pawpular_core::HttpTransport;
use pawpular_core::http::HttpRequest;
use serde_json::{Value, json};

use super::{MetricReporter, RunContext, artifact_files};
use crate::error::MlError;

pub const COMMIT_TAG: &str = "mlflow.source.git.commit";
const RUN_NAME_TAG: &str = "mlflow.runName";
const ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

/// Thin client for the endpoints the harness uses.
pub struct MlflowClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl MlflowClient {
    pub fn new(tracking_uri: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: tracking_uri.into().trim_end_matches('/').to_string(),
            transport,
        }
    }

    fn api(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{endpoint}", self.base_url)
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, MlError> {
        let url = self.api(endpoint);
        let resp = self
            .transport
            .send(HttpRequest::post_json(url.clone(), body))
            .await?;
        Ok(resp.into_json(&url)?)
    }

    /// Id of the named experiment, creating it if needed.
    pub async fn get_or_create_experiment(&self, name: &str) -> Result<String, MlError> {
        let url = format!(
            "{}?experiment_name={}",
            self.api("experiments/get-by-name"),
            urlencoding::encode(name)
        );
        let resp = self.transport.send(HttpRequest::get(url.clone())).await?;
        if resp.status != 404 {
            let body = resp.into_json(&url)?;
            return body["experiment"]["experiment_id"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| MlError::tracking(format!("no experiment_id in {body}")));
        }

        tracing::info!(experiment = name, "Creating MLflow experiment");
        let body = self
            .post("experiments/create", json!({ "name": name }))
            .await?;
        body["experiment_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| MlError::tracking(format!("no experiment_id in {body}")))
    }

    /// Returns `(run_id, artifact_uri)`.
    pub async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
    ) -> Result<(String, String), MlError> {
        let body = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": Utc::now().timestamp_millis(),
                    "tags": [{ "key": RUN_NAME_TAG, "value": run_name }],
                }),
            )
            .await?;
        let info = &body["run"]["info"];
        let run_id = info["run_id"]
            .as_str()
            .ok_or_else(|| MlError::tracking(format!("no run_id in {body}")))?;
        let artifact_uri = info["artifact_uri"].as_str().unwrap_or_default();
        Ok((run_id.to_string(), artifact_uri.to_string()))
    }

    pub async fn log_param(&self, run_id: &str, key: &str, value: &str) -> Result<(), MlError> {
        self.post(
            "runs/log-parameter",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    pub async fn log_metric(
        &self,
        run_id: &str,
        key: &str,
        value: f64,
        step: usize,
    ) -> Result<(), MlError> {
        self.post(
            "runs/log-metric",
            json!({
                "run_id": run_id,
                "key": key,
                "value": value,
                "timestamp": Utc::now().timestamp_millis(),
                "step": step,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<(), MlError> {
        self.post(
            "runs/set-tag",
            json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    pub async fn finish_run(&self, run_id: &str) -> Result<(), MlError> {
        self.post(
            "runs/update",
            json!({
                "run_id": run_id,
                "status": "FINISHED",
                "end_time": Utc::now().timestamp_millis(),
            }),
        )
        .await?;
        Ok(())
    }

    /// Upload one file under the run's `mlflow-artifacts:/` root.
    pub async fn upload_artifact(
        &self,
        artifact_uri: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), MlError> {
        let Some(root) = artifact_uri.strip_prefix(ARTIFACT_SCHEME) else {
            return Err(MlError::tracking(format!(
                "unsupported artifact store {artifact_uri}"
            )));
        };
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}",
            self.base_url,
            root.trim_matches('/'),
            urlencoding::encode(file_name)
        );
        let resp = self.transport.send(HttpRequest::put_bytes(url.clone(), bytes)).await?;
        resp.into_json(&url)?;
        Ok(())
    }

    /// Delete a registered model together with all of its versions.
    pub async fn delete_registered_model(&self, name: &str) -> Result<(), MlError> {
        let url = self.api("registered-models/delete");
        let resp = self
            .transport
            .send(HttpRequest::delete_json(url.clone(), json!({ "name": name })))
            .await?;
        resp.into_json(&url)?;
        tracing::info!(model = name, "Deleted registered model");
        Ok(())
    }
}

/// One MLflow run.
pub struct MlflowReporter {
    client: MlflowClient,
    run_id: String,
    artifact_uri: String,
}

impl MlflowReporter {
    /// Resolve the experiment, create a run and tag it with the commit.
    pub async fn start(
        client: MlflowClient,
        experiment: &str,
        ctx: &RunContext,
    ) -> Result<Self, MlError> {
        let experiment_id = client.get_or_create_experiment(experiment).await?;
        let (run_id, artifact_uri) = client.create_run(&experiment_id, &ctx.run_name).await?;
        if let Some(commit) = &ctx.commit {
            client.set_tag(&run_id, COMMIT_TAG, commit).await?;
        }
        tracing::info!(%run_id, experiment, "Started MLflow run");
        Ok(Self {
            client,
            run_id,
            artifact_uri,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

#[async_trait]
impl MetricReporter for MlflowReporter {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn log_params(&mut self, params: &[(String, String)]) -> Result<(), MlError> {
        for (key, value) in params {
            self.client.log_param(&self.run_id, key, value).await?;
        }
        Ok(())
    }

    async fn log_metric(&mut self, key: &str, value: f64, step: usize) -> Result<(), MlError> {
        self.client.log_metric(&self.run_id, key, value, step).await
    }

    async fn finish(&mut self, loss: Option<f64>, artifacts_dir: &Path) -> Result<(), MlError> {
        if let Some(loss) = loss {
            self.client.log_metric(&self.run_id, "loss", loss, 0).await?;
        }

        if self.artifact_uri.starts_with(ARTIFACT_SCHEME) {
            for (name, bytes) in artifact_files(artifacts_dir)? {
                self.client
                    .upload_artifact(&self.artifact_uri, &name, bytes)
                    .await?;
            }
        } else {
            tracing::warn!(
                artifact_uri = %self.artifact_uri,
                "Artifact store not reachable over HTTP, skipping upload"
            );
        }

        self.client.finish_run(&self.run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pawpular_core::http::{HttpResponse, Method, RecordingTransport};

    fn ctx(commit: Option<&str>) -> RunContext {
        RunContext {
            run_name: "run-1".into(),
            commit: commit.map(str::to_string),
            job_type: "training".into(),
            config: Vec::new(),
        }
    }

    fn run_created() -> Value {
        json!({ "run": { "info": {
            "run_id": "r1",
            "artifact_uri": "mlflow-artifacts:/7/r1/artifacts"
        } } })
    }

    #[tokio::test]
    async fn test_start_uses_existing_experiment() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(json!({ "experiment": { "experiment_id": "7" } }));
        transport.push_json(run_created());
        let client = MlflowClient::new("http://mlflow:5000/", transport.clone());
        let reporter = MlflowReporter::start(client, "paw pularity", &ctx(Some("abc123")))
            .await
            .unwrap();
        assert_eq!(reporter.run_id(), "r1");

        let reqs = transport.requests();
        assert_eq!(
            reqs[0].url,
            "http://mlflow:5000/api/2.0/mlflow/experiments/get-by-name?experiment_name=paw%20pularity"
        );
        assert_eq!(reqs[1].json().unwrap()["experiment_id"], "7");
        assert_eq!(reqs[2].json().unwrap()["key"], COMMIT_TAG);
        assert_eq!(reqs[2].json().unwrap()["value"], "abc123");
        assert!(transport.requests_to("experiments/create").is_empty());
    }

    #[tokio::test]
    async fn test_missing_experiment_is_created() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_response(HttpResponse {
            status: 404,
            body: r#"{"error_code":"RESOURCE_DOES_NOT_EXIST"}"#.into(),
        });
        transport.push_json(json!({ "experiment_id": "9" }));
        transport.push_json(run_created());
        let client = MlflowClient::new("http://mlflow:5000", transport.clone());
        MlflowReporter::start(client, "new", &ctx(None)).await.unwrap();

        assert_eq!(transport.requests_to("experiments/create").len(), 1);
        assert_eq!(transport.requests_to("runs/create")[0].json().unwrap()["experiment_id"], "9");
        assert!(transport.requests_to("runs/set-tag").is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_fatal() {
        let transport = Arc::new(RecordingTransport::new());
        transport.push_response(HttpResponse {
            status: 500,
            body: "boom".into(),
        });
        let client = MlflowClient::new("http://mlflow:5000", transport);
        assert!(MlflowReporter::start(client, "x", &ctx(None)).await.is_err());
    }

    #[tokio::test]
    async fn test_finish_uploads_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("oof_df.csv"), "Id,preds\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let transport = Arc::new(RecordingTransport::new());
        transport.push_json(json!({ "experiment": { "experiment_id": "7" } }));
        transport.push_json(run_created());
        let client = MlflowClient::new("http://mlflow:5000", transport.clone());
        let mut reporter = MlflowReporter::start(client, "e", &ctx(None)).await.unwrap();
        reporter
            .log_params(&[("seed".into(), "440".into()), ("n_fold".into(), "5".into())])
            .await
            .unwrap();
        reporter.log_metric("score", 17.5, 1).await.unwrap();
        reporter.finish(Some(0.63), dir.path()).await.unwrap();

        assert_eq!(transport.requests_to("runs/log-parameter").len(), 2);
        let metrics = transport.requests_to("runs/log-metric");
        assert_eq!(metrics[0].json().unwrap()["step"], 1);
        assert_eq!(metrics[1].json().unwrap()["key"], "loss");

        let uploads: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.method == Method::Put)
            .collect();
        assert_eq!(uploads.len(), 1);
        assert_eq!(
            uploads[0].url,
            "http://mlflow:5000/api/2.0/mlflow-artifacts/artifacts/7/r1/artifacts/oof_df.csv"
        );
        let update = &transport.requests_to("runs/update")[0];
        assert_eq!(update.json().unwrap()["status"], "FINISHED");
    }

    #[tokio::test]
    async fn test_delete_registered_model() {
        let transport = Arc::new(RecordingTransport::new());
        let client = MlflowClient::new("http://mlflow:5000", transport.clone());
        client.delete_registered_model("resnet18").await.unwrap();
        let reqs = transport.requests_to("registered-models/delete");
        assert_eq!(reqs[0].method, Method::Delete);
        assert_eq!(reqs[0].json().unwrap()["name"], "resnet18");
    }
}
