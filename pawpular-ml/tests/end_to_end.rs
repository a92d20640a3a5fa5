//! Full training run against CSV inputs on disk with tracking and Slack
//! going through a recording transport.

use std::path::Path;
use std::sync::Arc;

use pawpular_core::http::RecordingTransport;
use pawpular_core::{RunConfig, SlackNotifier};
use pawpular_ml::tracking::local::{METRICS_FILE, MetricRecord};
use pawpular_ml::training::runner::{OOF_FILE, SUMMARY_FILE};
use pawpular_ml::{
    RunContext, Table, TrainingRun, factory_for, load_inputs, setup_reporters,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn write_inputs(dir: &Path, n_train: usize, n_test: usize) {
    let mut train = String::from("Id,Eyes,Face,Pawpularity\n");
    for i in 0..n_train {
        let eyes = i % 2;
        let face = (i / 2) % 2;
        let target = 20 + 25 * eyes + 15 * face + (i % 7);
        train.push_str(&format!("t{i:03},{eyes},{face},{target}\n"));
    }
    std::fs::write(dir.join("train.csv"), train).unwrap();

    let mut test = String::from("Id,Eyes,Face\n");
    let mut sub = String::from("Id,Pawpularity\n");
    for i in 0..n_test {
        test.push_str(&format!("s{i},{},{}\n", i % 2, (i + 1) % 2));
        sub.push_str(&format!("s{i},0\n"));
    }
    std::fs::write(dir.join("test.csv"), test).unwrap();
    std::fs::write(dir.join("sample_submission.csv"), sub).unwrap();
}

fn config(root: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.settings.dirs.input = root.join("input");
    config.settings.dirs.output = root.join("output");
    config.params.n_fold = 3;
    config.params.epoch = 3;
    config.params.batch_size = 8;
    config.params.feature_columns = vec!["Eyes".into(), "Face".into()];
    config
}

#[tokio::test]
async fn train_run_produces_oof_submission_and_tracking() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("input")).unwrap();
    write_inputs(&root.path().join("input"), 60, 4);

    let mut config = config(root.path());
    config.mlflow.enabled = true;
    let run_dir = root.path().join("output").join("run");

    let transport = Arc::new(RecordingTransport::new());
    transport.push_json(json!({ "experiment": { "experiment_id": "1" } }));
    transport.push_json(json!({ "run": { "info": {
        "run_id": "abc", "artifact_uri": "mlflow-artifacts:/1/abc/artifacts"
    } } }));

    let ctx = RunContext {
        run_name: "run".into(),
        commit: Some("0123abc".into()),
        job_type: "training".into(),
        config: Vec::new(),
    };
    let reporters = setup_reporters(&config, &run_dir, transport.clone(), &ctx)
        .await
        .unwrap();
    assert_eq!(reporters.names(), vec!["local", "mlflow"]);

    let notifier = SlackNotifier::new(transport.clone(), Some("https://hooks.slack/x".into()));
    let inputs = load_inputs(&config).unwrap();
    let factory = factory_for(&config.params.model_name).unwrap();
    let summary = TrainingRun::new(config.clone(), run_dir.clone(), factory)
        .with_reporters(reporters)
        .with_notifier(notifier)
        .with_commit(ctx.commit.clone())
        .run(inputs)
        .await
        .unwrap();

    // OOF covers every training row once.
    let oof = Table::read_csv(&run_dir.join(OOF_FILE)).unwrap();
    assert_eq!(oof.len(), 60);
    let mut ids = oof.unique_ids("Id").unwrap();
    ids.sort();
    let expected: Vec<String> = (0..60).map(|i| format!("t{i:03}")).collect();
    assert_eq!(ids, expected);

    // Submission is filled in template order with scaled predictions.
    let sub = Table::read_csv(summary.submission_path.as_ref().unwrap()).unwrap();
    assert_eq!(sub.column("Id").unwrap(), vec!["s0", "s1", "s2", "s3"]);
    assert!(
        sub.f64_column("Pawpularity")
            .unwrap()
            .iter()
            .all(|p| (0.0..=100.0).contains(p))
    );

    // Scores reported per fold and for the CV, loss at finish.
    let local = std::fs::read_to_string(run_dir.join(METRICS_FILE)).unwrap();
    let records: Vec<MetricRecord> = local
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let score_steps: Vec<usize> = records
        .iter()
        .filter_map(|r| match r {
            MetricRecord::Metric { key, step, .. } if key == "score" => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(score_steps, vec![0, 1, 2, 3]);
    assert!(matches!(records.last(), Some(MetricRecord::Finish { .. })));
    assert!(records.iter().any(|r| matches!(
        r,
        MetricRecord::Param { key, value } if key == "seed" && value == "440"
    )));

    assert_eq!(transport.requests_to("runs/log-metric").len(), 5);
    assert_eq!(transport.requests_to("runs/update").len(), 1);
    let tag = &transport.requests_to("runs/set-tag")[0];
    assert_eq!(tag.json().unwrap()["value"], "0123abc");

    let slack = transport.requests_to("hooks.slack/x");
    assert_eq!(slack.len(), 1);
    let text = slack[0].json().unwrap()["text"].as_str().unwrap().to_string();
    assert_eq!(
        text,
        format!(
            "score: {:.5}, loss: {:.5}, model: linear/metadata",
            summary.score, summary.loss
        )
    );

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).unwrap())
            .unwrap();
    assert_eq!(saved["folds"].as_array().unwrap().len(), 3);
    assert_eq!(saved["environment"]["git_hash"], "0123abc");
}

#[tokio::test]
async fn slack_failure_does_not_fail_the_run() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("input")).unwrap();
    write_inputs(&root.path().join("input"), 30, 2);
    let config = config(root.path());

    let transport = Arc::new(RecordingTransport::new());
    transport.push_failure("connection refused");
    let notifier = SlackNotifier::new(transport.clone(), Some("https://hooks.slack/x".into()));

    let summary = TrainingRun::new(
        config.clone(),
        root.path().join("out"),
        factory_for("linear/metadata").unwrap(),
    )
    .with_notifier(notifier)
    .run(load_inputs(&config).unwrap())
    .await
    .unwrap();

    assert!(summary.score.is_finite());
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn same_seed_gives_same_run() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("input")).unwrap();
    write_inputs(&root.path().join("input"), 30, 2);
    let config = config(root.path());

    let mut scores = Vec::new();
    for name in ["a", "b"] {
        let summary = TrainingRun::new(
            config.clone(),
            root.path().join(name),
            factory_for("linear/metadata").unwrap(),
        )
        .run(load_inputs(&config).unwrap())
        .await
        .unwrap();
        scores.push(summary.folds.iter().map(|f| f.score).collect::<Vec<_>>());
    }
    assert_eq!(scores[0], scores[1]);
}
