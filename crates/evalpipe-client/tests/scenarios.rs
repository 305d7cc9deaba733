//! End-to-end evaluations against the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use evalpipe_client::InMemoryClient;
use evalpipe_core::builtin::{ExactMatch, MeanOutputScore};
use evalpipe_core::evaluator::{summary_fn, EvaluatorSpec};
use evalpipe_core::model::{EvaluationResult, EvaluatorOutput, Example, Experiment, Payload, Run};
use evalpipe_core::observer::PipelineObserver;
use evalpipe_core::statistics::{mean, round_to, SUMMARY_PRECISION};
use evalpipe_core::traits::{target_fn, Client, CreateProjectRequest, Target};
use evalpipe_core::{evaluate, DataSource, EvalError, EvaluateOptions};

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// A dataset of `n` examples `{"i": k}` expecting `{"i": k}` back.
fn seed(client: &InMemoryClient, name: &str, n: usize) -> Uuid {
    let dataset = client.create_dataset(name, None).unwrap();
    for i in 0..n {
        client
            .create_example(dataset.id, payload(json!({ "i": i })), Some(payload(json!({ "i": i }))))
            .unwrap();
    }
    dataset.id
}

fn echo() -> Arc<dyn Target> {
    target_fn("echo", |inputs: Payload, _ctx| async move {
        Ok::<_, anyhow::Error>(Value::Object(inputs))
    })
}

fn always_correct() -> EvaluatorSpec {
    EvaluatorSpec::function("correctness", |_run: Run, _example: Option<Example>| async move {
        Ok::<_, anyhow::Error>(EvaluatorOutput::from(
            EvaluationResult::new("correctness").with_score(1.0),
        ))
    })
}

#[derive(Default)]
struct Recorder {
    evaluator_errors: Mutex<Vec<String>>,
    target_errors: Mutex<Vec<Uuid>>,
    ended: Mutex<Option<usize>>,
}

impl PipelineObserver for Recorder {
    fn on_experiment_start(&self, _: &Experiment) {}
    fn on_row_predicted(&self, _: Uuid, _: &Run) {}
    fn on_target_error(&self, example_id: Uuid, _: &str) {
        self.target_errors.lock().unwrap().push(example_id);
    }
    fn on_evaluator_error(&self, evaluator: &str, _: Option<Uuid>, _: &str) {
        self.evaluator_errors.lock().unwrap().push(evaluator.to_string());
    }
    fn on_summary_computed(&self, _: &str, _: &[EvaluationResult]) {}
    fn on_experiment_end(&self, _: &Experiment, rows: usize) {
        *self.ended.lock().unwrap() = Some(rows);
    }
}

#[tokio::test]
async fn echo_target_without_evaluators() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "echo", 3);

    let results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone()).with_prefix("echo"),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    for row in results.rows() {
        assert!(row.evaluation_results.is_empty());
        assert_eq!(row.run.outputs.as_ref(), Some(&row.example.inputs));
        assert_eq!(row.run.reference_example_id, Some(row.example.id));
    }
    assert!(results.summary_results().is_empty());

    let experiment = client.project_by_name(results.experiment_name()).unwrap();
    assert!(experiment.end_time.is_some());
    assert_eq!(experiment.reference_dataset_id, Some(dataset_id));
    assert!(experiment.metadata.contains_key("dataset_version"));
    assert_eq!(client.runs_for_project(results.experiment_name()).len(), 3);
}

#[tokio::test]
async fn constant_evaluator_scores_every_row() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "constant", 2);

    let results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_evaluator(always_correct()),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 2);
    for row in results.rows() {
        assert_eq!(row.evaluation_results.len(), 1);
        let result = row.evaluation_results.get("correctness").unwrap();
        assert_eq!(result.score, Some(1.0));
        // The evaluator's own run is linked as the feedback source.
        assert!(result.source_run_id.is_some());

        let feedback = client.feedback_for_run(row.run.id);
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].key, "correctness");
    }
}

#[tokio::test]
async fn failing_evaluator_only_affects_its_row() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "flaky", 3);
    let recorder = Arc::new(Recorder::default());

    let flaky = EvaluatorSpec::function("flaky", |run: Run, _example: Option<Example>| async move {
        if run.inputs.get("i") == Some(&json!(1)) {
            anyhow::bail!("cannot score the second example");
        }
        Ok::<_, anyhow::Error>(EvaluatorOutput::from(EvaluationResult::new("flaky").with_score(0.5)))
    });

    let results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_evaluator(flaky)
            .with_evaluator(Arc::new(ExactMatch::new()))
            .with_observer(recorder.clone()),
    )
    .await
    .unwrap();

    let rows = results.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows[1].evaluation_results.get("flaky").is_none());
    // Later evaluators still run on the failing row.
    assert_eq!(rows[1].evaluation_results.get("exact_match").unwrap().score, Some(1.0));
    for row in [&rows[0], &rows[2]] {
        assert_eq!(row.evaluation_results.get("flaky").unwrap().score, Some(0.5));
        assert_eq!(row.evaluation_results.len(), 2);
    }
    assert_eq!(*recorder.evaluator_errors.lock().unwrap(), vec!["flaky".to_string()]);
}

#[tokio::test]
async fn panicking_evaluator_only_affects_its_row() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "panicky", 3);
    let recorder = Arc::new(Recorder::default());

    let exploding = EvaluatorSpec::function("exploding", |run: Run, _example: Option<Example>| async move {
        if run.inputs.get("i") == Some(&json!(1)) {
            panic!("evaluator bug");
        }
        Ok::<_, anyhow::Error>(EvaluatorOutput::from(EvaluationResult::new("exploding").with_score(1.0)))
    });

    let results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_evaluator(exploding)
            .with_evaluator(Arc::new(ExactMatch::new()))
            .with_max_concurrency(2)
            .with_observer(recorder.clone()),
    )
    .await
    .unwrap();

    let rows = results.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows[1].evaluation_results.get("exploding").is_none());
    assert_eq!(rows[1].evaluation_results.get("exact_match").unwrap().score, Some(1.0));
    for row in [&rows[0], &rows[2]] {
        assert_eq!(row.evaluation_results.get("exploding").unwrap().score, Some(1.0));
    }
    assert_eq!(*recorder.evaluator_errors.lock().unwrap(), vec!["exploding".to_string()]);
}

#[tokio::test]
async fn panicking_summary_evaluator_is_skipped() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "summary-panic", 3);
    let recorder = Arc::new(Recorder::default());

    let bad = summary_fn(Some("bad"), |_: &[Run], _: &[Example]| -> anyhow::Result<EvaluatorOutput> {
        panic!("summary bug")
    });
    let good = summary_fn(Some("good"), |runs: &[Run], _: &[Example]| {
        Ok(EvaluatorOutput::from(
            EvaluationResult::new("row_count").with_score(runs.len() as f64),
        ))
    });

    let results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_summary_evaluator(bad)
            .with_summary_evaluator(good)
            .with_observer(recorder.clone()),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    let summary = results.summary_results();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary.get("row_count").unwrap().score, Some(3.0));
    assert_eq!(*recorder.evaluator_errors.lock().unwrap(), vec!["bad".to_string()]);
}

#[tokio::test]
async fn summary_mean_is_rounded_to_three_places() {
    let client = Arc::new(InMemoryClient::new());
    let dataset = client.create_dataset("scores", None).unwrap();
    for score in [0.0, 1.0, 1.0] {
        client
            .create_example(dataset.id, payload(json!({ "score": score })), None)
            .unwrap();
    }

    let manual = summary_fn(Some("mean_score_manual"), |runs: &[Run], _examples: &[Example]| {
        let scores: Vec<f64> = runs
            .iter()
            .filter_map(|r| r.outputs.as_ref()?.get("score")?.as_f64())
            .collect();
        let value = mean(&scores).map(|m| round_to(m, SUMMARY_PRECISION));
        let mut result = EvaluationResult::new("mean_score_manual");
        result.score = value;
        Ok(EvaluatorOutput::from(result))
    });

    let results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetName("scores".into()), client.clone())
            .with_summary_evaluator(Arc::new(MeanOutputScore::new("score")))
            .with_summary_evaluator(manual),
    )
    .await
    .unwrap();

    let summary = results.summary_results();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary.get("mean_score").unwrap().score, Some(0.667));
    assert_eq!(summary.get("mean_score_manual").unwrap().score, Some(0.667));

    // Summary feedback is attached to the experiment, not to a run.
    let experiment = client.project_by_name(results.experiment_name()).unwrap();
    let experiment_feedback: Vec<_> = client
        .feedback()
        .into_iter()
        .filter(|f| f.run_id.is_none())
        .collect();
    assert_eq!(experiment_feedback.len(), 2);
    assert!(experiment_feedback
        .iter()
        .all(|f| f.body.project_id == Some(experiment.id)));
}

#[tokio::test]
async fn dataset_by_name_and_by_id_behave_the_same() {
    let client = Arc::new(InMemoryClient::new().with_page_size(2));
    let dataset_id = seed(&client, "shared", 5);

    let by_id = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_evaluator(Arc::new(ExactMatch::new()))
            .with_max_concurrency(2),
    )
    .await
    .unwrap();
    let by_name = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetName("shared".into()), client.clone())
            .with_evaluator(Arc::new(ExactMatch::new()))
            .with_max_concurrency(2),
    )
    .await
    .unwrap();

    assert_ne!(by_id.experiment_name(), by_name.experiment_name());
    assert_eq!(by_id.len(), by_name.len());
    for (a, b) in by_id.rows().iter().zip(by_name.rows()) {
        assert_eq!(a.example.id, b.example.id);
        assert_eq!(a.run.outputs, b.run.outputs);
        assert_eq!(
            a.evaluation_results.get("exact_match").unwrap().score,
            b.evaluation_results.get("exact_match").unwrap().score
        );
    }
}

#[tokio::test]
async fn rows_keep_example_order_under_concurrency() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "ordered", 12);

    let slow_echo = target_fn("slow-echo", |inputs: Payload, _ctx| async move {
        let i = inputs.get("i").and_then(Value::as_u64).unwrap_or(0);
        // Earlier examples finish later.
        tokio::time::sleep(Duration::from_millis(24 - 2 * i)).await;
        Ok::<_, anyhow::Error>(Value::Object(inputs))
    });

    let results = evaluate(
        slow_echo,
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_max_concurrency(4),
    )
    .await
    .unwrap();

    let order: Vec<_> = results
        .rows()
        .iter()
        .map(|row| row.run.outputs.as_ref().unwrap()["i"].clone())
        .collect();
    assert_eq!(order, (0..12).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn failing_target_still_produces_a_row() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "errors", 3);
    let recorder = Arc::new(Recorder::default());

    let target = target_fn("picky", |inputs: Payload, _ctx| async move {
        if inputs.get("i") == Some(&json!(2)) {
            anyhow::bail!("refusing the last example");
        }
        Ok::<_, anyhow::Error>(Value::Object(inputs))
    });

    let results = evaluate(
        target,
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
            .with_observer(recorder.clone()),
    )
    .await
    .unwrap();

    let rows = results.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows[2].run.error.as_deref().unwrap().contains("refusing"));
    assert!(rows[2].run.outputs.is_none());
    assert_eq!(*recorder.target_errors.lock().unwrap(), vec![rows[2].example.id]);
    assert_eq!(*recorder.ended.lock().unwrap(), Some(3));
}

#[tokio::test]
async fn non_blocking_results_are_iterable() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "background", 4);

    let mut results = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone()).blocking(false),
    )
    .await
    .unwrap();

    let mut seen = 0;
    while let Some(row) = results.next().await {
        row.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 4);
    assert_eq!(results.len(), 4);
}

#[tokio::test]
async fn empty_dataset_is_rejected() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "empty", 0);

    let err = evaluate(echo(), EvaluateOptions::new(DataSource::DatasetId(dataset_id), client))
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::EmptyDataset));
}

#[tokio::test]
async fn unknown_dataset_is_a_client_error() {
    let client = Arc::new(InMemoryClient::new());
    let err = evaluate(
        echo(),
        EvaluateOptions::new(DataSource::DatasetName("missing".into()), client),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, EvalError::Client(_)));
}

#[tokio::test]
async fn existing_experiment_is_reused_and_metadata_merged() {
    let client = Arc::new(InMemoryClient::new());
    let dataset_id = seed(&client, "rerun", 2);
    let existing = client
        .create_project(&CreateProjectRequest {
            name: "baseline".into(),
            description: None,
            reference_dataset_id: Some(dataset_id),
            metadata: payload(json!({ "owner": "qa", "model": "old" })),
        })
        .await
        .unwrap();

    let mut options = EvaluateOptions::new(DataSource::DatasetId(dataset_id), client.clone())
        .with_metadata(payload(json!({ "model": "new" })));
    options.existing_experiment = Some(existing.id);
    let results = evaluate(echo(), options).await.unwrap();

    assert_eq!(results.experiment_name(), "baseline");
    assert_eq!(client.runs_for_project("baseline").len(), 2);
    let stored = client.project_by_name("baseline").unwrap();
    assert_eq!(stored.metadata["owner"], json!("qa"));
    assert_eq!(stored.metadata["model"], json!("new"));
}
