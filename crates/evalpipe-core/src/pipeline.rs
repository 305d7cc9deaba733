//! The experiment pipeline manager.
//!
//! An [`ExperimentManager`] is an immutable snapshot of one evaluation pass.
//! Each stage transition returns a new snapshot carrying forward whatever has
//! been computed so far:
//!
//! ```text
//! Unstarted ─start()─► Started ─with_predictions()─► Predicted
//!                                                      │
//!                       with_evaluators() ◄────────────┤
//!                              │                       │
//!                              ▼                       ▼
//!                           Scored ─with_summary_evaluators()─► Summarized
//! ```
//!
//! Nothing executes until a stream is pulled. Every stage reads its inputs
//! through fresh forks of the shared sources, so the example source is read
//! once no matter how many stages (or snapshots) consume it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{self, FutureExt};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::caller::{catch_panic, AsyncCaller};
use crate::env;
use crate::error::EvalError;
use crate::evaluator::{
    wrap_evaluators, wrap_summary_evaluators, EvaluatorContext, EvaluatorSpec, RunEvaluator,
    SummaryEvaluator, TracedSummaryEvaluator,
};
use crate::model::{
    EvaluationResult, EvaluationResults, Example, ExperimentResultRow, Experiment, Payload, Run,
};
use crate::observer::PipelineObserver;
use crate::tee::{fuse_on_err, TeeStream};
use crate::tracer::{TraceContext, TraceOptions, TracedCall, Tracer};
use crate::traits::{Client, CreateProjectRequest, FeedbackCreate, Target, UpdateProjectRequest};

/// Forkable sources held by a snapshot.
pub type ExampleSource = TeeStream<Result<Example, EvalError>>;
pub type RunSource = TeeStream<Result<Run, EvalError>>;
pub type ResultsSource = TeeStream<Result<EvaluationResults, EvalError>>;

/// Where a pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Unstarted,
    Started,
    Predicted,
    Scored,
    Summarized,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Unstarted => "unstarted",
            PipelineStage::Started => "started",
            PipelineStage::Predicted => "predicted",
            PipelineStage::Scored => "scored",
            PipelineStage::Summarized => "summarized",
        };
        f.write_str(s)
    }
}

/// The experiment a pipeline records into.
#[derive(Debug, Clone)]
pub enum ExperimentRef {
    /// Create a new experiment with this name on `start()`.
    New(String),
    /// Append to an experiment that already exists in the store.
    Existing(Experiment),
}

/// Everything an [`ExperimentManager`] is built from.
pub struct ExperimentManagerOptions {
    pub client: Arc<dyn Client>,
    pub tracer: Arc<dyn Tracer>,
    pub observer: Arc<dyn PipelineObserver>,
    /// The single-pass example source.
    pub examples: BoxStream<'static, Result<Example, EvalError>>,
    pub experiment: ExperimentRef,
    /// Caller metadata; wins over git and stored experiment metadata.
    pub metadata: Payload,
    pub description: Option<String>,
}

/// One snapshot of an evaluation pass.
///
/// Every snapshot keeps an unadvanced fork of each source so later stages
/// can replay from the first row. Buffered rows are therefore released only
/// when every snapshot sharing them is dropped: memory grows with the
/// number of examples consumed, not with the lag between stages.
#[derive(Clone)]
pub struct ExperimentManager {
    client: Arc<dyn Client>,
    tracer: Arc<dyn Tracer>,
    observer: Arc<dyn PipelineObserver>,
    experiment_name: String,
    experiment: Option<Arc<Experiment>>,
    metadata: Payload,
    description: Option<String>,
    stage: PipelineStage,
    examples: ExampleSource,
    runs: Option<RunSource>,
    evaluation_results: Option<ResultsSource>,
    summary_results: Option<ResultsSource>,
}

impl ExperimentManager {
    pub fn new(options: ExperimentManagerOptions) -> Self {
        let (experiment_name, experiment) = match options.experiment {
            ExperimentRef::New(name) => (name, None),
            ExperimentRef::Existing(experiment) => (experiment.name.clone(), Some(Arc::new(experiment))),
        };
        Self {
            client: options.client,
            tracer: options.tracer,
            observer: options.observer,
            experiment_name,
            experiment,
            metadata: options.metadata,
            description: options.description,
            stage: PipelineStage::Unstarted,
            examples: TeeStream::new(fuse_on_err(options.examples)),
            runs: None,
            evaluation_results: None,
            summary_results: None,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// The backing experiment. Fails before `start()`.
    pub fn experiment(&self) -> Result<&Experiment, EvalError> {
        match (&self.experiment, self.stage) {
            (Some(experiment), stage) if stage > PipelineStage::Unstarted => Ok(experiment),
            _ => Err(EvalError::ExperimentNotStarted),
        }
    }

    /// Metadata the experiment was (or will be) recorded with.
    pub fn metadata(&self) -> &Payload {
        &self.metadata
    }

    /// A fresh view of the examples from the first row.
    pub fn get_examples(&self) -> ExampleSource {
        self.examples.fork()
    }

    /// A fresh view of the runs from the first row.
    pub fn runs(&self) -> Result<RunSource, EvalError> {
        self.runs
            .as_ref()
            .map(TeeStream::fork)
            .ok_or(EvalError::RunsNotAvailable)
    }

    /// Resolve or create the backing experiment.
    ///
    /// A new experiment takes its dataset from the first example, which is
    /// read through a throwaway fork so downstream stages still see it.
    pub async fn start(&self) -> Result<Self, EvalError> {
        if self.stage > PipelineStage::Unstarted {
            return Ok(self.clone());
        }

        let mut metadata = self
            .experiment
            .as_ref()
            .map(|e| e.metadata.clone())
            .unwrap_or_default();
        if let Some(git) = env::git_info().await {
            metadata.insert("git".into(), Value::Object(git.to_payload()));
        }
        metadata.extend(self.metadata.clone());

        let experiment = match &self.experiment {
            Some(existing) => Arc::clone(existing),
            None => {
                let first = self.first_example().await?;
                let request = CreateProjectRequest {
                    name: self.experiment_name.clone(),
                    description: self.description.clone(),
                    reference_dataset_id: Some(first.dataset_id),
                    metadata: metadata.clone(),
                };
                let created = self.client.create_project(&request).await.map_err(|e| {
                    if e.is_conflict() {
                        EvalError::ExperimentExists {
                            name: self.experiment_name.clone(),
                        }
                    } else {
                        EvalError::Client(e)
                    }
                })?;
                Arc::new(created)
            }
        };

        self.observer.on_experiment_start(&experiment);
        Ok(Self {
            experiment: Some(experiment),
            metadata,
            stage: PipelineStage::Started,
            ..self.clone()
        })
    }

    async fn first_example(&self) -> Result<Example, EvalError> {
        let mut peek = self.examples.fork();
        match peek.next().await {
            Some(example) => example,
            None => Err(EvalError::EmptyDataset),
        }
    }

    /// Run `target` over every example. The experiment is finalized once the
    /// example source is exhausted.
    pub fn with_predictions(
        &self,
        target: Arc<dyn Target>,
        max_concurrency: usize,
    ) -> Result<Self, EvalError> {
        let experiment = Arc::new(self.experiment()?.clone());
        let caller = AsyncCaller::new(max_concurrency);
        let window = caller.window();
        let progress = Arc::new(Mutex::new(Progress::default()));

        let predictions = {
            let progress = Arc::clone(&progress);
            let tracer = Arc::clone(&self.tracer);
            let observer = Arc::clone(&self.observer);
            let project = self.experiment_name.clone();
            self.examples
                .fork()
                .map(move |item| {
                    if let Ok(example) = &item {
                        lock(&progress).observe(example);
                    }
                    let tracer = Arc::clone(&tracer);
                    let observer = Arc::clone(&observer);
                    let target = Arc::clone(&target);
                    let project = project.clone();
                    caller.call(async move {
                        predict_one(tracer, observer, target, project, item?).await
                    })
                })
                .buffered(window)
                .map(|joined| joined.and_then(|run| run))
        };

        let finalization = {
            let client = Arc::clone(&self.client);
            let observer = Arc::clone(&self.observer);
            let metadata = self.metadata.clone();
            stream::once(finalize(client, observer, experiment, metadata, progress))
                .filter_map(|()| future::ready(None::<Result<Run, EvalError>>))
        };

        Ok(Self {
            stage: PipelineStage::Predicted,
            runs: Some(TeeStream::new(fuse_on_err(predictions.chain(finalization)))),
            evaluation_results: None,
            summary_results: None,
            ..self.clone()
        })
    }

    /// Score every row with each evaluator, appending to any results from an
    /// earlier scoring pass. An evaluator that fails or panics contributes
    /// nothing to that row; results whose feedback could not be stored are
    /// kept.
    pub fn with_evaluators(
        &self,
        evaluators: Vec<EvaluatorSpec>,
        max_concurrency: usize,
    ) -> Result<Self, EvalError> {
        let rows = self.get_results()?;
        let evaluators: Arc<[Arc<dyn RunEvaluator>]> = wrap_evaluators(evaluators).into();
        let caller = AsyncCaller::new(max_concurrency);
        let window = caller.window();
        let ctx = EvaluatorContext {
            tracer: Arc::clone(&self.tracer),
            experiment_name: self.experiment_name.clone(),
        };

        let scored = {
            let client = Arc::clone(&self.client);
            let observer = Arc::clone(&self.observer);
            rows.map(move |row| {
                // Kept so a crashed scoring task still yields the row.
                let fallback = row
                    .as_ref()
                    .ok()
                    .map(|r| (r.run.id, r.evaluation_results.clone()));
                let handle = {
                    let client = Arc::clone(&client);
                    let observer = Arc::clone(&observer);
                    let evaluators = Arc::clone(&evaluators);
                    let ctx = ctx.clone();
                    caller.call(async move {
                        Ok::<_, EvalError>(score_row(client, observer, &evaluators, &ctx, row?).await)
                    })
                };
                let observer = Arc::clone(&observer);
                async move {
                    match (handle.await, fallback) {
                        (Ok(scored), _) => scored,
                        (Err(EvalError::Task(e)), Some((run_id, results))) => {
                            observer.on_evaluator_error("row evaluators", Some(run_id), &e);
                            Ok(results)
                        }
                        (Err(e), _) => Err(e),
                    }
                }
            })
            .buffered(window)
        };

        Ok(Self {
            stage: PipelineStage::Scored,
            evaluation_results: Some(TeeStream::new(fuse_on_err(scored))),
            summary_results: None,
            ..self.clone()
        })
    }

    /// Evaluate the whole experiment with each summary evaluator and submit
    /// the results as experiment-level feedback.
    pub fn with_summary_evaluators(
        &self,
        evaluators: Vec<Arc<dyn SummaryEvaluator>>,
    ) -> Result<Self, EvalError> {
        let rows = self.get_results()?;
        let experiment_id = self.experiment()?.id;
        let evaluators = wrap_summary_evaluators(evaluators, &self.tracer);
        let client = Arc::clone(&self.client);
        let observer = Arc::clone(&self.observer);

        let summary = async move {
            let rows: Vec<ExperimentResultRow> = rows.try_collect().await?;
            let (runs, examples): (Vec<Run>, Vec<Example>) =
                rows.into_iter().map(|row| (row.run, row.example)).unzip();
            let (runs, examples) = (Arc::new(runs), Arc::new(examples));

            let mut bundle = EvaluationResults::default();
            for evaluator in &evaluators {
                let results = run_summary_evaluator(
                    evaluator,
                    &client,
                    &observer,
                    experiment_id,
                    Arc::clone(&runs),
                    Arc::clone(&examples),
                )
                .await;
                bundle.extend(results);
            }
            Ok::<_, EvalError>(bundle)
        };

        Ok(Self {
            stage: PipelineStage::Summarized,
            summary_results: Some(TeeStream::new(summary.into_stream())),
            ..self.clone()
        })
    }

    /// Stream `{run, example, evaluation_results}` rows in example order.
    ///
    /// Reads fresh forks of every source, so it can be called any number of
    /// times. Rows have an empty bundle if no evaluators were applied.
    pub fn get_results(&self) -> Result<BoxStream<'static, Result<ExperimentResultRow, EvalError>>, EvalError> {
        let lockstep = Lockstep {
            examples: self.examples.fork(),
            runs: self.runs()?,
            evaluation_results: self.evaluation_results.as_ref().map(TeeStream::fork),
            index: 0,
            done: false,
        };
        Ok(stream::unfold(lockstep, |mut state| async move {
            let row = state.next_row().await?;
            Some((row, state))
        })
        .boxed())
    }

    /// All summary results, or an empty bundle if no summary evaluators were
    /// applied.
    pub async fn get_summary_scores(&self) -> Result<EvaluationResults, EvalError> {
        let Some(summary) = &self.summary_results else {
            return Ok(EvaluationResults::default());
        };
        let mut scores = EvaluationResults::default();
        let mut summary = summary.fork();
        while let Some(bundle) = summary.next().await {
            scores.extend(bundle?.results);
        }
        Ok(scores)
    }
}

#[derive(Default)]
struct Progress {
    rows: usize,
    dataset_version: Option<DateTime<Utc>>,
}

impl Progress {
    fn observe(&mut self, example: &Example) {
        self.rows += 1;
        let version = example.version();
        if self.dataset_version.map_or(true, |v| version > v) {
            self.dataset_version = Some(version);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn predict_one(
    tracer: Arc<dyn Tracer>,
    observer: Arc<dyn PipelineObserver>,
    target: Arc<dyn Target>,
    project: String,
    example: Example,
) -> Result<Run, EvalError> {
    let (tx, rx) = oneshot::channel();
    let mut metadata = Payload::new();
    metadata.insert("example_version".into(), json!(example.version().to_rfc3339()));
    let options = TraceOptions::new(target.name(), project)
        .with_reference_example(example.id)
        .with_metadata(metadata)
        .on_end(move |run| {
            let _ = tx.send(run.clone());
        });

    let inputs = example.inputs.clone();
    let call: TracedCall = {
        let inputs = inputs.clone();
        Box::new(move |ctx: TraceContext| async move { target.invoke(inputs, ctx).await }.boxed())
    };
    if let Err(e) = tracer.trace(options, inputs, call).await {
        observer.on_target_error(example.id, &format!("{e:#}"));
    }

    let run = rx.await.map_err(|_| EvalError::MissingRun {
        example_id: example.id,
    })?;
    observer.on_row_predicted(example.id, &run);
    Ok(run)
}

async fn finalize(
    client: Arc<dyn Client>,
    observer: Arc<dyn PipelineObserver>,
    experiment: Arc<Experiment>,
    mut metadata: Payload,
    progress: Arc<Mutex<Progress>>,
) {
    let (rows, dataset_version) = {
        let progress = lock(&progress);
        (progress.rows, progress.dataset_version)
    };
    if let Some(version) = dataset_version {
        metadata.insert("dataset_version".into(), json!(version.to_rfc3339()));
    }
    let request = UpdateProjectRequest {
        end_time: Some(Utc::now()),
        metadata: Some(metadata),
    };
    match client.update_project(experiment.id, &request).await {
        Ok(()) => observer.on_experiment_end(&experiment, rows),
        Err(e) => tracing::error!(experiment = %experiment.name, "failed to finalize experiment: {e}"),
    }
}

async fn score_row(
    client: Arc<dyn Client>,
    observer: Arc<dyn PipelineObserver>,
    evaluators: &[Arc<dyn RunEvaluator>],
    ctx: &EvaluatorContext,
    row: ExperimentResultRow,
) -> EvaluationResults {
    let ExperimentResultRow {
        run,
        example,
        mut evaluation_results,
    } = row;
    for evaluator in evaluators {
        let output = match catch_panic(evaluator.evaluate_run(&run, Some(&example), ctx)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                observer.on_evaluator_error(evaluator.name(), Some(run.id), &format!("{e:#}"));
                continue;
            }
            Err(panic) => {
                observer.on_evaluator_error(evaluator.name(), Some(run.id), &format!("panicked: {panic}"));
                continue;
            }
        };
        let results = output.clone().into_results();
        if let Err(e) = client.log_evaluation_feedback(output, &run).await {
            observer.on_evaluator_error(evaluator.name(), Some(run.id), &format!("feedback not stored: {e}"));
        }
        evaluation_results.extend(results);
    }
    evaluation_results
}

async fn run_summary_evaluator(
    evaluator: &TracedSummaryEvaluator,
    client: &Arc<dyn Client>,
    observer: &Arc<dyn PipelineObserver>,
    experiment_id: Uuid,
    runs: Arc<Vec<Run>>,
    examples: Arc<Vec<Example>>,
) -> Vec<EvaluationResult> {
    let results = match catch_panic(evaluator.evaluate(runs, examples)).await {
        Ok(Ok(output)) => output.into_results(),
        Ok(Err(e)) => {
            observer.on_evaluator_error(evaluator.name(), None, &format!("{e:#}"));
            return Vec::new();
        }
        Err(panic) => {
            observer.on_evaluator_error(evaluator.name(), None, &format!("panicked: {panic}"));
            return Vec::new();
        }
    };

    for result in &results {
        let feedback = FeedbackCreate {
            project_id: Some(experiment_id),
            ..FeedbackCreate::from(result)
        };
        if let Err(e) = client.create_feedback(None, &result.key, &feedback).await {
            tracing::warn!(key = %result.key, "failed to submit summary feedback: {e}");
        }
    }
    observer.on_summary_computed(evaluator.name(), &results);
    results
}

/// Pulls one element from each source per row.
struct Lockstep {
    examples: ExampleSource,
    runs: RunSource,
    evaluation_results: Option<ResultsSource>,
    index: usize,
    done: bool,
}

impl Lockstep {
    async fn next_row(&mut self) -> Option<Result<ExperimentResultRow, EvalError>> {
        if self.done {
            return None;
        }
        let row = self.pull().await;
        self.done = !matches!(row, Some(Ok(_)));
        self.index += 1;
        row
    }

    async fn pull(&mut self) -> Option<Result<ExperimentResultRow, EvalError>> {
        let index = self.index;
        let example = self.examples.next().await;
        let run = self.runs.next().await;
        let results = match &mut self.evaluation_results {
            Some(source) => source.next().await,
            None => run.as_ref().map(|_| Ok(EvaluationResults::default())),
        };

        let (example, run, evaluation_results) = match (example, run, results) {
            (None, None, None) => return None,
            (Some(example), Some(run), Some(results)) => (example, run, results),
            _ => {
                tracing::debug!(index, "sources ended at different rows");
                return Some(Err(EvalError::Misaligned { index }));
            }
        };
        Some(join_row(index, example, run, evaluation_results))
    }
}

fn join_row(
    index: usize,
    example: Result<Example, EvalError>,
    run: Result<Run, EvalError>,
    evaluation_results: Result<EvaluationResults, EvalError>,
) -> Result<ExperimentResultRow, EvalError> {
    let (example, run) = (example?, run?);
    if run.reference_example_id.is_some_and(|id| id != example.id) {
        return Err(EvalError::Misaligned { index });
    }
    Ok(ExperimentResultRow {
        run,
        example,
        evaluation_results: evaluation_results?,
    })
}
