//! Evaluator contracts and the adapters that normalize evaluator shapes.
//!
//! Row evaluators come either as objects implementing [`RunEvaluator`] or as
//! plain async functions. [`wrap_evaluators`] turns both into trait objects;
//! function evaluators are wrapped in a [`DynamicRunEvaluator`] so each call
//! is recorded as its own run. Summary evaluators are wrapped the same way
//! by [`wrap_summary_evaluators`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::model::{EvaluatorOutput, Example, Payload, Run, RunType};
use crate::tracer::{TraceContext, TraceOptions, TracedCall, Tracer};

/// Project that evaluator runs are grouped under.
pub const EVALUATORS_PROJECT: &str = "evaluators";

/// Name given to summary evaluators that do not provide one.
pub const DEFAULT_SUMMARY_NAME: &str = "BatchEvaluator";

/// What an evaluator may use besides the run and example.
#[derive(Clone)]
pub struct EvaluatorContext {
    pub tracer: Arc<dyn Tracer>,
    /// Name of the experiment whose runs are being scored.
    pub experiment_name: String,
}

/// Scores one run against its example.
#[async_trait]
pub trait RunEvaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate_run(
        &self,
        run: &Run,
        example: Option<&Example>,
        ctx: &EvaluatorContext,
    ) -> anyhow::Result<EvaluatorOutput>;
}

/// A row evaluator given as a function of `(run, example)`.
pub type EvaluatorFn =
    Arc<dyn Fn(Run, Option<Example>) -> BoxFuture<'static, anyhow::Result<EvaluatorOutput>> + Send + Sync>;

/// The accepted shapes of a row evaluator.
#[derive(Clone)]
pub enum EvaluatorSpec {
    Evaluator(Arc<dyn RunEvaluator>),
    Function { name: String, func: EvaluatorFn },
}

impl EvaluatorSpec {
    /// Wrap an async function as a row evaluator.
    pub fn function<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Run, Option<Example>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<EvaluatorOutput>> + Send + 'static,
    {
        EvaluatorSpec::Function {
            name: name.into(),
            func: Arc::new(move |run, example| func(run, example).boxed()),
        }
    }
}

impl<E: RunEvaluator + 'static> From<Arc<E>> for EvaluatorSpec {
    fn from(evaluator: Arc<E>) -> Self {
        EvaluatorSpec::Evaluator(evaluator)
    }
}

/// Normalize every evaluator to the [`RunEvaluator`] contract.
pub fn wrap_evaluators(evaluators: Vec<EvaluatorSpec>) -> Vec<Arc<dyn RunEvaluator>> {
    evaluators
        .into_iter()
        .map(|spec| match spec {
            EvaluatorSpec::Evaluator(evaluator) => evaluator,
            EvaluatorSpec::Function { name, func } => {
                Arc::new(DynamicRunEvaluator { name, func }) as Arc<dyn RunEvaluator>
            }
        })
        .collect()
}

/// A function evaluator whose every invocation is traced.
///
/// Results that do not name a source run are attributed to the evaluator's
/// own run.
pub struct DynamicRunEvaluator {
    name: String,
    func: EvaluatorFn,
}

impl DynamicRunEvaluator {
    pub fn new(name: impl Into<String>, func: EvaluatorFn) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl RunEvaluator for DynamicRunEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate_run(
        &self,
        run: &Run,
        example: Option<&Example>,
        ctx: &EvaluatorContext,
    ) -> anyhow::Result<EvaluatorOutput> {
        let (tx, rx) = oneshot::channel();
        let mut metadata = Payload::new();
        metadata.insert("experiment".into(), json!(ctx.experiment_name));
        let mut options = TraceOptions::new(self.name.clone(), EVALUATORS_PROJECT)
            .with_metadata(metadata)
            .on_end(move |r| {
                let _ = tx.send(r.id);
            });
        if let Some(example) = example {
            options = options.with_reference_example(example.id);
        }

        let mut inputs = Payload::new();
        inputs.insert("run_id".into(), json!(run.id));
        inputs.insert("example_id".into(), json!(example.map(|e| e.id)));

        let func = Arc::clone(&self.func);
        let run = run.clone();
        let example = example.cloned();
        let call: TracedCall = Box::new(move |_ctx: TraceContext| {
            async move {
                let output = func(run, example).await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(output)?)
            }
            .boxed()
        });

        let value = ctx.tracer.trace(options, inputs, call).await?;
        let mut output: EvaluatorOutput = serde_json::from_value(value)?;
        if let Ok(source_run_id) = rx.await {
            stamp_source_run(&mut output, source_run_id);
        }
        Ok(output)
    }
}

/// Scores a whole experiment at once.
#[async_trait]
pub trait SummaryEvaluator: Send + Sync {
    fn name(&self) -> Option<&str> {
        None
    }

    async fn evaluate(&self, runs: &[Run], examples: &[Example]) -> anyhow::Result<EvaluatorOutput>;
}

struct FnSummaryEvaluator<F> {
    name: Option<String>,
    func: F,
}

#[async_trait]
impl<F> SummaryEvaluator for FnSummaryEvaluator<F>
where
    F: Fn(&[Run], &[Example]) -> anyhow::Result<EvaluatorOutput> + Send + Sync,
{
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn evaluate(&self, runs: &[Run], examples: &[Example]) -> anyhow::Result<EvaluatorOutput> {
        (self.func)(runs, examples)
    }
}

/// Wrap a function of the full run and example lists as a summary evaluator.
pub fn summary_fn<F>(name: Option<&str>, func: F) -> Arc<dyn SummaryEvaluator>
where
    F: Fn(&[Run], &[Example]) -> anyhow::Result<EvaluatorOutput> + Send + Sync + 'static,
{
    Arc::new(FnSummaryEvaluator {
        name: name.map(str::to_string),
        func,
    })
}

/// A summary evaluator whose invocation is recorded as one run.
pub struct TracedSummaryEvaluator {
    inner: Arc<dyn SummaryEvaluator>,
    tracer: Arc<dyn Tracer>,
}

impl TracedSummaryEvaluator {
    pub fn new(inner: Arc<dyn SummaryEvaluator>, tracer: Arc<dyn Tracer>) -> Self {
        Self { inner, tracer }
    }

    pub fn name(&self) -> &str {
        self.inner.name().unwrap_or(DEFAULT_SUMMARY_NAME)
    }

    /// Run the evaluator over the complete lists. The recorded inputs are
    /// counts, not the payloads themselves.
    pub async fn evaluate(
        &self,
        runs: Arc<Vec<Run>>,
        examples: Arc<Vec<Example>>,
    ) -> anyhow::Result<EvaluatorOutput> {
        let (tx, rx) = oneshot::channel();
        let options = TraceOptions::new(self.name(), EVALUATORS_PROJECT)
            .with_run_type(RunType::Chain)
            .on_end(move |r| {
                let _ = tx.send(r.id);
            });

        let mut inputs = Payload::new();
        inputs.insert("runs".into(), Value::String(format!("<{} runs>", runs.len())));
        inputs.insert("examples".into(), Value::String(format!("<{} examples>", examples.len())));

        let inner = Arc::clone(&self.inner);
        let call: TracedCall = Box::new(move |_ctx: TraceContext| {
            async move {
                let output = inner.evaluate(&runs, &examples).await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(output)?)
            }
            .boxed()
        });

        let value = self.tracer.trace(options, inputs, call).await?;
        let mut output: EvaluatorOutput = serde_json::from_value(value)?;
        if let Ok(source_run_id) = rx.await {
            stamp_source_run(&mut output, source_run_id);
        }
        Ok(output)
    }
}

/// Wrap each summary evaluator so its invocation is traced.
pub fn wrap_summary_evaluators(
    evaluators: Vec<Arc<dyn SummaryEvaluator>>,
    tracer: &Arc<dyn Tracer>,
) -> Vec<TracedSummaryEvaluator> {
    evaluators
        .into_iter()
        .map(|inner| TracedSummaryEvaluator::new(inner, Arc::clone(tracer)))
        .collect()
}

fn stamp_source_run(output: &mut EvaluatorOutput, source_run_id: Uuid) {
    let results = match output {
        EvaluatorOutput::Batch(batch) => batch.results.iter_mut().collect::<Vec<_>>(),
        EvaluatorOutput::Single(result) => vec![result],
    };
    for result in results {
        result.source_run_id.get_or_insert(source_run_id);
    }
}
