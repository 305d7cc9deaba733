//! The `evaluate` entry point.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use uuid::Uuid;

use crate::error::EvalError;
use crate::evaluator::{EvaluatorSpec, SummaryEvaluator};
use crate::model::{DatasetRef, Example, Payload};
use crate::observer::{PipelineObserver, TracingObserver};
use crate::pipeline::{ExperimentManager, ExperimentManagerOptions, ExperimentRef};
use crate::results::ExperimentResults;
use crate::tracer::{ClientTracer, Tracer};
use crate::traits::{Client, Target};

/// Prefix used when the caller gives none.
pub const DEFAULT_EXPERIMENT_PREFIX: &str = "experiment";

/// Where the examples come from.
pub enum DataSource {
    /// A stored dataset, by identity.
    DatasetId(Uuid),
    /// A stored dataset, by name.
    DatasetName(String),
    /// Examples already in memory.
    Examples(Vec<Example>),
    /// Any lazy source of examples.
    Stream(BoxStream<'static, Result<Example, EvalError>>),
}

impl DataSource {
    fn into_stream(self, client: &dyn Client) -> BoxStream<'static, Result<Example, EvalError>> {
        match self {
            DataSource::DatasetId(id) => list(client, DatasetRef::Id(id)),
            DataSource::DatasetName(name) => list(client, DatasetRef::Name(name)),
            DataSource::Examples(examples) => stream::iter(examples.into_iter().map(Ok)).boxed(),
            DataSource::Stream(stream) => stream,
        }
    }
}

fn list(client: &dyn Client, dataset: DatasetRef) -> BoxStream<'static, Result<Example, EvalError>> {
    client.list_examples(&dataset).map_err(EvalError::from).boxed()
}

/// Options for [`evaluate`].
pub struct EvaluateOptions {
    pub data: DataSource,
    pub evaluators: Vec<EvaluatorSpec>,
    pub summary_evaluators: Vec<Arc<dyn SummaryEvaluator>>,
    pub metadata: Payload,
    /// The experiment is named `<prefix>-<8 hex chars>`.
    pub experiment_prefix: Option<String>,
    pub description: Option<String>,
    /// Ceiling on concurrent target (and evaluator) invocations; 0 runs one
    /// at a time.
    pub max_concurrency: usize,
    pub client: Arc<dyn Client>,
    /// Defaults to a [`ClientTracer`] over `client`.
    pub tracer: Option<Arc<dyn Tracer>>,
    /// Defaults to [`TracingObserver`].
    pub observer: Option<Arc<dyn PipelineObserver>>,
    /// Wait for every row before returning.
    pub blocking: bool,
    /// Record into this stored experiment instead of creating one.
    pub existing_experiment: Option<Uuid>,
}

impl EvaluateOptions {
    pub fn new(data: DataSource, client: Arc<dyn Client>) -> Self {
        Self {
            data,
            evaluators: Vec::new(),
            summary_evaluators: Vec::new(),
            metadata: Payload::new(),
            experiment_prefix: None,
            description: None,
            max_concurrency: 0,
            client,
            tracer: None,
            observer: None,
            blocking: true,
            existing_experiment: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: impl Into<EvaluatorSpec>) -> Self {
        self.evaluators.push(evaluator.into());
        self
    }

    pub fn with_summary_evaluator(mut self, evaluator: Arc<dyn SummaryEvaluator>) -> Self {
        self.summary_evaluators.push(evaluator);
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.experiment_prefix = Some(prefix.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

/// A fresh experiment name: `<prefix>-<first 8 hex chars of a v4 uuid>`.
pub fn experiment_name(prefix: Option<&str>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix.unwrap_or(DEFAULT_EXPERIMENT_PREFIX), &id[..8])
}

/// Run `target` over the data, score it, and collect the results.
///
/// Pipeline-fatal errors (name collisions, an empty dataset, a target that
/// records no run) are returned; a failing target or evaluator only affects
/// its own row. With `blocking` unset the rows are produced in the
/// background and the returned results fill in as they complete.
pub async fn evaluate(
    target: Arc<dyn Target>,
    options: EvaluateOptions,
) -> Result<ExperimentResults, EvalError> {
    let EvaluateOptions {
        data,
        evaluators,
        summary_evaluators,
        metadata,
        experiment_prefix,
        description,
        max_concurrency,
        client,
        tracer,
        observer,
        blocking,
        existing_experiment,
    } = options;

    let experiment = match existing_experiment {
        Some(id) => ExperimentRef::Existing(client.read_project(id).await?),
        None => ExperimentRef::New(experiment_name(experiment_prefix.as_deref())),
    };
    let tracer = tracer.unwrap_or_else(|| Arc::new(ClientTracer::new(Arc::clone(&client))));
    let observer = observer.unwrap_or_else(|| Arc::new(TracingObserver));

    let manager = ExperimentManager::new(ExperimentManagerOptions {
        examples: data.into_stream(client.as_ref()),
        client,
        tracer,
        observer,
        experiment,
        metadata,
        description,
    });

    let mut manager = manager
        .start()
        .await?
        .with_predictions(target, max_concurrency)?;
    if !evaluators.is_empty() {
        manager = manager.with_evaluators(evaluators, max_concurrency)?;
    }
    if !summary_evaluators.is_empty() {
        manager = manager.with_summary_evaluators(summary_evaluators)?;
    }

    let mut results = ExperimentResults::spawn(manager);
    if blocking {
        results.wait().await?;
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_names_are_prefixed_and_unique() {
        let a = experiment_name(Some("nightly"));
        let b = experiment_name(Some("nightly"));
        assert!(a.starts_with("nightly-"));
        assert_eq!(a.len(), "nightly-".len() + 8);
        assert_ne!(a, b);
        assert!(experiment_name(None).starts_with("experiment-"));
    }
}
