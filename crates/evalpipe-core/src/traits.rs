//! Core trait definitions for the store client and the target under test.
//!
//! The store client is implemented by the `evalpipe-client` crate; targets
//! are supplied by the caller of [`evaluate`](crate::evaluate::evaluate).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ClientError;
use crate::model::{
    DatasetRef, EvaluationResult, EvaluatorOutput, Example, Experiment, Payload, Run,
};
use crate::tracer::TraceContext;

// ---------------------------------------------------------------------------
// Store client trait
// ---------------------------------------------------------------------------

/// Persistence and retrieval of datasets, experiments, runs and feedback.
#[async_trait]
pub trait Client: Send + Sync {
    /// Lazily list the examples of a dataset. Nothing is fetched until the
    /// returned stream is polled.
    fn list_examples(&self, dataset: &DatasetRef) -> BoxStream<'static, Result<Example, ClientError>>;

    /// Create an experiment. Fails with [`ClientError::Conflict`] if the
    /// name is taken.
    async fn create_project(&self, request: &CreateProjectRequest) -> Result<Experiment, ClientError>;

    /// Finalize or re-tag an experiment.
    async fn update_project(&self, id: Uuid, request: &UpdateProjectRequest) -> Result<(), ClientError>;

    /// Read an experiment by identity.
    async fn read_project(&self, id: Uuid) -> Result<Experiment, ClientError>;

    /// Persist a finished run.
    async fn create_run(&self, run: &Run) -> Result<(), ClientError>;

    /// Persist one feedback record. `run_id` is `None` for experiment-level
    /// feedback.
    async fn create_feedback(
        &self,
        run_id: Option<Uuid>,
        key: &str,
        feedback: &FeedbackCreate,
    ) -> Result<(), ClientError>;

    /// Flatten an evaluator's output and submit each result as feedback on
    /// `run` (or on the result's `target_run_id` when set).
    async fn log_evaluation_feedback(
        &self,
        output: EvaluatorOutput,
        run: &Run,
    ) -> Result<Vec<EvaluationResult>, ClientError> {
        let results = output.into_results();
        for result in &results {
            let run_id = result.target_run_id.unwrap_or(run.id);
            self.create_feedback(Some(run_id), &result.key, &FeedbackCreate::from(result))
                .await?;
        }
        Ok(results)
    }
}

/// Request to create an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reference_dataset_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Payload,
}

/// Request to update an experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<Payload>,
}

/// A feedback record as submitted to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackCreate {
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub correction: Option<Value>,
    /// Experiment the feedback belongs to (summary feedback only).
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub source_run_id: Option<Uuid>,
    #[serde(default)]
    pub source_info: Payload,
}

impl From<&EvaluationResult> for FeedbackCreate {
    fn from(result: &EvaluationResult) -> Self {
        Self {
            score: result.score,
            value: result.value.clone(),
            comment: result.comment.clone(),
            correction: result.correction.clone(),
            project_id: None,
            source_run_id: result.source_run_id,
            source_info: result.evaluator_info.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Target trait
// ---------------------------------------------------------------------------

/// The function under test.
#[async_trait]
pub trait Target: Send + Sync {
    /// Name recorded on the target's runs.
    fn name(&self) -> &str;

    /// Invoke the target on one example's inputs. `ctx` records nested runs.
    async fn invoke(&self, inputs: Payload, ctx: TraceContext) -> anyhow::Result<Value>;
}

/// A [`Target`] backed by an async closure.
pub struct FnTarget<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> Target for FnTarget<F>
where
    F: Fn(Payload, TraceContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, inputs: Payload, ctx: TraceContext) -> anyhow::Result<Value> {
        (self.func)(inputs, ctx).await
    }
}

/// Wrap an async closure as a target.
pub fn target_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn Target>
where
    F: Fn(Payload, TraceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnTarget {
        name: name.into(),
        func,
    })
}
