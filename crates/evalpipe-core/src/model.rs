//! Core data model types for evalpipe.
//!
//! Examples come from a dataset, runs record executions of the target (or
//! of an evaluator), and evaluation results score runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A JSON object payload (inputs, outputs, metadata).
pub type Payload = Map<String, Value>;

/// One labeled input from a dataset. Immutable once read from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: Uuid,
    /// The dataset this example belongs to.
    pub dataset_id: Uuid,
    /// Input payload handed to the target.
    pub inputs: Payload,
    /// Expected outputs, if the dataset is labeled.
    #[serde(default)]
    pub outputs: Option<Payload>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Example {
    /// The timestamp identifying this revision of the example: the
    /// modification time, or the creation time if never modified.
    pub fn version(&self) -> DateTime<Utc> {
        self.modified_at.unwrap_or(self.created_at)
    }
}

/// The kind of execution a run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Llm,
    Chain,
    Tool,
    Retriever,
    Embedding,
    Prompt,
    Parser,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunType::Llm => "llm",
            RunType::Chain => "chain",
            RunType::Tool => "tool",
            RunType::Retriever => "retriever",
            RunType::Embedding => "embedding",
            RunType::Prompt => "prompt",
            RunType::Parser => "parser",
        };
        f.write_str(s)
    }
}

/// A completed execution trace. Produced by [`RunTree::end`](crate::run_tree::RunTree::end)
/// and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    pub run_type: RunType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub inputs: Payload,
    #[serde(default)]
    pub outputs: Option<Payload>,
    /// Error text if the execution failed.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub child_runs: Vec<Run>,
    #[serde(default)]
    pub parent_run_id: Option<Uuid>,
    /// The example this run was executed against.
    #[serde(default)]
    pub reference_example_id: Option<Uuid>,
    /// Name of the experiment (project) the run is grouped under.
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub metadata: Payload,
    pub execution_order: u32,
}

/// One named score attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Feedback key (e.g. "correctness").
    pub key: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub correction: Option<Value>,
    /// Information about the evaluator that produced this result.
    #[serde(default)]
    pub evaluator_info: Payload,
    /// The run recording the evaluator's own execution.
    #[serde(default)]
    pub source_run_id: Option<Uuid>,
    /// A sub-run of the evaluated run this result should be attached to.
    #[serde(default)]
    pub target_run_id: Option<Uuid>,
}

impl EvaluationResult {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            score: None,
            value: None,
            comment: None,
            correction: None,
            evaluator_info: Payload::new(),
            source_run_id: None,
            target_run_id: None,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A bundle of evaluation results for one row (or one summary pass).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub results: Vec<EvaluationResult>,
}

impl EvaluationResults {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EvaluationResult> {
        self.results.iter()
    }

    /// Returns the first result with the given key.
    pub fn get(&self, key: &str) -> Option<&EvaluationResult> {
        self.results.iter().find(|r| r.key == key)
    }
}

impl Extend<EvaluationResult> for EvaluationResults {
    fn extend<I: IntoIterator<Item = EvaluationResult>>(&mut self, iter: I) {
        self.results.extend(iter);
    }
}

impl From<Vec<EvaluationResult>> for EvaluationResults {
    fn from(results: Vec<EvaluationResult>) -> Self {
        Self { results }
    }
}

/// What an evaluator returns: a single result or a batch of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluatorOutput {
    Batch(EvaluationResults),
    Single(EvaluationResult),
}

impl EvaluatorOutput {
    /// Flatten into individual results.
    pub fn into_results(self) -> Vec<EvaluationResult> {
        match self {
            EvaluatorOutput::Batch(batch) => batch.results,
            EvaluatorOutput::Single(result) => vec![result],
        }
    }
}

impl From<EvaluationResult> for EvaluatorOutput {
    fn from(result: EvaluationResult) -> Self {
        EvaluatorOutput::Single(result)
    }
}

impl From<EvaluationResults> for EvaluatorOutput {
    fn from(results: EvaluationResults) -> Self {
        EvaluatorOutput::Batch(results)
    }
}

impl From<Vec<EvaluationResult>> for EvaluatorOutput {
    fn from(results: Vec<EvaluationResult>) -> Self {
        EvaluatorOutput::Batch(results.into())
    }
}

/// One example joined with its run and evaluation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResultRow {
    pub run: Run,
    pub example: Example,
    pub evaluation_results: EvaluationResults,
}

/// The named container all runs of one evaluation pass are grouped under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// The dataset this experiment was run against.
    #[serde(default)]
    pub reference_dataset_id: Option<Uuid>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Payload,
}

/// How to find a dataset in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetRef {
    Id(Uuid),
    Name(String),
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetRef::Id(id) => write!(f, "dataset {id}"),
            DatasetRef::Name(name) => write!(f, "dataset '{name}'"),
        }
    }
}
