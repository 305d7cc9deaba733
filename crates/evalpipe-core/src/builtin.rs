//! Built-in evaluators.

use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::evaluator::{EvaluatorContext, RunEvaluator, SummaryEvaluator};
use crate::model::{EvaluationResult, EvaluatorOutput, Example, Payload, Run};
use crate::statistics::{mean, round_to, SUMMARY_PRECISION};

/// Scores 1 when the run's outputs equal the example's expected outputs.
///
/// With a field set, only that field is compared.
#[derive(Debug, Clone, Default)]
pub struct ExactMatch {
    field: Option<String>,
}

impl ExactMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_field(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
        }
    }

    fn matches(&self, run: &Run, example: &Example) -> anyhow::Result<bool> {
        let expected = example
            .outputs
            .as_ref()
            .with_context(|| format!("example {} has no reference outputs", example.id))?;
        let empty = Payload::new();
        let actual = run.outputs.as_ref().unwrap_or(&empty);
        Ok(match &self.field {
            Some(field) => actual.get(field) == expected.get(field),
            None => actual == expected,
        })
    }
}

#[async_trait]
impl RunEvaluator for ExactMatch {
    fn name(&self) -> &str {
        "exact_match"
    }

    async fn evaluate_run(
        &self,
        run: &Run,
        example: Option<&Example>,
        _ctx: &EvaluatorContext,
    ) -> anyhow::Result<EvaluatorOutput> {
        let Some(example) = example else {
            bail!("exact_match requires the reference example");
        };
        let score = if self.matches(run, example)? { 1.0 } else { 0.0 };
        Ok(EvaluationResult::new("exact_match").with_score(score).into())
    }
}

/// Fraction of runs whose outputs equal their example's expected outputs.
#[derive(Debug, Clone, Default)]
pub struct ExactMatchRate {
    inner: ExactMatch,
}

impl ExactMatchRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_field(field: impl Into<String>) -> Self {
        Self {
            inner: ExactMatch::on_field(field),
        }
    }
}

#[async_trait]
impl SummaryEvaluator for ExactMatchRate {
    fn name(&self) -> Option<&str> {
        Some("exact_match_rate")
    }

    async fn evaluate(&self, runs: &[Run], examples: &[Example]) -> anyhow::Result<EvaluatorOutput> {
        let by_id: HashMap<Uuid, &Example> = examples.iter().map(|e| (e.id, e)).collect();
        let mut scores = Vec::with_capacity(runs.len());
        for run in runs {
            let example = run
                .reference_example_id
                .and_then(|id| by_id.get(&id))
                .with_context(|| format!("run {} has no reference example", run.id))?;
            scores.push(if self.inner.matches(run, example)? { 1.0 } else { 0.0 });
        }
        let rate = mean(&scores).context("no runs to score")?;
        Ok(EvaluationResult::new("exact_match_rate")
            .with_score(round_to(rate, SUMMARY_PRECISION))
            .with_value(json!(scores.len()))
            .into())
    }
}

/// Mean of a numeric output field across all runs.
#[derive(Debug, Clone)]
pub struct MeanOutputScore {
    field: String,
    key: String,
}

impl MeanOutputScore {
    /// Results are reported under the key `mean_<field>`.
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            key: format!("mean_{field}"),
            field,
        }
    }
}

#[async_trait]
impl SummaryEvaluator for MeanOutputScore {
    fn name(&self) -> Option<&str> {
        Some(&self.key)
    }

    async fn evaluate(&self, runs: &[Run], _examples: &[Example]) -> anyhow::Result<EvaluatorOutput> {
        let scores: Vec<f64> = runs
            .iter()
            .filter_map(|run| run.outputs.as_ref()?.get(&self.field).and_then(Value::as_f64))
            .collect();
        let Some(avg) = mean(&scores) else {
            bail!("no run produced a numeric '{}' output", self.field);
        };
        if scores.len() < runs.len() {
            tracing::warn!(
                field = %self.field,
                skipped = runs.len() - scores.len(),
                "runs without a numeric output were left out of the mean"
            );
        }
        Ok(EvaluationResult::new(self.key.clone())
            .with_score(round_to(avg, SUMMARY_PRECISION))
            .into())
    }
}
