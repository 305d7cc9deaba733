//! Progress events emitted by the pipeline.

use uuid::Uuid;

use crate::model::{EvaluationResult, Experiment, Run};

/// Receives pipeline events. Implementations must be cheap; they are called
/// inline on the pipeline's tasks.
pub trait PipelineObserver: Send + Sync {
    fn on_experiment_start(&self, experiment: &Experiment);
    fn on_row_predicted(&self, example_id: Uuid, run: &Run);
    fn on_target_error(&self, example_id: Uuid, error: &str);
    fn on_evaluator_error(&self, evaluator: &str, run_id: Option<Uuid>, error: &str);
    fn on_summary_computed(&self, evaluator: &str, results: &[EvaluationResult]);
    fn on_experiment_end(&self, experiment: &Experiment, rows: usize);
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn on_experiment_start(&self, _: &Experiment) {}
    fn on_row_predicted(&self, _: Uuid, _: &Run) {}
    fn on_target_error(&self, _: Uuid, _: &str) {}
    fn on_evaluator_error(&self, _: &str, _: Option<Uuid>, _: &str) {}
    fn on_summary_computed(&self, _: &str, _: &[EvaluationResult]) {}
    fn on_experiment_end(&self, _: &Experiment, _: usize) {}
}

/// Observer that forwards events to `tracing`.
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_experiment_start(&self, experiment: &Experiment) {
        tracing::info!(
            experiment = %experiment.name,
            id = %experiment.id,
            "starting evaluation of experiment"
        );
    }

    fn on_row_predicted(&self, example_id: Uuid, run: &Run) {
        tracing::debug!(example = %example_id, run = %run.id, "row predicted");
    }

    fn on_target_error(&self, example_id: Uuid, error: &str) {
        tracing::error!(example = %example_id, "error running target function: {error}");
    }

    fn on_evaluator_error(&self, evaluator: &str, run_id: Option<Uuid>, error: &str) {
        match run_id {
            Some(run_id) => {
                tracing::error!(evaluator, run = %run_id, "error running evaluator: {error}")
            }
            None => tracing::error!(evaluator, "error running summary evaluator: {error}"),
        }
    }

    fn on_summary_computed(&self, evaluator: &str, results: &[EvaluationResult]) {
        for result in results {
            tracing::info!(
                evaluator,
                key = %result.key,
                score = ?result.score,
                "summary score computed"
            );
        }
    }

    fn on_experiment_end(&self, experiment: &Experiment, rows: usize) {
        tracing::info!(experiment = %experiment.name, rows, "experiment finalized");
    }
}
