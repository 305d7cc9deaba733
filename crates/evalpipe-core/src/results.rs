//! Materialized results of an evaluation.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{Stream, TryStreamExt};
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::error::EvalError;
use crate::model::{EvaluationResults, ExperimentResultRow};
use crate::pipeline::ExperimentManager;

static NO_SUMMARY: EvaluationResults = EvaluationResults {
    results: Vec::new(),
};

/// Every row of an experiment plus its summary scores.
///
/// The rows are drained from the pipeline by a background task. Iterating
/// (as a [`Stream`]) waits for that task and then walks the cached rows
/// with a forward-only cursor.
#[derive(Debug)]
pub struct ExperimentResults {
    experiment_name: String,
    state: State,
    cursor: usize,
}

#[derive(Debug)]
enum State {
    Pending(JoinHandle<Result<Materialized, EvalError>>),
    Ready(Materialized),
    /// The error is handed out once, to the first poll that sees it.
    Failed(Option<EvalError>),
}

#[derive(Debug)]
struct Materialized {
    rows: Vec<ExperimentResultRow>,
    summary: EvaluationResults,
}

impl ExperimentResults {
    /// Start draining `manager` in the background. Must be called from
    /// within a tokio runtime.
    pub fn spawn(manager: ExperimentManager) -> Self {
        let experiment_name = manager.experiment_name().to_string();
        let task = tokio::spawn(async move {
            let rows: Vec<ExperimentResultRow> = manager.get_results()?.try_collect().await?;
            let summary = manager.get_summary_scores().await?;
            tracing::debug!(rows = rows.len(), summary = summary.len(), "results materialized");
            Ok::<_, EvalError>(Materialized { rows, summary })
        });
        Self {
            experiment_name,
            state: State::Pending(task),
            cursor: 0,
        }
    }

    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// Wait until every row and the summary are available.
    pub async fn wait(&mut self) -> Result<(), EvalError> {
        futures::future::poll_fn(|cx| self.poll_materialized(cx)).await
    }

    /// Number of rows. Zero until materialization finishes.
    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows, in example order. Empty until materialization finishes.
    pub fn rows(&self) -> &[ExperimentResultRow] {
        match &self.state {
            State::Ready(materialized) => &materialized.rows,
            _ => &[],
        }
    }

    /// The summary scores. Empty until materialization finishes.
    pub fn summary_results(&self) -> &EvaluationResults {
        match &self.state {
            State::Ready(materialized) => &materialized.summary,
            _ => &NO_SUMMARY,
        }
    }

    fn poll_materialized(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), EvalError>> {
        let State::Pending(task) = &mut self.state else {
            return Poll::Ready(match &self.state {
                State::Failed(Some(e)) => Err(e.clone()),
                _ => Ok(()),
            });
        };
        let outcome = match task.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(e)) => Err(EvalError::Task(e.to_string())),
        };
        match outcome {
            Ok(materialized) => {
                self.state = State::Ready(materialized);
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                self.state = State::Failed(Some(e.clone()));
                Poll::Ready(Err(e))
            }
        }
    }
}

impl Stream for ExperimentResults {
    type Item = Result<ExperimentResultRow, EvalError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let State::Pending(_) = this.state {
            if let Poll::Pending = this.poll_materialized(cx) {
                return Poll::Pending;
            }
        }
        match &mut this.state {
            State::Ready(materialized) => {
                let row = materialized.rows.get(this.cursor).cloned();
                if row.is_some() {
                    this.cursor += 1;
                }
                Poll::Ready(row.map(Ok))
            }
            State::Failed(error) => Poll::Ready(error.take().map(Err)),
            State::Pending(_) => Poll::Pending,
        }
    }
}

impl Drop for ExperimentResults {
    fn drop(&mut self) {
        if let State::Pending(task) = &self.state {
            task.abort();
        }
    }
}
