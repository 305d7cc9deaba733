//! Tracing facility: wraps an invocation so it produces exactly one run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{Payload, Run, RunType};
use crate::run_tree::RunTree;
use crate::traits::Client;

/// Callback receiving the finished run.
pub type OnRunEnd = Box<dyn FnOnce(&Run) + Send>;

/// The traced invocation. Receives the context for recording child runs.
pub type TracedCall = Box<dyn FnOnce(TraceContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// Run-scoping options for one traced invocation.
pub struct TraceOptions {
    pub name: String,
    pub run_type: RunType,
    /// Experiment (project) the run is grouped under.
    pub project_name: String,
    pub reference_example_id: Option<Uuid>,
    pub metadata: Payload,
    pub on_end: Option<OnRunEnd>,
}

impl TraceOptions {
    pub fn new(name: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_type: RunType::Chain,
            project_name: project_name.into(),
            reference_example_id: None,
            metadata: Payload::new(),
            on_end: None,
        }
    }

    pub fn with_run_type(mut self, run_type: RunType) -> Self {
        self.run_type = run_type;
        self
    }

    pub fn with_reference_example(mut self, example_id: Uuid) -> Self {
        self.reference_example_id = Some(example_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn on_end(mut self, callback: impl FnOnce(&Run) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(callback));
        self
    }
}

/// Wraps invocations so each one is recorded as a run.
///
/// Implementations must deliver exactly one finished run to
/// `options.on_end` per call; the pipeline treats a missing run as fatal.
#[async_trait]
pub trait Tracer: Send + Sync {
    async fn trace(
        &self,
        options: TraceOptions,
        inputs: Payload,
        call: TracedCall,
    ) -> anyhow::Result<Value>;
}

/// Handle given to traced code for recording nested runs.
#[derive(Debug, Clone)]
pub struct TraceContext {
    run_id: Uuid,
    tree: Arc<Mutex<Option<RunTree>>>,
}

impl TraceContext {
    pub fn new(tree: RunTree) -> Self {
        Self {
            run_id: tree.id(),
            tree: Arc::new(Mutex::new(Some(tree))),
        }
    }

    /// Identity of the run being recorded.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Open a child span under the current run.
    pub fn child(&self, name: impl Into<String>, run_type: RunType) -> RunTree {
        match self.lock().as_mut() {
            Some(tree) => tree.create_child(name, run_type),
            None => RunTree::new(name, run_type),
        }
    }

    /// Attach a finished child run.
    pub fn record(&self, child: Run) {
        match self.lock().as_mut() {
            Some(tree) => tree.add_child(child),
            None => tracing::debug!(run_id = %self.run_id, "dropping child run recorded after parent ended"),
        }
    }

    /// Take the tree out for ending. Later `record` calls are dropped.
    pub fn take(&self) -> Option<RunTree> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunTree>> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracer that persists each finished run through the store client.
pub struct ClientTracer {
    client: Arc<dyn Client>,
}

impl ClientTracer {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tracer for ClientTracer {
    async fn trace(
        &self,
        options: TraceOptions,
        inputs: Payload,
        call: TracedCall,
    ) -> anyhow::Result<Value> {
        let TraceOptions {
            name,
            run_type,
            project_name,
            reference_example_id,
            metadata,
            on_end,
        } = options;

        let mut tree = RunTree::new(name, run_type)
            .with_inputs(inputs)
            .with_project(project_name)
            .with_metadata(metadata);
        if let Some(example_id) = reference_example_id {
            tree = tree.with_reference_example(example_id);
        }

        let ctx = TraceContext::new(tree);
        let result = call(ctx.clone()).await;

        let Some(tree) = ctx.take() else {
            return result;
        };
        let run = match &result {
            Ok(value) => tree.end(Some(value.clone()), None),
            Err(e) => tree.end(None, Some(format!("{e:#}"))),
        };

        if let Err(e) = self.client.create_run(&run).await {
            tracing::warn!(run_id = %run.id, "failed to persist run: {e}");
        }
        if let Some(on_end) = on_end {
            on_end(&run);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubClient;
    use futures::FutureExt;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn trace_records_outputs_and_children() {
        let sink = Arc::new(StubClient::default());
        let tracer = ClientTracer::new(sink.clone());
        let (tx, rx) = oneshot::channel();
        let example_id = Uuid::new_v4();

        let options = TraceOptions::new("target", "exp-1")
            .with_reference_example(example_id)
            .on_end(move |run| {
                let _ = tx.send(run.clone());
            });
        let call: TracedCall = Box::new(|ctx: TraceContext| {
            async move {
                let child = ctx.child("lookup", RunType::Tool);
                ctx.record(child.end(Some(json!("found")), None));
                Ok::<_, anyhow::Error>(json!({"answer": 42}))
            }
            .boxed()
        });

        let value = tracer.trace(options, Payload::new(), call).await.unwrap();
        assert_eq!(value, json!({"answer": 42}));

        let run = rx.await.unwrap();
        assert_eq!(run.reference_example_id, Some(example_id));
        assert_eq!(run.project_name.as_deref(), Some("exp-1"));
        assert_eq!(run.child_runs.len(), 1);
        assert_eq!(sink.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trace_records_error_and_propagates_it() {
        let sink = Arc::new(StubClient::default());
        let tracer = ClientTracer::new(sink.clone());
        let (tx, rx) = oneshot::channel();

        let options = TraceOptions::new("target", "exp-1").on_end(move |run| {
            let _ = tx.send(run.clone());
        });
        let call: TracedCall = Box::new(|_ctx: TraceContext| {
            async move { Err::<Value, _>(anyhow::anyhow!("target exploded")) }.boxed()
        });

        let err = tracer.trace(options, Payload::new(), call).await.unwrap_err();
        assert!(err.to_string().contains("exploded"));

        let run = rx.await.unwrap();
        assert_eq!(run.error.as_deref(), Some("target exploded"));
        assert!(run.outputs.is_none());
    }
}
