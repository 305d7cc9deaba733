//! In-progress execution spans.
//!
//! A [`RunTree`] is open while the traced code runs. Ending it consumes the
//! tree and yields an immutable [`Run`], so a span is terminated exactly once.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{Payload, Run, RunType};

/// An open execution span that may collect finished child runs.
#[derive(Debug, Clone)]
pub struct RunTree {
    id: Uuid,
    name: String,
    run_type: RunType,
    inputs: Payload,
    start_time: DateTime<Utc>,
    parent_run_id: Option<Uuid>,
    reference_example_id: Option<Uuid>,
    project_name: Option<String>,
    metadata: Payload,
    execution_order: u32,
    child_execution_order: u32,
    child_runs: Vec<Run>,
}

impl RunTree {
    pub fn new(name: impl Into<String>, run_type: RunType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            run_type,
            inputs: Payload::new(),
            start_time: Utc::now(),
            parent_run_id: None,
            reference_example_id: None,
            project_name: None,
            metadata: Payload::new(),
            execution_order: 1,
            child_execution_order: 1,
            child_runs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Payload) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
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

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    /// Open a child span. The child inherits the project and is ordered
    /// after every child created so far.
    pub fn create_child(&mut self, name: impl Into<String>, run_type: RunType) -> RunTree {
        let execution_order = self.child_execution_order + 1;
        self.child_execution_order = execution_order;
        RunTree {
            id: Uuid::new_v4(),
            name: name.into(),
            run_type,
            inputs: Payload::new(),
            start_time: Utc::now(),
            parent_run_id: Some(self.id),
            reference_example_id: None,
            project_name: self.project_name.clone(),
            metadata: Payload::new(),
            execution_order,
            child_execution_order: execution_order,
            child_runs: Vec::new(),
        }
    }

    /// Attach a finished child run.
    pub fn add_child(&mut self, child: Run) {
        self.child_execution_order = self.child_execution_order.max(child.execution_order);
        self.child_runs.push(child);
    }

    /// Close the span. Non-object outputs are recorded as `{"output": value}`.
    pub fn end(self, outputs: Option<Value>, error: Option<String>) -> Run {
        Run {
            id: self.id,
            name: self.name,
            run_type: self.run_type,
            start_time: self.start_time,
            end_time: Utc::now(),
            inputs: self.inputs,
            outputs: outputs.map(into_payload),
            error,
            child_runs: self.child_runs,
            parent_run_id: self.parent_run_id,
            reference_example_id: self.reference_example_id,
            project_name: self.project_name,
            metadata: self.metadata,
            execution_order: self.execution_order,
        }
    }
}

/// Coerce a value into an object payload.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("output".to_string(), other);
            map
        }
    }
}
