//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, BoxStream};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ClientError;
use crate::model::{DatasetRef, Example, Experiment, Payload, Run};
use crate::traits::{Client, CreateProjectRequest, FeedbackCreate, UpdateProjectRequest};

/// A store holding one dataset in memory and recording every write.
#[derive(Default)]
pub struct StubClient {
    pub examples: Vec<Example>,
    pub projects: Mutex<Vec<Experiment>>,
    pub updates: Mutex<Vec<(Uuid, UpdateProjectRequest)>>,
    pub runs: Mutex<Vec<Run>>,
    pub feedback: Mutex<Vec<(Option<Uuid>, String, FeedbackCreate)>>,
    /// Feedback keys the store refuses.
    pub reject_feedback: Vec<String>,
}

impl StubClient {
    pub fn with_examples(examples: Vec<Example>) -> Arc<Self> {
        Arc::new(Self {
            examples,
            ..Self::default()
        })
    }
}

#[async_trait]
impl Client for StubClient {
    fn list_examples(&self, _: &DatasetRef) -> BoxStream<'static, Result<Example, ClientError>> {
        Box::pin(stream::iter(self.examples.clone().into_iter().map(Ok)))
    }

    async fn create_project(&self, request: &CreateProjectRequest) -> Result<Experiment, ClientError> {
        let mut projects = self.projects.lock().unwrap();
        if projects.iter().any(|p| p.name == request.name) {
            return Err(ClientError::Conflict(format!("project {}", request.name)));
        }
        let experiment = Experiment {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            description: request.description.clone(),
            reference_dataset_id: request.reference_dataset_id,
            start_time: Utc::now(),
            end_time: None,
            metadata: request.metadata.clone(),
        };
        projects.push(experiment.clone());
        Ok(experiment)
    }

    async fn update_project(&self, id: Uuid, request: &UpdateProjectRequest) -> Result<(), ClientError> {
        self.updates.lock().unwrap().push((id, request.clone()));
        Ok(())
    }

    async fn read_project(&self, id: Uuid) -> Result<Experiment, ClientError> {
        self.projects
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("project {id}")))
    }

    async fn create_run(&self, run: &Run) -> Result<(), ClientError> {
        self.runs.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn create_feedback(
        &self,
        run_id: Option<Uuid>,
        key: &str,
        feedback: &FeedbackCreate,
    ) -> Result<(), ClientError> {
        if self.reject_feedback.iter().any(|k| k == key) {
            return Err(ClientError::InvalidRequest(format!("feedback key {key}")));
        }
        self.feedback
            .lock()
            .unwrap()
            .push((run_id, key.to_string(), feedback.clone()));
        Ok(())
    }
}

/// An example in a fixed dataset whose inputs are `{"question": <q>}`.
pub fn example(dataset_id: Uuid, question: &str, answer: Value) -> Example {
    let mut inputs = Payload::new();
    inputs.insert("question".into(), json!(question));
    let mut outputs = Payload::new();
    outputs.insert("answer".into(), answer);
    Example {
        id: Uuid::new_v4(),
        dataset_id,
        inputs,
        outputs: Some(outputs),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        modified_at: None,
    }
}
