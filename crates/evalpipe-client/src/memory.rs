//! In-memory store client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use evalpipe_core::error::ClientError;
use evalpipe_core::model::{DatasetRef, Example, Experiment, Payload, Run};
use evalpipe_core::traits::{Client, CreateProjectRequest, FeedbackCreate, UpdateProjectRequest};

/// Examples handed out per page by `list_examples`.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A named collection of examples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored feedback record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    /// `None` for experiment-level feedback.
    pub run_id: Option<Uuid>,
    pub key: String,
    #[serde(flatten)]
    pub body: FeedbackCreate,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    datasets: Vec<Dataset>,
    examples: HashMap<Uuid, Vec<Example>>,
    projects: Vec<Experiment>,
    runs: Vec<Run>,
    feedback: Vec<Feedback>,
}

impl State {
    fn dataset(&self, dataset: &DatasetRef) -> Result<&Dataset, ClientError> {
        let found = match dataset {
            DatasetRef::Id(id) => self.datasets.iter().find(|d| d.id == *id),
            DatasetRef::Name(name) => self.datasets.iter().find(|d| d.name == *name),
        };
        found.ok_or_else(|| ClientError::NotFound(dataset.to_string()))
    }

    fn project_mut(&mut self, id: Uuid) -> Result<&mut Experiment, ClientError> {
        self.projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("project {id}")))
    }
}

/// A [`Client`] that keeps everything in process memory.
///
/// Cloning shares the underlying store.
#[derive(Clone)]
pub struct InMemoryClient {
    state: Arc<Mutex<State>>,
    page_size: usize,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Hand out examples `page_size` at a time.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty dataset. Names are unique.
    pub fn create_dataset(
        &self,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<Dataset, ClientError> {
        let name = name.into();
        let mut state = self.lock();
        if state.datasets.iter().any(|d| d.name == name) {
            return Err(ClientError::Conflict(format!("dataset '{name}'")));
        }
        let dataset = Dataset {
            id: Uuid::new_v4(),
            name,
            description,
            created_at: Utc::now(),
        };
        state.examples.insert(dataset.id, Vec::new());
        state.datasets.push(dataset.clone());
        Ok(dataset)
    }

    /// Append an example to a dataset.
    pub fn create_example(
        &self,
        dataset_id: Uuid,
        inputs: Payload,
        outputs: Option<Payload>,
    ) -> Result<Example, ClientError> {
        let mut state = self.lock();
        let examples = state
            .examples
            .get_mut(&dataset_id)
            .ok_or_else(|| ClientError::NotFound(format!("dataset {dataset_id}")))?;
        let example = Example {
            id: Uuid::new_v4(),
            dataset_id,
            inputs,
            outputs,
            created_at: Utc::now(),
            modified_at: None,
        };
        examples.push(example.clone());
        Ok(example)
    }

    /// Replace an example's expected outputs, stamping its modification time.
    pub fn update_example(&self, example_id: Uuid, outputs: Option<Payload>) -> Result<Example, ClientError> {
        let mut state = self.lock();
        let example = state
            .examples
            .values_mut()
            .flat_map(|examples| examples.iter_mut())
            .find(|e| e.id == example_id)
            .ok_or_else(|| ClientError::NotFound(format!("example {example_id}")))?;
        example.outputs = outputs;
        example.modified_at = Some(Utc::now());
        Ok(example.clone())
    }

    pub fn read_dataset(&self, dataset: &DatasetRef) -> Result<Dataset, ClientError> {
        self.lock().dataset(dataset).cloned()
    }

    /// Look up an experiment by name.
    pub fn project_by_name(&self, name: &str) -> Option<Experiment> {
        self.lock().projects.iter().find(|p| p.name == name).cloned()
    }

    /// Every persisted run grouped under the named project.
    pub fn runs_for_project(&self, project_name: &str) -> Vec<Run> {
        self.lock()
            .runs
            .iter()
            .filter(|r| r.project_name.as_deref() == Some(project_name))
            .cloned()
            .collect()
    }

    pub fn runs(&self) -> Vec<Run> {
        self.lock().runs.clone()
    }

    pub fn feedback(&self) -> Vec<Feedback> {
        self.lock().feedback.clone()
    }

    /// Feedback attached to one run.
    pub fn feedback_for_run(&self, run_id: Uuid) -> Vec<Feedback> {
        self.lock()
            .feedback
            .iter()
            .filter(|f| f.run_id == Some(run_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Client for InMemoryClient {
    fn list_examples(&self, dataset: &DatasetRef) -> BoxStream<'static, Result<Example, ClientError>> {
        let state = Arc::clone(&self.state);
        let dataset = dataset.clone();
        let page_size = self.page_size;

        // One page per pull; the store is not touched until the first poll.
        stream::unfold(Some(0usize), move |offset| {
            let state = Arc::clone(&state);
            let dataset = dataset.clone();
            async move {
                let offset = offset?;
                tokio::task::yield_now().await;
                let page = {
                    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.dataset(&dataset).map(|d| {
                        let examples = state.examples.get(&d.id).map(Vec::as_slice).unwrap_or(&[]);
                        examples.iter().skip(offset).take(page_size).cloned().collect::<Vec<_>>()
                    })
                };
                match page {
                    Ok(page) if page.is_empty() => None,
                    Ok(page) => {
                        let next = (page.len() == page_size).then_some(offset + page_size);
                        tracing::debug!(%dataset, offset, len = page.len(), "fetched example page");
                        Some((stream::iter(page.into_iter().map(Ok)).boxed(), next))
                    }
                    Err(e) => Some((stream::iter([Err(e)]).boxed(), None)),
                }
            }
        })
        .flatten()
        .boxed()
    }

    async fn create_project(&self, request: &CreateProjectRequest) -> Result<Experiment, ClientError> {
        let mut state = self.lock();
        if state.projects.iter().any(|p| p.name == request.name) {
            return Err(ClientError::Conflict(format!("project '{}'", request.name)));
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
        state.projects.push(experiment.clone());
        tracing::debug!(name = %experiment.name, id = %experiment.id, "project created");
        Ok(experiment)
    }

    async fn update_project(&self, id: Uuid, request: &UpdateProjectRequest) -> Result<(), ClientError> {
        let mut state = self.lock();
        let project = state.project_mut(id)?;
        if let Some(end_time) = request.end_time {
            project.end_time = Some(end_time);
        }
        if let Some(metadata) = &request.metadata {
            project.metadata = metadata.clone();
        }
        Ok(())
    }

    async fn read_project(&self, id: Uuid) -> Result<Experiment, ClientError> {
        Ok(self.lock().project_mut(id)?.clone())
    }

    async fn create_run(&self, run: &Run) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.runs.iter().any(|r| r.id == run.id) {
            return Err(ClientError::Conflict(format!("run {}", run.id)));
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn create_feedback(
        &self,
        run_id: Option<Uuid>,
        key: &str,
        feedback: &FeedbackCreate,
    ) -> Result<(), ClientError> {
        if run_id.is_none() && feedback.project_id.is_none() {
            return Err(ClientError::InvalidRequest(format!(
                "feedback '{key}' needs a run or a project"
            )));
        }
        self.lock().feedback.push(Feedback {
            id: Uuid::new_v4(),
            run_id,
            key: key.to_string(),
            body: feedback.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn inputs(i: usize) -> Payload {
        let mut p = Payload::new();
        p.insert("i".into(), json!(i));
        p
    }

    #[tokio::test]
    async fn lists_examples_across_pages_by_name_and_id() {
        let client = InMemoryClient::new().with_page_size(2);
        let dataset = client.create_dataset("qa", None).unwrap();
        for i in 0..5 {
            client.create_example(dataset.id, inputs(i), None).unwrap();
        }

        let by_id: Vec<Example> = client
            .list_examples(&DatasetRef::Id(dataset.id))
            .try_collect()
            .await
            .unwrap();
        let by_name: Vec<Example> = client
            .list_examples(&DatasetRef::Name("qa".into()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(by_id.len(), 5);
        assert_eq!(by_id, by_name);
        assert_eq!(by_id[4].inputs.get("i"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn unknown_dataset_yields_not_found() {
        let client = InMemoryClient::new();
        let items: Vec<_> = client
            .list_examples(&DatasetRef::Name("missing".into()))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ClientError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_project_names_conflict() {
        let client = InMemoryClient::new();
        let request = CreateProjectRequest {
            name: "exp".into(),
            description: None,
            reference_dataset_id: None,
            metadata: Payload::new(),
        };
        client.create_project(&request).await.unwrap();
        let err = client.create_project(&request).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_project_sets_end_time_and_metadata() {
        let client = InMemoryClient::new();
        let request = CreateProjectRequest {
            name: "exp".into(),
            description: Some("nightly".into()),
            reference_dataset_id: None,
            metadata: Payload::new(),
        };
        let project = client.create_project(&request).await.unwrap();

        let mut metadata = Payload::new();
        metadata.insert("dataset_version".into(), json!("2024-01-01T00:00:00+00:00"));
        client
            .update_project(
                project.id,
                &UpdateProjectRequest {
                    end_time: Some(Utc::now()),
                    metadata: Some(metadata),
                },
            )
            .await
            .unwrap();

        let stored = client.read_project(project.id).await.unwrap();
        assert!(stored.end_time.is_some());
        assert!(stored.metadata.contains_key("dataset_version"));
        assert_eq!(stored.description.as_deref(), Some("nightly"));
    }

    #[tokio::test]
    async fn feedback_needs_a_target() {
        let client = InMemoryClient::new();
        let err = client
            .create_feedback(None, "accuracy", &FeedbackCreate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[test]
    fn update_example_stamps_modification_time() {
        let client = InMemoryClient::new();
        let dataset = client.create_dataset("qa", None).unwrap();
        let example = client.create_example(dataset.id, inputs(0), None).unwrap();
        assert!(example.modified_at.is_none());

        let updated = client.update_example(example.id, Some(inputs(1))).unwrap();
        assert!(updated.modified_at.is_some());
        assert!(updated.version() >= example.version());
    }
}
