//! JSONL dataset import.
//!
//! Each non-blank line is one example:
//!
//! ```text
//! {"inputs": {"question": "2+2"}, "outputs": {"answer": "4"}}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use evalpipe_core::model::Payload;

use crate::error::LoadError;
use crate::memory::{Dataset, InMemoryClient};

/// One line of a dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExampleRecord {
    pub inputs: Payload,
    #[serde(default)]
    pub outputs: Option<Payload>,
}

/// Parse JSONL content. Line numbers in errors are 1-based.
pub fn parse_jsonl(content: &str) -> Result<Vec<ExampleRecord>, LoadError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|source| LoadError::Parse { line: i + 1, source })
        })
        .collect()
}

/// Read a dataset file without importing it.
pub fn read_jsonl(path: &Path) -> Result<Vec<ExampleRecord>, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let records = parse_jsonl(&content)?;
    if records.is_empty() {
        return Err(LoadError::Empty(path.to_path_buf()));
    }
    Ok(records)
}

/// Import a dataset file into `client`. The dataset is named after the
/// file stem unless `name` is given.
pub fn load_jsonl_dataset(
    client: &InMemoryClient,
    path: &Path,
    name: Option<&str>,
) -> Result<Dataset, LoadError> {
    let records = read_jsonl(path)?;
    let name = match name {
        Some(name) => name.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string()),
    };

    let dataset = client.create_dataset(name, Some(format!("imported from {}", path.display())))?;
    for record in records {
        client.create_example(dataset.id, record.inputs, record.outputs)?;
    }
    tracing::info!(dataset = %dataset.name, path = %path.display(), "dataset imported");
    Ok(dataset)
}
