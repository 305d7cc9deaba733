//! Dataset loading errors.

use std::path::PathBuf;

use thiserror::Error;

use evalpipe_core::error::ClientError;

/// Errors that can occur when importing a dataset file.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line is not a valid example record.
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The file contains no records.
    #[error("dataset file {} has no examples", .0.display())]
    Empty(PathBuf),

    /// The store rejected the dataset or one of its examples.
    #[error(transparent)]
    Store(#[from] ClientError),
}
