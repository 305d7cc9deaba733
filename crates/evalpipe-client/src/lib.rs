//! evalpipe-client — Store client and configuration.
//!
//! [`InMemoryClient`] implements the evalpipe-core `Client` trait over
//! process-local state: datasets, examples, experiments, runs and feedback.
//! Datasets can be imported from JSONL files, and run settings are read
//! from `evalpipe.toml`.

pub mod config;
pub mod error;
pub mod jsonl;
pub mod memory;

pub use config::{load_config, load_config_from, EvalpipeConfig};
pub use error::LoadError;
pub use jsonl::{load_jsonl_dataset, parse_jsonl, read_jsonl, ExampleRecord};
pub use memory::{Dataset, Feedback, InMemoryClient};
