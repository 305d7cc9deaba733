//! evalpipe-core — Experiment pipeline engine.
//!
//! Drives a target over every example of a dataset, records each execution
//! as a run, scores runs with row-level evaluators and the whole experiment
//! with summary evaluators. The example source is read once and forked
//! ([`tee`]) so every stage can replay it; target and evaluator invocations
//! go through a bounded, order-preserving caller ([`caller`]).

pub mod builtin;
pub mod caller;
pub mod env;
pub mod error;
pub mod evaluate;
pub mod evaluator;
pub mod model;
pub mod observer;
pub mod pipeline;
pub mod results;
pub mod run_tree;
pub mod statistics;
pub mod tee;
pub mod tracer;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use error::{ClientError, EvalError};
pub use evaluate::{evaluate, DataSource, EvaluateOptions};
pub use results::ExperimentResults;
