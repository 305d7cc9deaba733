//! The `evalpipe run` command.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use evalpipe_client::{load_config_from, load_jsonl_dataset, InMemoryClient};
use evalpipe_core::builtin::{ExactMatch, ExactMatchRate, MeanOutputScore};
use evalpipe_core::evaluator::{EvaluatorSpec, SummaryEvaluator};
use evalpipe_core::model::{EvaluationResult, Experiment, ExperimentResultRow, Payload, Run};
use evalpipe_core::observer::PipelineObserver;
use evalpipe_core::statistics::feedback_stats;
use evalpipe_core::tracer::TraceContext;
use evalpipe_core::traits::Target;
use evalpipe_core::{evaluate, DataSource, EvaluateOptions, ExperimentResults};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the .jsonl dataset (defaults to `dataset` from the config)
    #[arg(long)]
    pub dataset: Option<PathBuf>,

    /// Shell command to evaluate; receives each example's inputs as JSON on stdin
    #[arg(long)]
    pub command: String,

    /// Row evaluators: exact_match or exact_match:<field>
    #[arg(long = "evaluator")]
    pub evaluators: Vec<String>,

    /// Summary evaluators: exact_match_rate, exact_match_rate:<field> or mean:<field>
    #[arg(long = "summary")]
    pub summaries: Vec<String>,

    /// Max concurrent command invocations (0 runs one at a time)
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Experiment name prefix
    #[arg(long)]
    pub prefix: Option<String>,

    /// Per-invocation timeout in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Write result rows as JSONL to this file
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// A target that runs a shell command once per example.
///
/// Inputs are written to stdin as JSON. Stdout is parsed as JSON; anything
/// else is recorded as text.
pub struct CommandTarget {
    command: String,
    timeout: Duration,
}

impl CommandTarget {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Target for CommandTarget {
    fn name(&self) -> &str {
        &self.command
    }

    async fn invoke(&self, inputs: Payload, _ctx: TraceContext) -> Result<Value> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.command))?;

        let body = serde_json::to_vec(&inputs)?;
        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may exit before reading it.
                if let Err(e) = stdin.write_all(&body).await {
                    tracing::debug!(error = %e, "command closed stdin early");
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow::anyhow!("command timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("command exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let text = stdout.trim();
        Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
    }
}

/// Console progress reporter.
struct ConsoleObserver;

impl PipelineObserver for ConsoleObserver {
    fn on_experiment_start(&self, experiment: &Experiment) {
        eprintln!("Starting experiment {}", experiment.name);
    }

    fn on_row_predicted(&self, example_id: Uuid, run: &Run) {
        let status = if run.error.is_some() { "FAIL" } else { "OK" };
        let elapsed = run.end_time - run.start_time;
        eprintln!(
            "  Done: {example_id} [{status}] ({}ms)",
            elapsed.num_milliseconds()
        );
    }

    fn on_target_error(&self, example_id: Uuid, error: &str) {
        eprintln!("  ERROR: {example_id}: {error}");
    }

    fn on_evaluator_error(&self, evaluator: &str, run_id: Option<Uuid>, error: &str) {
        match run_id {
            Some(run_id) => eprintln!("  ERROR: {evaluator} on run {run_id}: {error}"),
            None => eprintln!("  ERROR: {evaluator}: {error}"),
        }
    }

    fn on_summary_computed(&self, evaluator: &str, results: &[EvaluationResult]) {
        eprintln!("  Summary {evaluator}: {} result(s)", results.len());
    }

    fn on_experiment_end(&self, experiment: &Experiment, rows: usize) {
        eprintln!("\nComplete: {rows} row(s) in {}", experiment.name);
    }
}

fn parse_evaluator(spec: &str) -> Result<EvaluatorSpec> {
    match spec.split_once(':') {
        None if spec == "exact_match" => Ok(Arc::new(ExactMatch::new()).into()),
        Some(("exact_match", field)) => Ok(Arc::new(ExactMatch::on_field(field)).into()),
        _ => bail!("unknown evaluator '{spec}'. Available: exact_match, exact_match:<field>"),
    }
}

fn parse_summary(spec: &str) -> Result<Arc<dyn SummaryEvaluator>> {
    match spec.split_once(':') {
        None if spec == "exact_match_rate" => Ok(Arc::new(ExactMatchRate::new())),
        Some(("exact_match_rate", field)) => Ok(Arc::new(ExactMatchRate::on_field(field))),
        Some(("mean", field)) if !field.is_empty() => Ok(Arc::new(MeanOutputScore::new(field))),
        _ => bail!(
            "unknown summary evaluator '{spec}'. Available: exact_match_rate, \
             exact_match_rate:<field>, mean:<field>"
        ),
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let config = load_config_from(args.config.as_deref())?;

    let evaluators = args
        .evaluators
        .iter()
        .map(|s| parse_evaluator(s))
        .collect::<Result<Vec<_>>>()?;
    let summaries = args
        .summaries
        .iter()
        .map(|s| parse_summary(s))
        .collect::<Result<Vec<_>>>()?;

    let dataset_path = args
        .dataset
        .or(config.dataset.clone())
        .context("no dataset given; pass --dataset or set `dataset` in evalpipe.toml")?;
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(config.timeout_secs));
    anyhow::ensure!(!timeout.is_zero(), "timeout must be at least 1 second");

    let client = Arc::new(InMemoryClient::new());
    let dataset = load_jsonl_dataset(&client, &dataset_path, None)?;

    let mut metadata = config.metadata.clone();
    metadata.insert("command".into(), Value::String(args.command.clone()));

    let mut options = EvaluateOptions::new(DataSource::DatasetId(dataset.id), client.clone())
        .with_prefix(args.prefix.unwrap_or(config.experiment_prefix))
        .with_max_concurrency(args.max_concurrency.unwrap_or(config.max_concurrency))
        .with_metadata(metadata)
        .with_observer(Arc::new(ConsoleObserver));
    options.description = Some(format!("`{}` over {}", args.command, dataset.name));
    for evaluator in evaluators {
        options = options.with_evaluator(evaluator);
    }
    for summary in summaries {
        options = options.with_summary_evaluator(summary);
    }

    let target = Arc::new(CommandTarget::new(args.command, timeout));
    let results = evaluate(target, options).await?;

    print_summary(&results);

    if let Some(path) = args.output.or(config.output) {
        write_rows(&path, results.rows())?;
        eprintln!("Results saved to: {}", path.display());
    }

    Ok(())
}

fn write_rows(path: &Path, rows: &[ExperimentResultRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    for row in rows {
        content.push_str(&serde_json::to_string(row)?);
        content.push('\n');
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

fn print_summary(results: &ExperimentResults) {
    use comfy_table::{Cell, Table};

    let failed = results.rows().iter().filter(|r| r.run.error.is_some()).count();
    println!(
        "Experiment {}: {} rows, {} failed",
        results.experiment_name(),
        results.len(),
        failed
    );

    let score = |v: Option<f64>| v.map(|v| format!("{v:.3}")).unwrap_or_else(|| "-".into());

    let stats = feedback_stats(results.rows());
    if !stats.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Feedback", "Count", "Scored", "Mean", "Min", "Max"]);
        for s in &stats {
            table.add_row(vec![
                Cell::new(&s.key),
                Cell::new(s.count),
                Cell::new(s.scored),
                Cell::new(score(s.mean)),
                Cell::new(score(s.min)),
                Cell::new(score(s.max)),
            ]);
        }
        println!("\n{table}");
    }

    let summary = results.summary_results();
    if !summary.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Summary", "Score", "Value"]);
        for result in summary.iter() {
            table.add_row(vec![
                Cell::new(&result.key),
                Cell::new(score(result.score)),
                Cell::new(result.value.as_ref().map(Value::to_string).unwrap_or_default()),
            ]);
        }
        println!("\n{table}");
    }
}
