//! Run configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use evalpipe_core::model::Payload;

/// Top-level evalpipe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalpipeConfig {
    /// Ceiling on concurrent target and evaluator invocations. 0 runs one
    /// at a time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Experiments are named `<prefix>-<8 hex chars>`.
    #[serde(default = "default_experiment_prefix")]
    pub experiment_prefix: String,
    /// Default dataset file.
    #[serde(default)]
    pub dataset: Option<PathBuf>,
    /// Per-invocation timeout for command targets.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Where to write result rows as JSONL.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Attached to every experiment.
    #[serde(default)]
    pub metadata: Payload,
}

fn default_max_concurrency() -> usize {
    4
}
fn default_experiment_prefix() -> String {
    "experiment".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

impl Default for EvalpipeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            experiment_prefix: default_experiment_prefix(),
            dataset: None,
            timeout_secs: default_timeout_secs(),
            output: None,
            metadata: Payload::new(),
        }
    }
}

impl EvalpipeConfig {
    /// Parse a TOML document and resolve `${VAR}` references.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: EvalpipeConfig = toml::from_str(content)?;
        config.resolve_env();
        Ok(config)
    }

    fn resolve_env(&mut self) {
        if let Some(dataset) = &self.dataset {
            self.dataset = Some(PathBuf::from(resolve_env_vars(&dataset.to_string_lossy())));
        }
        for value in self.metadata.values_mut() {
            resolve_value(value);
        }
    }

    /// Apply `EVALPIPE_MAX_CONCURRENCY` and `EVALPIPE_EXPERIMENT_PREFIX`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = var("EVALPIPE_MAX_CONCURRENCY") {
            self.max_concurrency = raw
                .trim()
                .parse()
                .with_context(|| format!("EVALPIPE_MAX_CONCURRENCY is not a number: {raw}"))?;
        }
        if let Some(prefix) = var("EVALPIPE_EXPERIMENT_PREFIX") {
            self.experiment_prefix = prefix;
        }
        Ok(())
    }
}

fn resolve_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = resolve_env_vars(s),
        Value::Array(items) => items.iter_mut().for_each(resolve_value),
        Value::Object(map) => map.values_mut().for_each(resolve_value),
        _ => {}
    }
}

/// Resolve references like `${VAR_NAME}`. Unset variables become empty.
fn resolve_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        let name = &rest[start + 2..start + len];
        result.push_str(&std::env::var(name).unwrap_or_default());
        rest = &rest[start + len + 1..];
    }
    result.push_str(rest);
    result
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `evalpipe.toml` in the current directory
/// 2. `~/.config/evalpipe/config.toml`
///
/// Environment variable overrides: `EVALPIPE_MAX_CONCURRENCY`,
/// `EVALPIPE_EXPERIMENT_PREFIX`.
pub fn load_config() -> Result<EvalpipeConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<EvalpipeConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => [Some(PathBuf::from("evalpipe.toml")), dirs_path().map(|d| d.join("config.toml"))]
            .into_iter()
            .flatten()
            .find(|p| p.exists()),
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            let config = EvalpipeConfig::from_toml(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?;
            tracing::debug!(path = %path.display(), "config loaded");
            config
        }
        None => EvalpipeConfig::default(),
    };

    config.apply_overrides(|name| std::env::var(name).ok())?;
    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("evalpipe"))
}
