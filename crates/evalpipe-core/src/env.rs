//! Environment metadata recorded on experiments.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::model::Payload;

/// The state of the git checkout the evaluation runs from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub remote_url: Option<String>,
    pub dirty: bool,
}

impl GitInfo {
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

/// Collect git metadata for the current directory. Returns `None` when git
/// is unavailable or the directory is not a repository.
pub async fn git_info() -> Option<GitInfo> {
    git_info_in(Path::new(".")).await
}

/// Collect git metadata for the checkout containing `dir`.
pub async fn git_info_in(dir: &Path) -> Option<GitInfo> {
    let inside = git(dir, &["rev-parse", "--is-inside-work-tree"]).await?;
    if inside != "true" {
        return None;
    }
    let status = git(dir, &["status", "--porcelain"]).await;
    Some(GitInfo {
        commit: git(dir, &["rev-parse", "HEAD"]).await,
        branch: git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await,
        remote_url: git(dir, &["config", "--get", "remote.origin.url"]).await,
        dirty: status.is_some_and(|s| !s.is_empty()),
    })
}

async fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = match Command::new("git").args(args).current_dir(dir).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!("git unavailable: {e}");
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
