//! Git metadata for run registration.
//!
//! Runs are registered with the branch, commit, and repository they were
//! produced from. Lookups shell out to git asynchronously; any failure
//! degrades to "unknown" values rather than blocking the run.

use tokio::process::Command;

/// Git metadata attached to a run.
#[derive(Debug, Clone)]
pub struct GitInfo {
    pub branch: String,
    pub commit_hash: String,
    pub commit_timestamp: i64,
    pub repo: String,
}

impl Default for GitInfo {
    fn default() -> Self {
        Self {
            branch: "unknown".to_string(),
            commit_hash: "unknown".to_string(),
            commit_timestamp: chrono::Utc::now().timestamp(),
            repo: "unknown".to_string(),
        }
    }
}

async fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Retrieves git metadata for the working directory, with defaults on
/// failure.
pub async fn git_info() -> GitInfo {
    let branch = git_output(&["rev-parse", "--abbrev-ref", "HEAD"]).await;
    let commit_hash = git_output(&["rev-parse", "HEAD"]).await;
    let commit_timestamp = git_output(&["log", "-1", "--format=%ct"])
        .await
        .and_then(|s| s.parse::<i64>().ok());
    let repo = git_output(&["config", "--get", "remote.origin.url"]).await;

    if branch.is_none() || commit_hash.is_none() {
        tracing::warn!("Could not retrieve git info, using defaults");
    }

    let defaults = GitInfo::default();
    GitInfo {
        branch: branch.unwrap_or(defaults.branch),
        commit_hash: commit_hash.unwrap_or(defaults.commit_hash),
        commit_timestamp: commit_timestamp.unwrap_or(defaults.commit_timestamp),
        repo: repo.unwrap_or(defaults.repo),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_git_info_never_fails() {
        let info = git_info().await;
        assert!(!info.branch.is_empty());
        assert!(!info.commit_hash.is_empty());
        assert!(info.commit_timestamp > 0);
    }
}
