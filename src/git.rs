// ABOUTME: Best-effort lookup of the checked-out commit of an application repository.
// ABOUTME: Missing git or a non-repository directory yields None rather than an error.

use std::path::Path;
use tokio::process::Command;

use crate::model::CommitInfo;
use crate::process::run_capture;

/// Hash and subject of `HEAD` in `repo_dir`.
pub async fn head_commit(repo_dir: &Path) -> Option<CommitInfo> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_dir)
        .args(["log", "-1", "--format=%H%n%s"]);

    let output = match run_capture(&mut cmd).await {
        Ok(output) if output.success => output,
        Ok(output) => {
            tracing::debug!("git log failed in {}: {}", repo_dir.display(), output.stderr.trim());
            return None;
        }
        Err(e) => {
            tracing::debug!("git unavailable: {}", e);
            return None;
        }
    };

    parse_log_output(&output.stdout)
}

fn parse_log_output(stdout: &str) -> Option<CommitInfo> {
    let mut lines = stdout.lines();
    let hash = lines.next()?.trim();
    if hash.is_empty() {
        return None;
    }
    let message = lines.next().unwrap_or("").trim();
    Some(CommitInfo {
        hash: hash.to_string(),
        message: message.to_string(),
    })
}
