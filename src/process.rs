// ABOUTME: Child-process helpers shared by the cluster driver and git lookups.
// ABOUTME: Tracked runs stream output lines and die when their deployment is cancelled.

use snafu::ResultExt;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::cancel::DeployContext;
use crate::cluster::{ClusterError, SpawnSnafu};

/// Sink for output lines of a running command.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Lines of output kept for the error message of a failed command.
const ERROR_TAIL_LINES: usize = 20;

/// Captured result of a short-lived command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Render a command line for logs and error messages.
pub fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut out = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

/// Run a command to completion and capture its output.
pub async fn run_capture(cmd: &mut Command) -> Result<CommandOutput, ClusterError> {
    let command = describe(cmd);
    tracing::debug!("Running {}", command);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .context(SpawnSnafu { command })?;

    Ok(CommandOutput {
        code: output.status.code(),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a command registered with the deployment's cancellation context.
///
/// Every stdout and stderr line is passed to `on_line` as it arrives. If the
/// deployment is cancelled the child is killed and `ClusterError::Aborted`
/// is returned.
pub async fn run_tracked(
    mut cmd: Command,
    ctx: &DeployContext,
    on_line: LineSink<'_>,
) -> Result<(), ClusterError> {
    let command = describe(&cmd);
    tracing::debug!("Running {} for deployment {}", command, ctx.deployment_id());

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context(SpawnSnafu {
        command: command.clone(),
    })?;
    let mut kill = ctx.register_process(child.id());

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx.clone()));
    }
    drop(tx);

    let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
    let mut armed = true;
    let mut killed = false;

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    on_line(&line);
                    if tail.len() == ERROR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => break,
            },
            signal = &mut kill, if armed => {
                armed = false;
                // A dropped sender means the context went away, not a kill request.
                if signal.is_ok() {
                    tracing::info!("Killing `{}` after cancellation", command);
                    killed = true;
                    let _ = child.start_kill();
                }
            }
        }
    }

    let status = if armed {
        tokio::select! {
            status = child.wait() => status,
            signal = &mut kill => {
                if signal.is_ok() {
                    killed = true;
                    let _ = child.start_kill();
                }
                child.wait().await
            }
        }
    } else {
        child.wait().await
    }
    .context(SpawnSnafu {
        command: command.clone(),
    })?;

    if killed || ctx.token().is_cancelled() {
        return Err(ClusterError::Aborted);
    }

    if !status.success() {
        return Err(ClusterError::CommandFailed {
            command,
            code: status.code(),
            output: tail.into_iter().collect::<Vec<_>>().join("\n"),
        });
    }

    Ok(())
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}
