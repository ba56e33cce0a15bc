// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A [`ShellRunner`] backed by `tokio::process::Command` (§4.13, §5:
//! "cancellation is wired to process termination"). Output is captured
//! lossily as UTF-8; a subprocess that writes invalid UTF-8 to stdout or
//! stderr gets `U+FFFD` replacement characters rather than an error.

use async_trait::async_trait;
use devflow_core::dispatch::{DispatchOutcome, ShellRunner};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs `!`-prefixed step commands as `sh -c <command_line>` subprocesses.
pub struct TokioShellRunner;

impl TokioShellRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellRunner for TokioShellRunner {
    async fn run(
        &self,
        command_line: &str,
        cancel: CancellationToken,
        deadline: Instant,
        env: &HashMap<String, String>,
    ) -> DispatchOutcome {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(command_line)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return DispatchOutcome::failure(-1, "", format!("failed to spawn shell: {e}")),
        };

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let remaining = deadline.saturating_duration_since(Instant::now());

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                DispatchOutcome {
                    exit_code: -1,
                    stdout,
                    stderr,
                    error: Some("cancelled".to_string()),
                }
            }
            _ = tokio::time::sleep(remaining) => {
                let _ = child.kill().await;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                DispatchOutcome {
                    exit_code: -1,
                    stdout,
                    stderr,
                    error: Some("shell command timed out".to_string()),
                }
            }
            status = child.wait() => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                match status {
                    Ok(status) if status.success() => DispatchOutcome {
                        exit_code: status.code().unwrap_or(0),
                        stdout,
                        stderr,
                        error: None,
                    },
                    Ok(status) => {
                        let exit_code = status.code().unwrap_or(-1);
                        DispatchOutcome {
                            exit_code,
                            stdout,
                            error: Some(format!("shell command exited with code {exit_code}")),
                            stderr,
                        }
                    }
                    Err(e) => DispatchOutcome::failure(-1, stderr, format!("failed to wait on shell command: {e}")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let runner = TokioShellRunner::new();
        let outcome = runner
            .run(
                "echo hello",
                CancellationToken::new(),
                Instant::now() + std::time::Duration::from_secs(5),
                &HashMap::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let runner = TokioShellRunner::new();
        let outcome = runner
            .run(
                "exit 3",
                CancellationToken::new(),
                Instant::now() + std::time::Duration::from_secs(5),
                &HashMap::new(),
            )
            .await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn deadline_kills_long_running_command() {
        let runner = TokioShellRunner::new();
        let outcome = runner
            .run(
                "sleep 5",
                CancellationToken::new(),
                Instant::now() + std::time::Duration::from_millis(50),
                &HashMap::new(),
            )
            .await;
        assert!(!outcome.is_success());
    }
}
