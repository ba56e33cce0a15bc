// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts with the two external collaborators the engine dispatches
//! rendered steps to (§5: "Dispatcher and shell contracts"). Concrete
//! implementations live outside this crate — see `devflow-dispatch` — per
//! the Out-of-scope note in §1: this crate defines the seam, never a
//! specific service integration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The outcome of dispatching one rendered step, common to both
/// collaborators (§5).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            error: None,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == 0
    }
}

/// Executes an internal command path with rendered params (§5, §9: a
/// strategy table keyed on the first token of the command string is
/// sufficient — no deep-inheritance command hierarchy is needed).
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        command_path: &str,
        params: &HashMap<String, serde_json::Value>,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> DispatchOutcome;
}

/// Executes a shell command line (the `!`-prefixed form) (§5).
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(
        &self,
        command_line: &str,
        cancel: CancellationToken,
        deadline: Instant,
        env: &HashMap<String, String>,
    ) -> DispatchOutcome;
}
