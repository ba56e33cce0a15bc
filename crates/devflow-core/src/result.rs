// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The result model (§3, §4.9) and the progress-event observer interface
//! (§4.8, §6).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal (and pre-terminal) status of a step (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    TimedOut,
}

impl StepStatus {
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// A completed step's record (§3). Emitted exactly once per step per run;
/// retries are folded into `attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
    pub duration_seconds: f64,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub dry_run: bool,
}

impl StepResult {
    /// The subset of fields exposed to template rendering as
    /// `results.<name>` (§3: Scope).
    pub fn exposed(&self) -> serde_json::Value {
        serde_json::json!({
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
            "status": self.status,
        })
    }
}

/// A completed parallel block's record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResult {
    pub name: Option<String>,
    pub step_results: Vec<StepResult>,
    pub succeeded_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub status: StepStatus,
}

impl BlockResult {
    pub fn from_children(name: Option<String>, step_results: Vec<StepResult>) -> Self {
        let succeeded_count = step_results
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .count();
        let failed_count = step_results
            .iter()
            .filter(|r| r.status.is_terminal_failure())
            .count();
        let skipped_count = step_results
            .iter()
            .filter(|r| r.status == StepStatus::Skipped)
            .count();
        // succeeded iff every non-skipped child succeeded (§3).
        let status = if step_results
            .iter()
            .filter(|r| r.status != StepStatus::Skipped)
            .all(|r| r.status == StepStatus::Succeeded)
        {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        Self {
            name,
            step_results,
            succeeded_count,
            failed_count,
            skipped_count,
            status,
        }
    }

    /// Overrides the computed status, e.g. when the block itself timed out
    /// (§4.6 block-timeout precedence) rather than failing on a child.
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }
}

/// One top-level entry's result: either a bare step or an entire block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryResult {
    Step(StepResult),
    Block(BlockResult),
}

impl EntryResult {
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Step(s) => s.status,
            Self::Block(b) => b.status,
        }
    }
}

/// The workflow-level aggregate (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub name: String,
    pub entries: Vec<EntryResult>,
    pub status: StepStatus,
}

impl WorkflowResult {
    pub fn new(name: String, entries: Vec<EntryResult>) -> Self {
        // Succeeded iff every non-skipped entry succeeded (§4.8 step 5).
        let status = if entries.iter().all(|e| {
            matches!(e.status(), StepStatus::Succeeded | StepStatus::Skipped)
        }) {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        Self {
            name,
            entries,
            status,
        }
    }

    /// Process exit status per §6: 0 iff `succeeded`.
    pub fn exit_code(&self) -> i32 {
        if self.status == StepStatus::Succeeded {
            0
        } else {
            1
        }
    }
}

/// Progress events observable during a run (§6).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    WorkflowStarted { name: String },
    StepStarted { name: String },
    StepCompleted { name: String, status: StepStatus, duration: Duration },
    BlockStarted { name: Option<String> },
    BlockCompleted { name: Option<String>, status: StepStatus, succeeded: usize, failed: usize, skipped: usize },
    WorkflowCompleted { status: StepStatus },
}

/// Injected into the Engine Facade to receive [`ProgressEvent`]s (§4.8).
/// Implementations must not block significantly; the executor calls this
/// synchronously from the result-collection path.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// An observer that does nothing, for tests and headless embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Logs every event through `tracing` at `info` (§4.11). The reference CLI
/// uses this by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::WorkflowStarted { name } => {
                tracing::info!(workflow = %name, "workflow started")
            }
            ProgressEvent::StepStarted { name } => {
                tracing::info!(step = %name, "step started")
            }
            ProgressEvent::StepCompleted { name, status, duration } => {
                tracing::info!(step = %name, ?status, duration_ms = duration.as_millis(), "step completed")
            }
            ProgressEvent::BlockStarted { name } => {
                tracing::info!(block = name.as_deref().unwrap_or("<anonymous>"), "block started")
            }
            ProgressEvent::BlockCompleted { name, status, succeeded, failed, skipped } => {
                tracing::info!(
                    block = name.as_deref().unwrap_or("<anonymous>"),
                    ?status,
                    succeeded,
                    failed,
                    skipped,
                    "block completed"
                )
            }
            ProgressEvent::WorkflowCompleted { status } => {
                tracing::info!(?status, "workflow completed")
            }
        }
    }
}
