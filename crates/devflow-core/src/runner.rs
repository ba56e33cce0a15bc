// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Step Runner (§4.4): dispatches one rendered step to a terminal
//! [`StepResult`]. Never reads or writes the [`Scope`] itself — scope
//! updates are the executor's responsibility (§4.4, §5).

use crate::dispatch::{CommandDispatcher, DispatchOutcome, ShellRunner};
use crate::expr::Environment;
use crate::result::{StepResult, StepStatus};
use crate::retry::backoff_delay;
use crate::scope::Scope;
use crate::workflow::{Step, StepFailurePolicy};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Executes a single step to a terminal result (§4.4).
///
/// Holds its collaborators behind `Arc` rather than borrowing them so that a
/// runner can be cloned into a `tokio::spawn`ed task by the Parallel
/// Executor without fighting lifetimes (§4.6).
#[derive(Clone)]
pub struct StepRunner {
    pub env: Arc<Environment>,
    pub dispatcher: Arc<dyn CommandDispatcher>,
    pub shell: Arc<dyn ShellRunner>,
    /// Fallback applied when a step declares no `timeout_seconds` of its
    /// own (§3.1 `default_step_timeout_seconds`).
    pub default_step_timeout_seconds: Option<u64>,
}

impl StepRunner {
    pub fn new(
        env: Arc<Environment>,
        dispatcher: Arc<dyn CommandDispatcher>,
        shell: Arc<dyn ShellRunner>,
        default_step_timeout_seconds: Option<u64>,
    ) -> Self {
        Self {
            env,
            dispatcher,
            shell,
            default_step_timeout_seconds,
        }
    }

    /// §4.4 algorithm, steps 1-6.
    pub async fn run(
        &self,
        step: &Step,
        scope: &Scope,
        dry_run: bool,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> StepResult {
        let started_at = chrono::Utc::now();
        let start_instant = Instant::now();

        // Step 1: evaluate the condition, if any.
        if let Some(condition) = &step.condition {
            match self.env.render_bool(condition, scope) {
                Ok(false) => return skipped(step, started_at, start_instant),
                Ok(true) => {}
                Err(reason) => {
                    return self
                        .terminal_from_render_error(step, started_at, start_instant, reason, dry_run)
                }
            }
        }

        // Step 2: render the command and every param value.
        let rendered_command = match self.env.render(&step.command, scope) {
            Ok(c) => c,
            Err(reason) => {
                return self
                    .terminal_from_render_error(step, started_at, start_instant, reason, dry_run)
            }
        };
        let mut rendered_params = HashMap::new();
        for (key, value) in &step.params {
            let rendered = match render_value(&self.env, value, scope) {
                Ok(v) => v,
                Err(reason) => {
                    return self.terminal_from_render_error(
                        step,
                        started_at,
                        start_instant,
                        reason,
                        dry_run,
                    )
                }
            };
            rendered_params.insert(key.clone(), rendered);
        }

        // Step 4: dry-run short-circuit.
        if dry_run {
            let action = if let Some(shell_cmd) = rendered_command.strip_prefix('!') {
                format!("run shell command: {shell_cmd}")
            } else {
                format!("dispatch command '{rendered_command}' with params {rendered_params:?}")
            };
            return StepResult {
                name: step.name.clone(),
                status: StepStatus::Succeeded,
                started_at,
                completed_at: chrono::Utc::now(),
                duration_seconds: start_instant.elapsed().as_secs_f64(),
                stdout: format!("[dry-run] would {action}"),
                stderr: String::new(),
                exit_code: 0,
                error_message: None,
                attempts: 1,
                dry_run: true,
            };
        }

        // Steps 3, 5, 6: dispatch with timeout/retry.
        let timeout_seconds = step.timeout_seconds.or(self.default_step_timeout_seconds);
        let effective_deadline = match timeout_seconds {
            Some(secs) => deadline.min(Instant::now() + std::time::Duration::from_secs(secs)),
            None => deadline,
        };

        let max_attempts = match step.on_failure {
            StepFailurePolicy::Retry => step.retries + 1,
            _ => 1,
        };

        let mut attempts = 0u32;
        let mut last_outcome: Option<DispatchOutcome> = None;
        let mut timed_out = false;
        let mut cancelled = false;

        while attempts < max_attempts {
            attempts += 1;
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let remaining = effective_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }

            let outcome = dispatch_once(
                self.dispatcher.as_ref(),
                self.shell.as_ref(),
                &rendered_command,
                &rendered_params,
                cancel.clone(),
                effective_deadline,
                remaining,
            )
            .await;

            match outcome {
                DispatchAttempt::Outcome(o) => {
                    let success = o.is_success();
                    last_outcome = Some(o);
                    if success {
                        break;
                    }
                    if !matches!(step.on_failure, StepFailurePolicy::Retry) || attempts >= max_attempts {
                        break;
                    }
                    let delay = backoff_delay(attempts);
                    let sleep_deadline = Instant::now() + delay;
                    if sleep_deadline >= effective_deadline {
                        tokio::time::sleep(effective_deadline.saturating_duration_since(Instant::now()))
                            .await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                DispatchAttempt::TimedOut => {
                    timed_out = true;
                    break;
                }
                DispatchAttempt::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        let completed_at = chrono::Utc::now();
        let duration_seconds = start_instant.elapsed().as_secs_f64();

        if cancelled {
            return StepResult {
                name: step.name.clone(),
                status: StepStatus::Cancelled,
                started_at,
                completed_at,
                duration_seconds,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: -1,
                error_message: Some("cancelled".to_string()),
                attempts,
                dry_run: false,
            };
        }

        if timed_out {
            return StepResult {
                name: step.name.clone(),
                status: StepStatus::TimedOut,
                started_at,
                completed_at,
                duration_seconds,
                stdout: last_outcome.as_ref().map(|o| o.stdout.clone()).unwrap_or_default(),
                stderr: last_outcome.as_ref().map(|o| o.stderr.clone()).unwrap_or_default(),
                exit_code: -1,
                error_message: Some(format!(
                    "timed out after {duration_seconds:.3}s"
                )),
                attempts,
                dry_run: false,
            };
        }

        let outcome = last_outcome.unwrap_or_else(|| {
            DispatchOutcome::failure(-1, "", "dispatch produced no outcome")
        });

        if outcome.is_success() {
            StepResult {
                name: step.name.clone(),
                status: StepStatus::Succeeded,
                started_at,
                completed_at,
                duration_seconds,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code,
                error_message: None,
                attempts,
                dry_run: false,
            }
        } else {
            StepResult {
                name: step.name.clone(),
                status: StepStatus::Failed,
                started_at,
                completed_at,
                duration_seconds,
                stdout: outcome.stdout,
                stderr: outcome.stderr.clone(),
                exit_code: outcome.exit_code,
                error_message: Some(
                    outcome
                        .error
                        .unwrap_or_else(|| format!("command exited with code {}", outcome.exit_code)),
                ),
                attempts,
                dry_run: false,
            }
        }
    }

    fn terminal_from_render_error(
        &self,
        step: &Step,
        started_at: chrono::DateTime<chrono::Utc>,
        start_instant: Instant,
        reason: String,
        dry_run: bool,
    ) -> StepResult {
        StepResult {
            name: step.name.clone(),
            status: StepStatus::Failed,
            started_at,
            completed_at: chrono::Utc::now(),
            duration_seconds: start_instant.elapsed().as_secs_f64(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            error_message: Some(format!("render error: {reason}")),
            attempts: 1,
            dry_run,
        }
    }
}

enum DispatchAttempt {
    Outcome(DispatchOutcome),
    TimedOut,
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_once(
    dispatcher: &dyn CommandDispatcher,
    shell: &dyn ShellRunner,
    rendered_command: &str,
    rendered_params: &HashMap<String, Value>,
    cancel: CancellationToken,
    deadline: Instant,
    remaining: std::time::Duration,
) -> DispatchAttempt {
    let dispatch_future = async {
        if let Some(shell_cmd) = rendered_command.strip_prefix('!') {
            let env: HashMap<String, String> = HashMap::new();
            shell.run(shell_cmd.trim(), cancel.clone(), deadline, &env).await
        } else {
            dispatcher
                .dispatch(rendered_command, rendered_params, cancel.clone(), deadline)
                .await
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => DispatchAttempt::Cancelled,
        result = tokio::time::timeout(remaining, dispatch_future) => match result {
            Ok(outcome) => DispatchAttempt::Outcome(outcome),
            Err(_) => DispatchAttempt::TimedOut,
        },
    }
}

fn render_value(env: &Environment, value: &Value, scope: &Scope) -> Result<Value, String> {
    match value {
        Value::String(s) => env.render(s, scope).map(Value::String),
        other => Ok(other.clone()),
    }
}

fn skipped(step: &Step, started_at: chrono::DateTime<chrono::Utc>, start_instant: Instant) -> StepResult {
    StepResult {
        name: step.name.clone(),
        status: StepStatus::Skipped,
        started_at,
        completed_at: chrono::Utc::now(),
        duration_seconds: start_instant.elapsed().as_secs_f64(),
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 0,
        error_message: Some("skipped: condition evaluated to false".to_string()),
        attempts: 0,
        dry_run: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingDispatcher {
        fail_until_attempt: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CommandDispatcher for CountingDispatcher {
        async fn dispatch(
            &self,
            _command_path: &str,
            _params: &Map<String, Value>,
            _cancel: CancellationToken,
            _deadline: Instant,
        ) -> DispatchOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.fail_until_attempt {
                DispatchOutcome::failure(1, "boom", "boom")
            } else {
                DispatchOutcome::ok("done")
            }
        }
    }

    struct NoopShell;
    #[async_trait]
    impl ShellRunner for NoopShell {
        async fn run(
            &self,
            _command_line: &str,
            _cancel: CancellationToken,
            _deadline: Instant,
            _env: &Map<String, String>,
        ) -> DispatchOutcome {
            DispatchOutcome::ok("")
        }
    }

    fn base_step() -> Step {
        Step {
            name: "s".to_string(),
            command: "test".to_string(),
            params: Map::new(),
            condition: None,
            on_failure: StepFailurePolicy::Fail,
            retries: 0,
            timeout_seconds: None,
            depends_on: Default::default(),
        }
    }

    #[tokio::test]
    async fn retries_until_success_records_attempts() {
        let env = Environment::new();
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = CountingDispatcher {
            fail_until_attempt: 3,
            calls: calls.clone(),
        };
        let shell = NoopShell;
        let runner = StepRunner::new(Arc::new(env), Arc::new(dispatcher), Arc::new(shell), None);

        let mut step = base_step();
        step.on_failure = StepFailurePolicy::Retry;
        step.retries = 3;

        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let result = runner
            .run(&step, &scope, false, deadline, CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn condition_false_skips_without_dispatch() {
        let env = Environment::new();
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = CountingDispatcher {
            fail_until_attempt: 1,
            calls: calls.clone(),
        };
        let shell = NoopShell;
        let runner = StepRunner::new(Arc::new(env), Arc::new(dispatcher), Arc::new(shell), None);

        let mut step = base_step();
        step.condition = Some("false".to_string());

        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let result = runner
            .run(&step, &scope, false, deadline, CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn default_step_timeout_applies_when_step_has_none() {
        let env = Environment::new();
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = CountingDispatcher {
            fail_until_attempt: 1,
            calls: calls.clone(),
        };
        let shell = NoopShell;
        let runner = StepRunner::new(Arc::new(env), Arc::new(dispatcher), Arc::new(shell), Some(0));

        let step = base_step();
        assert!(step.timeout_seconds.is_none());
        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let result = runner
            .run(&step, &scope, false, deadline, CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::TimedOut);
    }

    #[tokio::test]
    async fn dry_run_never_dispatches() {
        let env = Environment::new();
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher = CountingDispatcher {
            fail_until_attempt: 1,
            calls: calls.clone(),
        };
        let shell = NoopShell;
        let runner = StepRunner::new(Arc::new(env), Arc::new(dispatcher), Arc::new(shell), None);

        let step = base_step();
        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        let result = runner
            .run(&step, &scope, true, deadline, CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Succeeded);
        assert!(result.dry_run);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
