// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Engine Facade (§4.8): the single entry point embedders call to run a
//! validated [`Workflow`] to a [`WorkflowResult`].

use crate::config::EngineConfig;
use crate::dag::Graph;
use crate::dispatch::{CommandDispatcher, ShellRunner};
use crate::error::{Error, Result};
use crate::executor::{DagExecutor, ParallelExecutor};
use crate::expr::Environment;
use crate::rate_limit::RateLimiter;
use crate::result::{EntryResult, Observer, ProgressEvent, StepResult, StepStatus, WorkflowResult};
use crate::runner::StepRunner;
use crate::scope::Scope;
use crate::workflow::{StepFailurePolicy, StepOrBlock, Workflow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// No workflow-level deadline is configured by default (§3.1 only names
/// per-step/per-block timeouts); runs are bounded by this instead of an
/// unrepresentable "no deadline" so every collaborator can keep using
/// `Instant` arithmetic uniformly.
const NO_DEADLINE_HORIZON: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 50);

/// Runs validated workflows to completion (§4.8).
pub struct Engine {
    env: Arc<Environment>,
    dispatcher: Arc<dyn CommandDispatcher>,
    shell: Arc<dyn ShellRunner>,
    observer: Arc<dyn Observer>,
}

impl Engine {
    pub fn new(
        dispatcher: Arc<dyn CommandDispatcher>,
        shell: Arc<dyn ShellRunner>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            env: Arc::new(Environment::new()),
            dispatcher,
            shell,
            observer,
        }
    }

    /// Runs `workflow` to completion (§4.8, steps 1-6).
    ///
    /// `caller_vars` are overlaid on the document's `vars` defaults.
    /// `dry_run` renders every step but never dispatches it. `cancel`, when
    /// triggered, stops admitting new work and lets in-flight steps observe
    /// cancellation on their next check.
    pub async fn run(
        &self,
        workflow: &Workflow,
        config: &EngineConfig,
        caller_vars: HashMap<String, Value>,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<WorkflowResult> {
        workflow.validate()?;

        let scope = Scope::new(workflow.default_vars.clone(), caller_vars);
        let rate_limiter = config.rate_limit_per_second.map(RateLimiter::new);
        let deadline = Instant::now() + NO_DEADLINE_HORIZON;

        self.observer.on_event(ProgressEvent::WorkflowStarted {
            name: workflow.name.clone(),
        });

        let runner = StepRunner::new(
            self.env.clone(),
            self.dispatcher.clone(),
            self.shell.clone(),
            config.default_step_timeout_seconds,
        );

        let entries = if workflow.has_dependencies() {
            self.run_dag_path(workflow, &runner, &scope, rate_limiter.as_ref(), config, dry_run, deadline, cancel)
                .await?
        } else {
            self.run_sequential_path(
                workflow,
                &runner,
                &scope,
                rate_limiter.as_ref(),
                config,
                dry_run,
                deadline,
                cancel,
            )
            .await
        };

        let result = WorkflowResult::new(workflow.name.clone(), entries);
        self.observer.on_event(ProgressEvent::WorkflowCompleted {
            status: result.status,
        });
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_dag_path(
        &self,
        workflow: &Workflow,
        runner: &StepRunner,
        scope: &Scope,
        rate_limiter: Option<&RateLimiter>,
        config: &EngineConfig,
        dry_run: bool,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<Vec<EntryResult>> {
        let steps: Vec<_> = workflow.top_level_steps().into_iter().cloned().collect();
        let graph = Graph::build(&steps).map_err(Error::other)?;
        let executor = DagExecutor::new(runner.clone(), self.observer.clone());

        // The document's own `parallel:` block, when present, overrides the
        // process-wide EngineConfig for this run (§3: document settings win
        // over ambient defaults).
        let max_concurrent = workflow
            .parallel_config
            .as_ref()
            .map(|p| p.max_concurrent)
            .unwrap_or(config.max_concurrent);
        let fail_fast = workflow
            .parallel_config
            .as_ref()
            .map(|p| p.fail_fast)
            .unwrap_or(config.fail_fast);
        let doc_rate_limiter = workflow
            .parallel_config
            .as_ref()
            .and_then(|p| p.rate_limit_per_second)
            .map(RateLimiter::new);
        let effective_rate_limiter = doc_rate_limiter.as_ref().or(rate_limiter);

        let results = executor
            .run_dag(
                &steps,
                &graph,
                scope,
                effective_rate_limiter,
                dry_run,
                max_concurrent,
                fail_fast,
                deadline,
                cancel,
            )
            .await;
        Ok(results.into_iter().map(EntryResult::Step).collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sequential_path(
        &self,
        workflow: &Workflow,
        runner: &StepRunner,
        scope: &Scope,
        rate_limiter: Option<&RateLimiter>,
        config: &EngineConfig,
        dry_run: bool,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Vec<EntryResult> {
        let mut entries = Vec::with_capacity(workflow.steps.len());
        // Set once a failure this sequence doesn't declare `on_failure:
        // continue` for demands halting every later entry (§4.3: a step's
        // own policy governs whether the sequence keeps going, not a
        // workflow-wide knob).
        let mut halt = false;

        for entry in &workflow.steps {
            match entry {
                StepOrBlock::Step(step) => {
                    if halt {
                        let result = skipped_upstream(&step.name);
                        scope.record(&result);
                        entries.push(EntryResult::Step(result));
                        continue;
                    }
                    self.observer.on_event(ProgressEvent::StepStarted {
                        name: step.name.clone(),
                    });
                    let result = runner.run(step, scope, dry_run, deadline, cancel.clone()).await;
                    self.observer.on_event(ProgressEvent::StepCompleted {
                        name: result.name.clone(),
                        status: result.status,
                        duration: Duration::from_secs_f64(result.duration_seconds),
                    });
                    scope.record(&result);
                    if result.status.is_terminal_failure() && step.on_failure != StepFailurePolicy::Continue {
                        halt = true;
                    }
                    entries.push(EntryResult::Step(result));
                }
                StepOrBlock::Parallel { parallel } => {
                    if halt {
                        let skipped: Vec<StepResult> = parallel
                            .steps
                            .iter()
                            .map(|s| skipped_upstream(&s.name))
                            .collect();
                        for r in &skipped {
                            scope.record(r);
                        }
                        let block = crate::result::BlockResult::from_children(
                            parallel.name.clone(),
                            skipped,
                        )
                        .with_status(StepStatus::Skipped);
                        entries.push(EntryResult::Block(block));
                        continue;
                    }
                    let executor = ParallelExecutor::new(runner.clone(), self.observer.clone());
                    let block_result = executor
                        .run_block(
                            parallel,
                            scope,
                            rate_limiter,
                            dry_run,
                            config.max_concurrent,
                            deadline,
                            cancel.clone(),
                        )
                        .await;
                    // A failed block always halts the sequence; unlike a
                    // bare step, a block has no single `on_failure` to defer
                    // to.
                    if block_result.status.is_terminal_failure() {
                        halt = true;
                    }
                    entries.push(EntryResult::Block(block_result));
                }
            }
        }

        entries
    }
}

fn skipped_upstream(name: &str) -> StepResult {
    let now = chrono::Utc::now();
    StepResult {
        name: name.to_string(),
        status: StepStatus::Skipped,
        started_at: now,
        completed_at: now,
        duration_seconds: 0.0,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: 0,
        error_message: Some("skipped: an earlier step failed and fail_fast is enabled".to_string()),
        attempts: 0,
        dry_run: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;
    use crate::result::NoopObserver;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct EchoDispatcher;
    #[async_trait]
    impl CommandDispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            command_path: &str,
            _params: &Map<String, Value>,
            _cancel: CancellationToken,
            _deadline: Instant,
        ) -> DispatchOutcome {
            if command_path == "fail" {
                DispatchOutcome::failure(1, "boom", "boom")
            } else {
                DispatchOutcome::ok(command_path)
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

    fn engine() -> Engine {
        Engine::new(Arc::new(EchoDispatcher), Arc::new(NoopShell), Arc::new(NoopObserver))
    }

    #[tokio::test]
    async fn sequential_workflow_runs_in_order() {
        let workflow = Workflow::load(
            "name: w\nsteps:\n  - name: a\n    command: a\n  - name: b\n    command: b\n",
        )
        .unwrap();
        let config = EngineConfig::default();
        let result = engine()
            .run(&workflow, &config, HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.entries.len(), 2);
    }

    #[tokio::test]
    async fn sequential_fail_fast_skips_later_steps() {
        let workflow = Workflow::load(
            "name: w\nsteps:\n  - name: a\n    command: fail\n  - name: b\n    command: b\n",
        )
        .unwrap();
        let config = EngineConfig {
            fail_fast: true,
            ..EngineConfig::default()
        };
        let result = engine()
            .run(&workflow, &config, HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        let EntryResult::Step(b) = &result.entries[1] else { panic!("expected step") };
        assert_eq!(b.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn on_failure_continue_does_not_halt_later_steps() {
        let workflow = Workflow::load(
            "name: w\nsteps:\n  - name: a\n    command: fail\n    on_failure: continue\n  - name: b\n    command: b\n",
        )
        .unwrap();
        let config = EngineConfig {
            fail_fast: true,
            ..EngineConfig::default()
        };
        let result = engine()
            .run(&workflow, &config, HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        let EntryResult::Step(b) = &result.entries[1] else { panic!("expected step") };
        assert_eq!(b.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_parallel_block_halts_sequence_even_without_fail_fast() {
        let workflow = Workflow::load(
            "name: w\nsteps:\n  - parallel:\n      steps:\n        - name: a\n          command: fail\n  - name: b\n    command: b\n",
        )
        .unwrap();
        let config = EngineConfig {
            fail_fast: false,
            ..EngineConfig::default()
        };
        let result = engine()
            .run(&workflow, &config, HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        let EntryResult::Step(b) = &result.entries[1] else { panic!("expected step") };
        assert_eq!(b.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn dag_workflow_runs_via_dependency_edges() {
        let workflow = Workflow::load(
            "name: w\nsteps:\n  - name: a\n    command: a\n  - name: b\n    command: b\n    depends_on: [a]\n",
        )
        .unwrap();
        let config = EngineConfig::default();
        let result = engine()
            .run(&workflow, &config, HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn document_parallel_config_overrides_engine_fail_fast_on_dag_path() {
        // `fail_fast: false` in the document's own `parallel:` block should
        // win over the process-wide EngineConfig default of `true`, letting
        // the sibling branch run instead of being cancelled.
        let workflow = Workflow::load(
            "name: w\nparallel:\n  fail_fast: false\nsteps:\n  - name: a\n    command: fail\n  - name: b\n    command: b\n  - name: c\n    command: c\n    depends_on: [b]\n",
        )
        .unwrap();
        let config = EngineConfig::default();
        let result = engine()
            .run(&workflow, &config, HashMap::new(), false, CancellationToken::new())
            .await
            .unwrap();
        let EntryResult::Step(c) = &result.entries[2] else { panic!("expected step") };
        assert_eq!(c.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn dry_run_does_not_invoke_dispatcher_failures() {
        let workflow = Workflow::load("name: w\nsteps:\n  - name: a\n    command: fail\n").unwrap();
        let config = EngineConfig::default();
        let result = engine()
            .run(&workflow, &config, HashMap::new(), true, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Succeeded);
    }
}
