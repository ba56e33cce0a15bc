// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Parallel and DAG executors (§4.6, §4.7).
//!
//! Both execute one layer/block of ready steps with bounded concurrency via
//! `tokio::sync::Semaphore` + `tokio::task::JoinSet`, the pattern this crate
//! takes from the wave-based executor design in the broader workflow-engine
//! corpus rather than the hand-rolled `tasks.len() >= max_concurrency`
//! polling loop an earlier generation of this engine used.

use crate::rate_limit::RateLimiter;
use crate::result::{BlockResult, Observer, ProgressEvent, StepResult, StepStatus};
use crate::runner::StepRunner;
use crate::scope::Scope;
use crate::workflow::{BlockFailurePolicy, ParallelBlock, Step};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs a list of steps with bounded concurrency, honoring a
/// [`ParallelBlock`]'s failure policy (§4.6).
pub struct ParallelExecutor {
    pub runner: StepRunner,
    pub observer: Arc<dyn Observer>,
}

impl ParallelExecutor {
    pub fn new(runner: StepRunner, observer: Arc<dyn Observer>) -> Self {
        Self { runner, observer }
    }

    /// Executes every step in `block` concurrently, bounded by
    /// `block.max_concurrent` (falling back to `default_max_concurrent`),
    /// optionally rate-limited, and stops admitting new steps once the
    /// block's failure policy says to (§4.6).
    #[allow(clippy::too_many_arguments)]
    pub async fn run_block(
        &self,
        block: &ParallelBlock,
        scope: &Scope,
        rate_limiter: Option<&RateLimiter>,
        dry_run: bool,
        default_max_concurrent: usize,
        caller_deadline: Instant,
        cancel: CancellationToken,
    ) -> BlockResult {
        self.observer.on_event(ProgressEvent::BlockStarted {
            name: block.name.clone(),
        });

        let block_deadline = match block.timeout_seconds {
            Some(secs) => caller_deadline.min(Instant::now() + Duration::from_secs(secs)),
            None => caller_deadline,
        };

        let max_concurrent = block.max_concurrent.unwrap_or(default_max_concurrent).max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let block_cancel = cancel.child_token();
        let abort_new = Arc::new(AtomicBool::new(false));

        let mut joinset: JoinSet<(usize, StepResult)> = JoinSet::new();
        let mut slots: Vec<Option<StepResult>> = vec![None; block.steps.len()];
        let mut steps_iter = block.steps.iter().enumerate();

        // Admit steps up to max_concurrent, then keep topping up the pool as
        // tasks complete, checking the failure policy between completions.
        // Results are written into `slots` by each step's declared position
        // rather than completion order, so `block.steps`' order survives
        // into the final `BlockResult`.
        loop {
            while !abort_new.load(Ordering::SeqCst) {
                let Some((index, step)) = steps_iter.next() else { break };
                if let Some(limiter) = rate_limiter {
                    if !limiter.acquire(block_deadline).await {
                        slots[index] = Some(timed_out_without_dispatch(step));
                        continue;
                    }
                }
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let runner = self.runner.clone();
                let step = step.clone();
                let scope = scope.clone();
                let cancel = block_cancel.clone();
                self.observer.on_event(ProgressEvent::StepStarted {
                    name: step.name.clone(),
                });
                joinset.spawn(async move {
                    let _permit = permit;
                    let result = runner.run(&step, &scope, dry_run, block_deadline, cancel).await;
                    (index, result)
                });
                // Only keep the pool topped up to max_concurrent at a time;
                // break out to let spawned tasks make progress once full.
                if joinset.len() >= max_concurrent {
                    break;
                }
            }

            let Some(joined) = joinset.join_next().await else {
                break;
            };
            let (index, result) = joined.expect("step task panicked");
            self.observer.on_event(ProgressEvent::StepCompleted {
                name: result.name.clone(),
                status: result.status,
                duration: Duration::from_secs_f64(result.duration_seconds),
            });
            scope.record(&result);

            if result.status.is_terminal_failure() {
                match block.on_failure {
                    BlockFailurePolicy::FailAll => {
                        abort_new.store(true, Ordering::SeqCst);
                        block_cancel.cancel();
                    }
                    BlockFailurePolicy::CompleteRunning => {
                        abort_new.store(true, Ordering::SeqCst);
                    }
                    BlockFailurePolicy::Continue => {}
                }
            }
            slots[index] = Some(result);
        }

        // Steps the abort above never got to admit don't get silently
        // dropped: they're recorded as cancelled so every declared step
        // still has exactly one result.
        for (index, step) in steps_iter {
            let result = cancelled_unscheduled(step);
            scope.record(&result);
            slots[index] = Some(result);
        }

        let results: Vec<StepResult> = slots.into_iter().map(|s| s.expect("every slot filled")).collect();
        let block_result = BlockResult::from_children(block.name.clone(), results);
        self.observer.on_event(ProgressEvent::BlockCompleted {
            name: block_result.name.clone(),
            status: block_result.status,
            succeeded: block_result.succeeded_count,
            failed: block_result.failed_count,
            skipped: block_result.skipped_count,
        });
        block_result
    }
}

fn cancelled_unscheduled(step: &Step) -> StepResult {
    let now = chrono::Utc::now();
    StepResult {
        name: step.name.clone(),
        status: StepStatus::Cancelled,
        started_at: now,
        completed_at: now,
        duration_seconds: 0.0,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: -1,
        error_message: Some("cancelled: block aborted before this step was scheduled".to_string()),
        attempts: 0,
        dry_run: false,
    }
}

fn timed_out_without_dispatch(step: &Step) -> StepResult {
    let now = chrono::Utc::now();
    StepResult {
        name: step.name.clone(),
        status: StepStatus::TimedOut,
        started_at: now,
        completed_at: now,
        duration_seconds: 0.0,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: -1,
        error_message: Some("timed out waiting for a rate-limit token".to_string()),
        attempts: 0,
        dry_run: false,
    }
}

/// Runs a workflow's top-level steps honoring `depends_on` edges (§4.7),
/// layer by layer, with the same bounded concurrency as [`ParallelExecutor`]
/// within each layer.
pub struct DagExecutor {
    pub runner: StepRunner,
    pub observer: Arc<dyn Observer>,
}

impl DagExecutor {
    pub fn new(runner: StepRunner, observer: Arc<dyn Observer>) -> Self {
        Self { runner, observer }
    }

    /// Executes `steps` according to `graph`'s layering. `fail_fast`
    /// modulates what happens once a step fails (§4.7): when true, no step
    /// whose dependencies aren't already complete is admitted after the
    /// first failure; when false, every step whose dependencies succeeded
    /// still runs, and only steps downstream of a failure are skipped.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_dag(
        &self,
        steps: &[Step],
        graph: &crate::dag::Graph,
        scope: &Scope,
        rate_limiter: Option<&RateLimiter>,
        dry_run: bool,
        max_concurrent: usize,
        fail_fast: bool,
        caller_deadline: Instant,
        cancel: CancellationToken,
    ) -> Vec<StepResult> {
        let by_name: std::collections::HashMap<&str, &Step> =
            steps.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results = Vec::with_capacity(steps.len());
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut any_failed = false;

        while completed.len() < graph.len() {
            let ready = graph.ready(&completed);
            if ready.is_empty() {
                break;
            }

            let mut joinset: JoinSet<StepResult> = JoinSet::new();
            for name in ready {
                let step = by_name[name.as_str()];
                let depends_on_failed = step.depends_on.iter().any(|d| failed.contains(d));
                if depends_on_failed {
                    let result = cancelled_upstream(step);
                    completed.insert(name.clone());
                    failed.insert(name.clone());
                    self.observer.on_event(ProgressEvent::StepCompleted {
                        name: result.name.clone(),
                        status: result.status,
                        duration: Duration::from_secs_f64(result.duration_seconds),
                    });
                    scope.record(&result);
                    results.push(result);
                    continue;
                }
                if any_failed && fail_fast {
                    let result = cancelled_upstream(step);
                    completed.insert(name.clone());
                    scope.record(&result);
                    results.push(result);
                    continue;
                }

                if let Some(limiter) = rate_limiter {
                    if !limiter.acquire(caller_deadline).await {
                        let result = timed_out_without_dispatch(step);
                        completed.insert(name.clone());
                        failed.insert(name.clone());
                        scope.record(&result);
                        results.push(result);
                        continue;
                    }
                }

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let runner = self.runner.clone();
                let step_owned = step.clone();
                let scope_clone = scope.clone();
                let cancel_clone = cancel.clone();
                self.observer.on_event(ProgressEvent::StepStarted {
                    name: step.name.clone(),
                });
                joinset.spawn(async move {
                    let _permit = permit;
                    runner
                        .run(&step_owned, &scope_clone, dry_run, caller_deadline, cancel_clone)
                        .await
                });
            }

            while let Some(joined) = joinset.join_next().await {
                let result = joined.expect("step task panicked");
                completed.insert(result.name.clone());
                self.observer.on_event(ProgressEvent::StepCompleted {
                    name: result.name.clone(),
                    status: result.status,
                    duration: Duration::from_secs_f64(result.duration_seconds),
                });
                scope.record(&result);
                if result.status.is_terminal_failure() {
                    failed.insert(result.name.clone());
                    any_failed = true;
                    if fail_fast {
                        cancel.cancel();
                    }
                }
                results.push(result);
            }
        }

        results
    }
}

fn cancelled_upstream(step: &Step) -> StepResult {
    let now = chrono::Utc::now();
    StepResult {
        name: step.name.clone(),
        status: StepStatus::Cancelled,
        started_at: now,
        completed_at: now,
        duration_seconds: 0.0,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: -1,
        error_message: Some("cancelled: an upstream dependency failed".to_string()),
        attempts: 0,
        dry_run: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Graph;
    use crate::dispatch::{CommandDispatcher, DispatchOutcome, ShellRunner};
    use crate::expr::Environment;
    use crate::result::NoopObserver;
    use crate::workflow::StepFailurePolicy;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    struct ScriptedDispatcher {
        fails: HashSet<String>,
        concurrent: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandDispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            command_path: &str,
            _params: &Map<String, serde_json::Value>,
            _cancel: CancellationToken,
            _deadline: Instant,
        ) -> DispatchOutcome {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if self.fails.contains(command_path) {
                DispatchOutcome::failure(1, "boom", "boom")
            } else {
                DispatchOutcome::ok("ok")
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

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            command: name.to_string(),
            params: Map::new(),
            condition: None,
            on_failure: StepFailurePolicy::Fail,
            retries: 0,
            timeout_seconds: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn parallel_block_respects_max_concurrent() {
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let dispatcher = ScriptedDispatcher {
            fails: HashSet::new(),
            concurrent: concurrent.clone(),
            max_observed: max_observed.clone(),
        };
        let runner = StepRunner::new(Arc::new(Environment::new()), Arc::new(dispatcher), Arc::new(NoopShell), None);
        let executor = ParallelExecutor::new(runner, Arc::new(NoopObserver));

        let block = ParallelBlock {
            name: Some("b".to_string()),
            steps: (0..6).map(|i| step(&format!("s{i}"), &[])).collect(),
            on_failure: BlockFailurePolicy::Continue,
            timeout_seconds: None,
            max_concurrent: Some(2),
        };

        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + StdDuration::from_secs(5);
        let result = executor
            .run_block(&block, &scope, None, false, 10, deadline, CancellationToken::new())
            .await;

        assert_eq!(result.succeeded_count, 6);
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn fail_all_cancels_remaining_siblings() {
        let dispatcher = ScriptedDispatcher {
            fails: ["s0".to_string()].into_iter().collect(),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let runner = StepRunner::new(Arc::new(Environment::new()), Arc::new(dispatcher), Arc::new(NoopShell), None);
        let executor = ParallelExecutor::new(runner, Arc::new(NoopObserver));

        let block = ParallelBlock {
            name: None,
            steps: vec![step("s0", &[]), step("s1", &[]), step("s2", &[])],
            on_failure: BlockFailurePolicy::FailAll,
            timeout_seconds: None,
            max_concurrent: Some(1),
        };

        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + StdDuration::from_secs(5);
        let result = executor
            .run_block(&block, &scope, None, false, 10, deadline, CancellationToken::new())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.step_results.len(), 3);
        // s0 fails; with max_concurrent 1, s1/s2 never get scheduled and are
        // recorded as cancelled rather than vanishing from the result.
        let s0 = result.step_results.iter().find(|r| r.name == "s0").unwrap();
        assert_eq!(s0.status, StepStatus::Failed);
        for name in ["s1", "s2"] {
            let r = result.step_results.iter().find(|r| r.name == name).unwrap();
            assert_eq!(r.status, StepStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn dag_layers_execute_in_dependency_order() {
        let dispatcher = ScriptedDispatcher {
            fails: HashSet::new(),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let runner = StepRunner::new(Arc::new(Environment::new()), Arc::new(dispatcher), Arc::new(NoopShell), None);
        let executor = DagExecutor::new(runner, Arc::new(NoopObserver));

        let steps = vec![
            step("checkout", &[]),
            step("build-a", &["checkout"]),
            step("build-b", &["checkout"]),
            step("deploy", &["build-a", "build-b"]),
        ];
        let graph = Graph::build(&steps).unwrap();
        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + StdDuration::from_secs(5);
        let results = executor
            .run_dag(&steps, &graph, &scope, None, false, 10, true, deadline, CancellationToken::new())
            .await;

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn dag_fail_fast_skips_downstream() {
        let dispatcher = ScriptedDispatcher {
            fails: ["checkout".to_string()].into_iter().collect(),
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        };
        let runner = StepRunner::new(Arc::new(Environment::new()), Arc::new(dispatcher), Arc::new(NoopShell), None);
        let executor = DagExecutor::new(runner, Arc::new(NoopObserver));

        let steps = vec![step("checkout", &[]), step("build", &["checkout"])];
        let graph = Graph::build(&steps).unwrap();
        let scope = Scope::new(Map::new(), Map::new());
        let deadline = Instant::now() + StdDuration::from_secs(5);
        let results = executor
            .run_dag(&steps, &graph, &scope, None, false, 10, true, deadline, CancellationToken::new())
            .await;

        let build_result = results.iter().find(|r| r.name == "build").unwrap();
        assert_eq!(build_result.status, StepStatus::Cancelled);
    }
}
