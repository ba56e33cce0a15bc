// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The evaluation environment passed to the Expression Environment (§3).
//!
//! A [`Scope`] is append-only: `vars` is fixed at construction, and a step's
//! result becomes visible under `results.<name>` only once, at the moment
//! the executor records its terminal status (§3 invariants, §5 shared-
//! resource policy). Concurrent readers never see a partially-written
//! result because [`StepResult::exposed`] is inserted as a single atomic
//! map entry.

use crate::result::StepResult;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The shared evaluation environment for one engine run.
///
/// Cloning a `Scope` is cheap (it shares the underlying results map) so a
/// `ParallelBlock`'s children can each hold a snapshot-equivalent handle
/// without copying already-recorded results; per §3, siblings simply never
/// write to the map until they themselves complete, so they never observe
/// each other regardless of how many clones exist.
#[derive(Clone)]
pub struct Scope {
    vars: Value,
    results: Arc<DashMap<String, Value>>,
}

impl Scope {
    /// Builds the initial scope: document defaults overlaid by caller
    /// variables (§4.8 step 2), with an empty `results` map.
    pub fn new(default_vars: HashMap<String, Value>, caller_vars: HashMap<String, Value>) -> Self {
        let mut merged = default_vars;
        merged.extend(caller_vars);
        Self {
            vars: serde_json::to_value(merged).unwrap_or(Value::Null),
            results: Arc::new(DashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn from_raw(vars: Value, results: Value) -> Self {
        let map = Arc::new(DashMap::new());
        if let Value::Object(obj) = results {
            for (k, v) in obj {
                map.insert(k, v);
            }
        }
        Self { vars, results: map }
    }

    /// Records a step's result into the scope. Called exactly once per
    /// step, from the executor's single result-collection path (§5).
    pub fn record(&self, result: &StepResult) {
        self.results.insert(result.name.clone(), result.exposed());
    }

    /// True once `name`'s result has been recorded.
    pub fn has_result(&self, name: &str) -> bool {
        self.results.contains_key(name)
    }

    /// A point-in-time snapshot suitable for handing to the Expression
    /// Environment: `{ "vars": ..., "results": ... }`.
    pub fn as_value(&self) -> Value {
        let results: serde_json::Map<String, Value> = self
            .results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        serde_json::json!({
            "vars": self.vars,
            "results": Value::Object(results),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::StepStatus;
    use chrono::Utc;

    fn sample_result(name: &str) -> StepResult {
        StepResult {
            name: name.to_string(),
            status: StepStatus::Succeeded,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_seconds: 0.0,
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: 0,
            error_message: None,
            attempts: 1,
            dry_run: false,
        }
    }

    #[test]
    fn results_become_visible_after_record() {
        let scope = Scope::new(HashMap::new(), HashMap::new());
        assert!(!scope.has_result("a"));
        scope.record(&sample_result("a"));
        assert!(scope.has_result("a"));
        let value = scope.as_value();
        assert_eq!(value["results"]["a"]["stdout"], "ok");
    }

    #[test]
    fn caller_vars_win_over_defaults() {
        let mut defaults = HashMap::new();
        defaults.insert("env".to_string(), Value::String("staging".to_string()));
        let mut caller = HashMap::new();
        caller.insert("env".to_string(), Value::String("prod".to_string()));
        let scope = Scope::new(defaults, caller);
        assert_eq!(scope.as_value()["vars"]["env"], "prod");
    }
}
