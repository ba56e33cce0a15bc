// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The workflow document model (§3, §4.1).
//!
//! A [`Workflow`] is the validated, immutable representation of a document
//! loaded from YAML. Construction always goes through [`Workflow::load`],
//! which applies every validation rule in §4.1 and collects failures rather
//! than bailing on the first one.

use crate::error::ValidationError;
use crate::expr::Environment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Failure policy for a single [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepFailurePolicy {
    #[default]
    Fail,
    Continue,
    Retry,
}

/// Failure policy for a [`ParallelBlock`] (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockFailurePolicy {
    #[default]
    FailAll,
    Continue,
    CompleteRunning,
}

/// A single dispatchable unit (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Either an internal command path (`aws s3 ls`) or, when prefixed with
    /// `!`, a shell command line.
    pub command: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_failure: StepFailurePolicy,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub depends_on: HashSet<String>,
}

impl Step {
    /// True when `command` selects shell dispatch (§4.4 step 3).
    pub fn is_shell(&self) -> bool {
        self.command.starts_with('!')
    }
}

/// An explicit concurrent group of steps (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBlock {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub on_failure: BlockFailurePolicy,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

/// One entry of the workflow's top-level `steps` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepOrBlock {
    Step(Step),
    Parallel { parallel: ParallelBlock },
}

impl StepOrBlock {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Step(s) => Some(s.name.as_str()),
            Self::Parallel { parallel } => parallel.name.as_deref(),
        }
    }
}

/// Global default concurrency/rate-limit/fail-fast settings (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default, alias = "rate_limit")]
    pub rate_limit_per_second: Option<f64>,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_fail_fast() -> bool {
    true
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            rate_limit_per_second: None,
            fail_fast: default_fail_fast(),
        }
    }
}

/// The raw, not-yet-validated shape of a workflow document. Deserialized
/// directly from YAML; [`Workflow::load`] turns it into a validated
/// [`Workflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "vars")]
    pub default_vars: HashMap<String, Value>,
    #[serde(default)]
    pub parallel: Option<BlockConfig>,
    pub steps: Vec<StepOrBlock>,
}

/// The validated, immutable workflow document (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub default_vars: HashMap<String, Value>,
    pub steps: Vec<StepOrBlock>,
    pub parallel_config: Option<BlockConfig>,
}

impl Workflow {
    /// Parses and validates a workflow document (§4.1: `load(raw) ->
    /// Workflow | ValidationError`).
    pub fn load(raw: &str) -> Result<Self, ValidationError> {
        let raw: RawWorkflow = serde_yaml::from_str(raw)
            .map_err(|e| ValidationError::MalformedTemplate("<document>".into(), e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Validates an already-deserialized document.
    pub fn from_raw(raw: RawWorkflow) -> Result<Self, ValidationError> {
        let workflow = Self {
            name: raw.name,
            description: raw.description,
            default_vars: raw.default_vars,
            steps: raw.steps,
            parallel_config: raw.parallel,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// Re-runs every rule in §4.1. Used by `load`/`from_raw`, and exposed so
    /// callers that mutate a workflow in-memory (tests, the `validate`
    /// reference-CLI subcommand) can re-check it.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            errors.push(ValidationError::NoSteps);
        }

        let mut seen = HashSet::new();
        let mut all_names = HashSet::new();
        for entry in &self.steps {
            if let Some(name) = entry.name() {
                all_names.insert(name.to_string());
            }
            if let StepOrBlock::Step(step) = entry {
                all_names.insert(step.name.clone());
            }
            if let StepOrBlock::Parallel { parallel } = entry {
                for s in &parallel.steps {
                    all_names.insert(s.name.clone());
                }
            }
        }

        for entry in &self.steps {
            match entry {
                StepOrBlock::Step(step) => {
                    self.validate_step(step, &all_names, &mut seen, &mut errors);
                }
                StepOrBlock::Parallel { parallel } => {
                    if let Some(name) = &parallel.name {
                        if !seen.insert(name.clone()) {
                            errors.push(ValidationError::DuplicateName(name.clone()));
                        }
                    }
                    for step in &parallel.steps {
                        self.validate_step(step, &all_names, &mut seen, &mut errors);
                    }
                }
            }
        }

        if let Err(cycle) = crate::dag::detect_cycle(&self.steps) {
            errors.push(ValidationError::Cycle(cycle));
        }

        let has_blocks = self
            .steps
            .iter()
            .any(|e| matches!(e, StepOrBlock::Parallel { .. }));
        if has_blocks && self.has_dependencies() {
            errors.push(ValidationError::MixedExecutionModes);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.into_iter().next().unwrap())
        } else {
            Err(ValidationError::Many(errors))
        }
    }

    fn validate_step(
        &self,
        step: &Step,
        all_names: &HashSet<String>,
        seen: &mut HashSet<String>,
        errors: &mut Vec<ValidationError>,
    ) {
        if !seen.insert(step.name.clone()) {
            errors.push(ValidationError::DuplicateName(step.name.clone()));
        }
        if step.retries > 0 && step.on_failure != StepFailurePolicy::Retry {
            errors.push(ValidationError::RetriesWithoutRetryPolicy(step.name.clone()));
        }
        if let Some(timeout) = step.timeout_seconds {
            if timeout == 0 {
                errors.push(ValidationError::NonPositiveTimeout(step.name.clone(), 0));
            }
        }
        for dep in &step.depends_on {
            if dep == &step.name {
                errors.push(ValidationError::SelfDependency(step.name.clone()));
            } else if !all_names.contains(dep) {
                errors.push(ValidationError::UnknownDependency(
                    step.name.clone(),
                    dep.clone(),
                ));
            }
        }
        for template in [Some(&step.command), step.condition.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = Environment::check_syntax(template) {
                errors.push(ValidationError::MalformedTemplate(step.name.clone(), e));
            }
        }
        for value in step.params.values() {
            if let Value::String(s) = value {
                if let Err(e) = Environment::check_syntax(s) {
                    errors.push(ValidationError::MalformedTemplate(step.name.clone(), e));
                }
            }
        }
    }

    /// True iff any step anywhere in the workflow declares a predecessor —
    /// the signal the Engine Facade uses to pick DAG vs sequential mode.
    pub fn has_dependencies(&self) -> bool {
        self.steps.iter().any(|entry| match entry {
            StepOrBlock::Step(s) => !s.depends_on.is_empty(),
            StepOrBlock::Parallel { .. } => false,
        })
    }

    /// All top-level `Step`s, in declared order, skipping parallel blocks.
    /// Used by the DAG path, where parallel blocks cannot be mixed with
    /// `depends_on` edges (§4.1 rule 8 forbids nesting; blocks and DAG edges
    /// are mutually exclusive at the top level by construction of this
    /// engine's two execution paths).
    pub fn top_level_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter_map(|entry| match entry {
                StepOrBlock::Step(s) => Some(s),
                StepOrBlock::Parallel { .. } => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(yaml: &str) -> Result<Workflow, ValidationError> {
        Workflow::load(yaml)
    }

    #[test]
    fn rejects_empty_name() {
        let err = doc("name: \"\"\nsteps:\n  - name: a\n    command: echo\n").unwrap_err();
        assert!(err.to_string().contains("validation error") || matches!(err, ValidationError::EmptyName));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let err = doc(
            "name: w\nsteps:\n  - name: a\n    command: echo\n  - name: a\n    command: echo\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = doc("name: w\nsteps:\n  - name: a\n    command: echo\n    depends_on: [missing]\n")
            .unwrap_err();
        assert!(err.to_string().contains("unknown"));
    }

    #[test]
    fn rejects_self_dependency() {
        let err = doc("name: w\nsteps:\n  - name: a\n    command: echo\n    depends_on: [a]\n")
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn rejects_retries_without_retry_policy() {
        let err = doc("name: w\nsteps:\n  - name: a\n    command: echo\n    retries: 3\n").unwrap_err();
        assert!(err.to_string().contains("retries"));
    }

    #[test]
    fn accepts_valid_workflow() {
        let wf = doc(
            "name: w\nsteps:\n  - name: a\n    command: echo\n  - name: b\n    command: echo\n    depends_on: [a]\n",
        )
        .unwrap();
        assert_eq!(wf.name, "w");
        assert!(wf.has_dependencies());
    }

    #[test]
    fn accepts_parallel_block() {
        let wf = doc(
            "name: w\nsteps:\n  - parallel:\n      steps:\n        - name: a\n          command: echo\n        - name: b\n          command: echo\n",
        )
        .unwrap();
        assert_eq!(wf.steps.len(), 1);
    }
}
