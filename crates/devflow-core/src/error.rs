// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns [`Error`] (aliased as
//! [`Result`]). Collaborator-facing errors (`DispatchError`, `ProviderError`
//! in the old sense) are folded into this enum at the boundary so that the
//! executor never has to match on more than one error type.

use std::time::Duration;
use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the engine can produce.
#[derive(Debug, Error)]
pub enum Error {
    /// A workflow document failed one or more validation rules.
    #[error("workflow validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Loading the layered run configuration failed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Template rendering failed.
    #[error("render error in '{template}': {reason}")]
    Render { template: String, reason: String },

    /// A command or shell dispatch failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// A step or block exceeded its effective deadline.
    #[error("timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The run was cancelled before this unit of work completed.
    #[error("cancelled")]
    Cancelled,

    /// A step referenced a name that does not exist in the workflow.
    #[error("unknown step: {0}")]
    StepNotFound(String),

    /// Wraps a YAML decoding error from the document or config loader.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Wraps a JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other I/O failure (reading a workflow file, spawning a subprocess).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for collaborator errors that don't fit another variant.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }
}

/// Validation failures collected by the Document Model (§4.1).
///
/// Errors are accumulated rather than returned on the first failure so a
/// workflow author sees every problem in one pass.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow must declare at least one step")]
    NoSteps,

    #[error("duplicate step name: {0}")]
    DuplicateName(String),

    #[error("step '{0}' has invalid on_failure value '{1}'")]
    InvalidOnFailure(String, String),

    #[error("step '{0}' sets retries but on_failure is not 'retry'")]
    RetriesWithoutRetryPolicy(String),

    #[error("step '{0}' has timeout_seconds = {1}, must be > 0")]
    NonPositiveTimeout(String, i64),

    #[error("step '{0}' depends on unknown step '{1}'")]
    UnknownDependency(String, String),

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle detected: {0}")]
    Cycle(String),

    #[error("workflow mixes parallel blocks with `depends_on` edges; pick one execution mode per workflow")]
    MixedExecutionModes,

    #[error("step '{0}' has a malformed template: {1}")]
    MalformedTemplate(String, String),

    /// Several rules failed; reported together per §4.1.
    #[error("{} validation error(s): {}", .0.len(), join_errors(.0))]
    Many(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
