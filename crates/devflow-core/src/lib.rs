// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency-graph workflow execution engine for the `devflow` CLI.
//!
//! A [`workflow::Workflow`] is loaded and validated, then handed to
//! [`engine::Engine`], which renders templated commands through
//! [`expr::Environment`], dispatches rendered steps through the
//! [`dispatch::CommandDispatcher`]/[`dispatch::ShellRunner`] seam, and
//! reports progress through an injected [`result::Observer`].
//!
//! This crate never installs a global `tracing` subscriber; embedding
//! applications (the reference CLI in `devflow-cli`, or any other caller)
//! own that decision.

pub mod config;
pub mod dag;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod expr;
pub mod executor;
pub mod rate_limit;
pub mod result;
pub mod retry;
pub mod runner;
pub mod scope;
pub mod workflow;

pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::{Error, Result, ValidationError};
pub use result::{NoopObserver, Observer, ProgressEvent, StepStatus, TracingObserver, WorkflowResult};
pub use workflow::Workflow;
