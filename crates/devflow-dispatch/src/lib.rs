// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference implementations of `devflow-core`'s dispatcher seam (§4.13,
//! §5): [`BuiltinDispatcher`] for internal command paths and
//! [`TokioShellRunner`] for `!`-prefixed shell command lines.

pub mod builtin;
pub mod shell;

pub use builtin::BuiltinDispatcher;
pub use shell::TokioShellRunner;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
