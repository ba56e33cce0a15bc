// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A strategy-table [`CommandDispatcher`] over a small built-in command set
//! (§4.13, §9: "a strategy table keyed on the first token of the command
//! string is sufficient"). Real deployments are expected to provide their
//! own `CommandDispatcher` for their own command surface; this one exists so
//! the reference CLI and the test suite have something runnable out of the
//! box.

use async_trait::async_trait;
use devflow_core::dispatch::{CommandDispatcher, DispatchOutcome};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dispatches `noop`, `echo`, `sleep`, `fail`, and `http.get` command paths.
pub struct BuiltinDispatcher {
    http: reqwest::Client,
}

impl BuiltinDispatcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn dispatch_echo(params: &HashMap<String, Value>) -> DispatchOutcome {
        let message = param_string(params, "message").unwrap_or_default();
        DispatchOutcome::ok(message)
    }

    async fn dispatch_sleep(params: &HashMap<String, Value>, deadline: Instant) -> DispatchOutcome {
        let seconds = params
            .get("seconds")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0);
        let requested = std::time::Duration::from_secs_f64(seconds);
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(requested.min(remaining)).await;
        DispatchOutcome::ok("")
    }

    async fn dispatch_fail(params: &HashMap<String, Value>) -> DispatchOutcome {
        let message = param_string(params, "message").unwrap_or_else(|| "step explicitly failed".to_string());
        DispatchOutcome::failure(1, message.clone(), message)
    }

    async fn dispatch_http_get(&self, params: &HashMap<String, Value>) -> DispatchOutcome {
        let Some(url) = param_string(params, "url") else {
            return DispatchOutcome::failure(-1, "", "http.get requires a 'url' param");
        };
        match self.http.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    DispatchOutcome::ok(body)
                } else {
                    DispatchOutcome::failure(
                        status.as_u16() as i32,
                        body,
                        format!("http.get to '{url}' returned status {status}"),
                    )
                }
            }
            Err(e) => DispatchOutcome::failure(-1, "", format!("http.get to '{url}' failed: {e}")),
        }
    }
}

impl Default for BuiltinDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn param_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[async_trait]
impl CommandDispatcher for BuiltinDispatcher {
    async fn dispatch(
        &self,
        command_path: &str,
        params: &HashMap<String, Value>,
        _cancel: CancellationToken,
        deadline: Instant,
    ) -> DispatchOutcome {
        match command_path {
            "noop" => DispatchOutcome::ok(""),
            "echo" => Self::dispatch_echo(params).await,
            "sleep" => Self::dispatch_sleep(params, deadline).await,
            "fail" => Self::dispatch_fail(params).await,
            "http.get" => self.dispatch_http_get(params).await,
            other => DispatchOutcome::failure(-1, "", format!("unknown command '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn noop_always_succeeds() {
        let dispatcher = BuiltinDispatcher::new();
        let outcome = dispatcher
            .dispatch("noop", &HashMap::new(), CancellationToken::new(), Instant::now())
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn echo_returns_message_as_stdout() {
        let dispatcher = BuiltinDispatcher::new();
        let p = params(&[("message", Value::String("hi".into()))]);
        let outcome = dispatcher
            .dispatch("echo", &p, CancellationToken::new(), Instant::now())
            .await;
        assert_eq!(outcome.stdout, "hi");
    }

    #[tokio::test]
    async fn fail_produces_failure_outcome() {
        let dispatcher = BuiltinDispatcher::new();
        let outcome = dispatcher
            .dispatch("fail", &HashMap::new(), CancellationToken::new(), Instant::now())
            .await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let dispatcher = BuiltinDispatcher::new();
        let outcome = dispatcher
            .dispatch("bogus", &HashMap::new(), CancellationToken::new(), Instant::now())
            .await;
        assert!(!outcome.is_success());
    }
}
