// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The templated expression environment (§4.2).
//!
//! Grammar: `{{ expr }}` or `{{ expr | filter | filter(arg) }}`, where `expr`
//! is a dotted/bracketed variable lookup or a literal. The filter set is
//! closed by design (§9, "Expression language temptation") — adding a filter
//! means editing [`KNOWN_FILTERS`] and the handler registration below, never
//! exposing a general-purpose scripting escape hatch.
//!
//! Rendering is implemented on top of `handlebars`: each `{{ a.b | f | g(x) }}`
//! tag is rewritten into handlebars' own subexpression syntax
//! (`{{g (f a.b) x}}`) and the filters are registered as ordinary handlebars
//! helpers. This keeps the grammar's surface small while reusing a vetted,
//! side-effect-free template engine for the actual substitution.

use crate::scope::Scope;
use chrono::Local;
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};

const KNOWN_FILTERS: &[&str] = &["default", "trim", "lower", "upper", "strftime"];

/// The expression rendering environment. Stateless aside from the
/// registered helpers, so a single instance can be shared across steps.
pub struct Environment {
    handlebars: Handlebars<'static>,
}

impl Environment {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("trim", Box::new(trim_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("strftime", Box::new(strftime_helper));
        Self { handlebars }
    }

    /// Renders `template` against `scope`, producing the interpolated
    /// string (§4.2: `render(template, scope) -> string | RenderError`).
    pub fn render(&self, template: &str, scope: &Scope) -> Result<String, String> {
        let rewritten = rewrite(template)?;
        self.handlebars
            .render_template(&rewritten, &scope.as_value())
            .map_err(|e| e.to_string())
    }

    /// Renders `template` and interprets the result per the truthiness rule
    /// in §4.2.
    pub fn render_bool(&self, template: &str, scope: &Scope) -> Result<bool, String> {
        let rendered = self.render(template, scope)?;
        let normalized = rendered.trim().to_lowercase();
        match normalized.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(format!(
                "'{other}' is not a recognized boolean (expected true/1/yes or false/0/no/empty)"
            )),
        }
    }

    /// Checks that `template` is syntactically well-formed without needing
    /// a runtime scope (§4.1 rule 9). Used by [`crate::workflow::Workflow`]
    /// validation.
    pub fn check_syntax(template: &str) -> Result<(), String> {
        let rewritten = rewrite(template)?;
        let mut hb = Handlebars::new();
        hb.register_template_string("__check__", rewritten)
            .map_err(|e| e.to_string())
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// One interpolation's parsed shape: a variable path, a literal, or a
/// filter application over a nested expression.
#[derive(Debug, Clone)]
enum Expr {
    Path(String),
    Literal(String),
    Call(String, Vec<Expr>),
}

fn render_expr(expr: &Expr, top_level: bool) -> String {
    match expr {
        Expr::Path(p) => p.clone(),
        Expr::Literal(l) => l.clone(),
        Expr::Call(name, args) => {
            let rendered_args: Vec<String> = args.iter().map(|a| render_expr(a, false)).collect();
            let joined = rendered_args.join(" ");
            if top_level {
                format!("{name} {joined}")
            } else {
                format!("({name} {joined})")
            }
        }
    }
}

/// Rewrites every `{{ ... }}` tag in `template` from this crate's pipeline
/// grammar into plain handlebars syntax, leaving surrounding text untouched.
fn rewrite(template: &str) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| "unterminated '{{' tag".to_string())?;
        let inner = after[..end].trim();
        let expr = parse_pipeline(inner)?;
        out.push_str("{{");
        out.push_str(&render_expr(&expr, true));
        out.push_str("}}");
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Parses `expr | filter | filter(arg)` into a nested [`Expr`] chain.
fn parse_pipeline(content: &str) -> Result<Expr, String> {
    let segments = split_top_level(content, '|');
    if segments.is_empty() || segments[0].trim().is_empty() {
        return Err("empty expression".to_string());
    }
    let mut expr = parse_primary(segments[0].trim())?;
    for segment in &segments[1..] {
        expr = parse_filter(segment.trim(), expr)?;
    }
    Ok(expr)
}

fn parse_filter(segment: &str, input: Expr) -> Result<Expr, String> {
    let (name, arg) = match segment.find('(') {
        Some(paren) => {
            if !segment.ends_with(')') {
                return Err(format!("malformed filter call: {segment}"));
            }
            let name = segment[..paren].trim().to_string();
            let arg_str = segment[paren + 1..segment.len() - 1].trim();
            (name, Some(parse_primary(arg_str)?))
        }
        None => (segment.trim().to_string(), None),
    };
    if !KNOWN_FILTERS.contains(&name.as_str()) {
        return Err(format!("unknown filter: {name}"));
    }
    let mut args = vec![input];
    if let Some(arg) = arg {
        args.push(arg);
    }
    Ok(Expr::Call(name, args))
}

fn parse_primary(token: &str) -> Result<Expr, String> {
    let token = token.trim();
    if token.is_empty() {
        return Err("empty expression".to_string());
    }
    if (token.starts_with('"') && token.ends_with('"') && token.len() >= 2)
        || (token.starts_with('\'') && token.ends_with('\'') && token.len() >= 2)
    {
        // Re-quote with double quotes for handlebars, which only accepts those.
        let inner = &token[1..token.len() - 1];
        return Ok(Expr::Literal(format!("\"{inner}\"")));
    }
    if token.parse::<f64>().is_ok() {
        return Ok(Expr::Literal(token.to_string()));
    }
    Ok(Expr::Path(convert_brackets(token)?))
}

/// Converts `results['A'].stdout` / `results["A"].stdout` into handlebars'
/// own literal-segment syntax, `results.[A].stdout`.
fn convert_brackets(path: &str) -> Result<String, String> {
    let mut out = String::with_capacity(path.len());
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '[' {
            let quote = chars.get(i + 1).copied();
            let (key_start, quote_char) = match quote {
                Some(q) if q == '"' || q == '\'' => (i + 2, Some(q)),
                _ => (i + 1, None),
            };
            let close = path[key_start..]
                .find(|c: char| c == ']' || Some(c) == quote_char)
                .ok_or_else(|| format!("unterminated '[' in path: {path}"))?;
            let key_end = key_start + close;
            let key = &path[key_start..key_end];
            if !out.ends_with('.') && !out.is_empty() {
                out.push('.');
            }
            out.push('[');
            out.push_str(key);
            out.push(']');
            // Skip past the closing bracket.
            let bracket_close = path[key_end..].find(']').ok_or_else(|| {
                format!("unterminated '[' in path: {path}")
            })?;
            i = key_end + bracket_close + 1;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    Ok(out)
}

/// Splits `s` on `sep`, ignoring separators inside quotes or parens.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for c in s.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth -= 1;
                    current.push(c);
                }
                _ if c == sep && depth == 0 => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    parts.push(current);
    parts
}

fn param_str(h: &Helper, index: usize) -> String {
    h.param(index)
        .map(|p| match p.value() {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string().trim_matches('"').to_string(),
        })
        .unwrap_or_default()
}

fn is_undefined_or_empty(h: &Helper) -> bool {
    match h.param(0) {
        None => true,
        Some(p) => match p.value() {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        },
    }
}

fn default_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = if is_undefined_or_empty(h) {
        param_str(h, 1)
    } else {
        param_str(h, 0)
    };
    out.write(&value)?;
    Ok(())
}

fn trim_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(param_str(h, 0).trim())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&param_str(h, 0).to_lowercase())?;
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&param_str(h, 0).to_uppercase())?;
    Ok(())
}

fn strftime_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = param_str(h, 0);
    if format.trim().is_empty() {
        return Err(RenderErrorReason::Other("strftime requires a format string".into()).into());
    }
    out.write(&Local::now().format(&format).to_string())?;
    Ok(())
}
