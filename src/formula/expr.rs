#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! `{{var}}` interpolation and the two-operator `if` expression grammar
//! (spec §4.5). Uses the same find-the-opening-delimiter-then-the-
//! matching-close scanning technique as the piper (spec §4.4) and the
//! teacher's `config.rs::expand_env_vars`, rather than pulling in a
//! templating crate — a two-operator condition grammar does not warrant
//! one (spec §9 "never fabricate dependencies").

use std::collections::BTreeMap;
use tracing::warn;

/// Replaces every `{{name}}` in `template` with `vars[name]`, leaving
/// unknown names (including `{{steps....}}` piper references) untouched
/// so the piper can resolve them later.
#[must_use]
pub fn render_vars(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    let mut cursor = 0;
    while let Some(rel_start) = template[cursor..].find("{{") {
        let start = cursor + rel_start;
        let body_start = start + 2;
        let Some(rel_close) = template[body_start..].find("}}") else {
            out.push_str(&template[cursor..]);
            return out;
        };
        let end = body_start + rel_close + 2;
        let name = template[body_start..body_start + rel_close].trim();
        out.push_str(&template[cursor..start]);
        if let Some(value) = vars.get(name) {
            out.push_str(value);
        } else {
            out.push_str(&template[start..end]);
        }
        cursor = end;
    }
    out.push_str(&template[cursor..]);
    out
}

fn dequote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Evaluates a rendered `if` expression. Supported operators: `==`, `!=`
/// on dequoted string operands; the literals `true`/`false`. Any other
/// form warns and is treated as false (spec §4.5).
#[must_use]
pub fn eval_condition(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return true;
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return false;
    }
    for op in ["==", "!="] {
        if let Some(idx) = trimmed.find(op) {
            let lhs = dequote(&trimmed[..idx]);
            let rhs = dequote(&trimmed[idx + op.len()..]);
            return if op == "==" { lhs == rhs } else { lhs != rhs };
        }
    }
    warn!(expr = %trimmed, "unsupported if expression, treating as false");
    false
}

/// Renders `items` (a JSON array or comma-separated string) and returns
/// the expanded list of loop values (spec §4.5 `for`).
#[must_use]
pub fn render_for_items(rendered_items: &str) -> Vec<String> {
    let trimmed = rendered_items.trim();
    if trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(array) = value.as_array() {
                return array
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
            }
        }
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
