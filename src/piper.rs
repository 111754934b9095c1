#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Data Piper (spec §4.4): resolves `{{steps.<id>.output[.<path>]}}`
//! references inside a bead's context by locating upstream beads tagged
//! with `step:<id>` among its blockers and reading their completed ticket
//! output. Grounded on the teacher's `config.rs::expand_env_vars` `${...}`
//! scanner — the same find-the-opening-delimiter-then-the-matching-close
//! technique, generalized to the richer `{{steps....}}` placeholder
//! grammar instead of pulling in a templating crate.

use crate::bead_store::BeadStore;
use crate::queue::WorkQueue;
use crate::types::Bead;
use serde_json::Value;

const OPEN: &str = "{{steps.";
const CLOSE: &str = "}}";

/// A single `{{steps.<id>.output[.<path>]}}` reference found inside a
/// string value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StepRef {
    /// Byte range of the whole `{{...}}` placeholder within the source
    /// string.
    span: (usize, usize),
    step_id: String,
    path: Vec<String>,
}

/// Finds every `{{steps.<id>.output[.<path>]}}` placeholder in `s`.
/// Malformed placeholders (no matching `}}`) are ignored, matching the
/// "missing values yield still-unresolved, do not crash" semantics.
fn find_step_refs(s: &str) -> Vec<StepRef> {
    let mut refs = Vec::new();
    let mut search_from = 0;
    while let Some(rel_start) = s[search_from..].find(OPEN) {
        let start = search_from + rel_start;
        let body_start = start + OPEN.len();
        let Some(rel_close) = s[body_start..].find(CLOSE) else {
            break;
        };
        let end = body_start + rel_close + CLOSE.len();
        let body = &s[body_start..body_start + rel_close];
        // body is "<id>.output" or "<id>.output.<path...>"
        let mut parts = body.splitn(3, '.');
        let step_id = parts.next().unwrap_or_default();
        let output_marker = parts.next().unwrap_or_default();
        if output_marker == "output" && !step_id.is_empty() {
            let path = parts
                .next()
                .map(|rest| rest.split('.').map(ToString::to_string).collect())
                .unwrap_or_default();
            refs.push(StepRef {
                span: (start, end),
                step_id: step_id.to_string(),
                path,
            });
        }
        search_from = end;
    }
    refs
}

fn walk_path(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value.clone();
    for segment in path {
        current = current.get(segment)?.clone();
    }
    Some(current)
}

fn stringify_leaf(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves all step references within `value`, given a lookup from step
/// id to its resolved output (`None` = not yet available). Returns
/// `(resolved_value, changed)`.
fn resolve_value(value: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> (Value, bool) {
    match value {
        Value::String(s) => {
            let refs = find_step_refs(s);
            if refs.is_empty() {
                return (value.clone(), false);
            }

            // Full-replacement: the entire string is exactly one
            // placeholder, so a non-string leaf value may be produced.
            if refs.len() == 1 && refs[0].span == (0, s.len()) {
                let r = &refs[0];
                return match lookup(&r.step_id).and_then(|output| walk_path(&output, &r.path)) {
                    Some(resolved) => (resolved, true),
                    None => (value.clone(), false),
                };
            }

            // Mixed interpolation: every resolvable placeholder is
            // stringified and substituted in place; unresolved ones are
            // left untouched.
            let mut out = String::new();
            let mut cursor = 0;
            let mut changed = false;
            for r in &refs {
                out.push_str(&s[cursor..r.span.0]);
                match lookup(&r.step_id).and_then(|output| walk_path(&output, &r.path)) {
                    Some(resolved) => {
                        out.push_str(&stringify_leaf(&resolved));
                        changed = true;
                    }
                    None => out.push_str(&s[r.span.0..r.span.1]),
                }
                cursor = r.span.1;
            }
            out.push_str(&s[cursor..]);
            (Value::String(out), changed)
        }
        Value::Array(items) => {
            let mut changed = false;
            let resolved: Vec<Value> = items
                .iter()
                .map(|item| {
                    let (v, c) = resolve_value(item, lookup);
                    changed |= c;
                    v
                })
                .collect();
            (Value::Array(resolved), changed)
        }
        Value::Object(map) => {
            let mut changed = false;
            let resolved: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| {
                    let (resolved_v, c) = resolve_value(v, lookup);
                    changed |= c;
                    (k.clone(), resolved_v)
                })
                .collect();
            (Value::Object(resolved), changed)
        }
        other => (other.clone(), false),
    }
}

/// Resolves every `{{steps.<id>.output[.<path>]}}` reference in `bead`'s
/// context against its blockers, and writes the result back via
/// `beads.update` if anything changed.
///
/// The piper MUST NOT run for beads whose context is empty (spec §4.4).
///
/// # Errors
/// Returns an error if the bead store read/write fails.
pub async fn resolve_context(
    store: &dyn BeadStore,
    queue: &WorkQueue,
    bead: &Bead,
) -> crate::error::Result<bool> {
    if bead.context.as_object().is_none_or(serde_json::Map::is_empty) {
        return Ok(false);
    }

    // Pre-fetch each blocker tagged `step:<id>` and its completed output,
    // so `lookup` below is a pure in-memory closure.
    let mut step_outputs: std::collections::HashMap<String, Value> = std::collections::HashMap::new();
    for blocker_id in &bead.blockers {
        let Some(blocker) = store.show(blocker_id).await? else {
            continue;
        };
        let Some(step_id) = blocker.step_id() else {
            continue;
        };
        if let Some(output) = queue.get_output(&blocker.id).await? {
            step_outputs.insert(step_id.to_string(), output);
        }
    }

    let lookup = |step_id: &str| step_outputs.get(step_id).cloned();
    let (resolved, changed) = resolve_value(&bead.context, &lookup);

    if changed {
        store
            .update(
                &bead.id,
                crate::bead_store::BeadUpdate {
                    context: Some(resolved),
                    ..crate::bead_store::BeadUpdate::default()
                },
            )
            .await?;
    }
    Ok(changed)
}
