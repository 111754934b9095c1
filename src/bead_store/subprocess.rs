#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{BeadStore, BeadUpdate, CreateBeadParams};
use crate::error::{CitadelError, Result};
use crate::types::{Bead, BeadId, BeadStatus, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

const CONTEXT_FENCE_OPEN: &str = "```json citadel-context\n";
const CONTEXT_FENCE_CLOSE: &str = "\n```";

/// Shells out to the opaque `bd` binary in sandbox mode (spec §6). Grounded
/// on the teacher's `RepoId::from_current_dir` subprocess-shelling idiom in
/// `types.rs`, generalized to the full command surface.
pub struct SubprocessBeadStore {
    binary: String,
    cwd: PathBuf,
}

impl SubprocessBeadStore {
    #[must_use]
    pub fn new(binary: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            binary: binary.into(),
            cwd,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        self.run_with_retry(args, 0).await
    }

    /// Retries "out of sync" errors once (after a single `sync`) and
    /// "split stack overflow" errors up to twice with no backoff, per spec
    /// §6/§7.
    async fn run_with_retry(&self, args: &[&str], split_retries: u32) -> Result<Output> {
        let mut synced_once = false;
        let mut split_attempts = 0_u32;

        loop {
            let output = Command::new(&self.binary)
                .args(args)
                .current_dir(&self.cwd)
                .output()
                .await
                .map_err(|e| CitadelError::Adapter(format!("failed to spawn {}: {e}", self.binary)))?;

            if output.status.success() {
                return Ok(output);
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if stderr.contains("out of sync") && !synced_once {
                synced_once = true;
                warn!("bead store out of sync, auto-syncing and retrying once");
                let sync = Command::new(&self.binary)
                    .arg("sync")
                    .current_dir(&self.cwd)
                    .output()
                    .await
                    .map_err(|e| CitadelError::Adapter(format!("failed to sync: {e}")))?;
                if sync.status.success() {
                    continue;
                }
            }

            if stderr.contains("split stack overflow") && split_attempts < 2 {
                split_attempts += 1;
                let _ = split_retries;
                warn!("bead store split stack overflow, retrying ({split_attempts}/2)");
                continue;
            }

            return Err(CitadelError::Adapter(format!(
                "{} {:?} failed: {stderr}",
                self.binary, args
            )));
        }
    }

    fn parse_json(output: &Output) -> Result<Value> {
        serde_json::from_slice(&output.stdout)
            .map_err(|e| CitadelError::Adapter(format!("non-JSON bd output: {e}")))
    }
}

/// Extracts the embedded context JSON fence from a bead's description, and
/// the projected internal status from the external `{open, in_progress,
/// closed}` set plus the `verify` label (spec §3 invariant 3, spec §6).
#[must_use]
pub fn project_status(external_status: &str, labels: &[String]) -> BeadStatus {
    match external_status {
        "closed" => BeadStatus::Done,
        "in_progress" if labels.iter().any(|l| l == "verify") => BeadStatus::Verify,
        "in_progress" => BeadStatus::InProgress,
        _ => BeadStatus::Open,
    }
}

/// Inverse of [`project_status`]: returns the external status string and
/// whether the `verify` label should be present.
#[must_use]
pub fn unproject_status(status: BeadStatus) -> (&'static str, bool) {
    match status {
        BeadStatus::Open => ("open", false),
        BeadStatus::InProgress => ("in_progress", false),
        BeadStatus::Verify => ("in_progress", true),
        BeadStatus::Done => ("closed", false),
    }
}

/// Reads the JSON context blob fenced inside a bead's free-text
/// description, so the backing store need not know about it (spec §3).
#[must_use]
pub fn extract_context(description: &str) -> Value {
    let Some(start) = description.find(CONTEXT_FENCE_OPEN) else {
        return serde_json::json!({});
    };
    let body_start = start + CONTEXT_FENCE_OPEN.len();
    let Some(close_rel) = description[body_start..].find(CONTEXT_FENCE_CLOSE) else {
        return serde_json::json!({});
    };
    let body = &description[body_start..body_start + close_rel];
    serde_json::from_str(body).unwrap_or_else(|e| {
        debug!("failed to parse embedded context fence: {e}");
        serde_json::json!({})
    })
}

/// Replaces (or appends) the context fence in a description.
#[must_use]
pub fn embed_context(description: &str, context: &Value) -> String {
    let rendered = serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string());
    let fence = format!("{CONTEXT_FENCE_OPEN}{rendered}{CONTEXT_FENCE_CLOSE}");

    if let Some(start) = description.find(CONTEXT_FENCE_OPEN) {
        let body_start = start + CONTEXT_FENCE_OPEN.len();
        if let Some(close_rel) = description[body_start..].find(CONTEXT_FENCE_CLOSE) {
            let end = body_start + close_rel + CONTEXT_FENCE_CLOSE.len();
            let mut out = description[..start].to_string();
            out.push_str(&fence);
            out.push_str(&description[end..]);
            return out;
        }
    }

    if description.is_empty() {
        fence
    } else {
        format!("{description}\n\n{fence}")
    }
}

fn parse_bead_json(value: &Value) -> Result<Bead> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| CitadelError::Adapter("bd output missing id".to_string()))?;
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let external_status = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("open");
    let labels: Vec<String> = value
        .get("labels")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();
    let blockers: Vec<BeadId> = value
        .get("blockers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(BeadId::new))
                .collect()
        })
        .unwrap_or_default();
    let description = value
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let context = extract_context(&description);
    let priority = Priority(
        value
            .get("priority")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .min(3) as u8,
    );
    let now: DateTime<Utc> = Utc::now();

    Ok(Bead {
        id: BeadId::new(id),
        title,
        status: project_status(external_status, &labels),
        priority,
        assignee: value
            .get("assignee")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        labels,
        blockers,
        acceptance_test: value
            .get("acceptance_test")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        parent: value
            .get("parent")
            .and_then(Value::as_str)
            .map(BeadId::new),
        bead_type: value
            .get("type")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        description: Some(description),
        context,
        created_at: value
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now),
        updated_at: value
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now),
    })
}

#[async_trait]
impl BeadStore for SubprocessBeadStore {
    async fn doctor(&self) -> Result<bool> {
        match self.run(&["doctor", "--json"]).await {
            Ok(output) => {
                let value = Self::parse_json(&output)?;
                Ok(value.get("healthy").and_then(Value::as_bool).unwrap_or(false))
            }
            Err(_) => Ok(false),
        }
    }

    async fn create(&self, params: CreateBeadParams) -> Result<BeadId> {
        let mut args: Vec<String> = vec!["create".to_string(), params.title.clone()];
        if let Some(priority) = params.priority {
            args.push("-p".to_string());
            args.push(priority.to_string());
        }
        if let Some(parent) = &params.parent {
            args.push("--parent".to_string());
            args.push(parent.value().to_string());
        }
        if let Some(bead_type) = &params.bead_type {
            args.push("--type".to_string());
            args.push(bead_type.clone());
        }
        if let Some(description) = &params.description {
            args.push("--description".to_string());
            args.push(description.clone());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        let value = Self::parse_json(&output)?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(BeadId::new)
            .ok_or_else(|| CitadelError::Adapter("bd create returned no id".to_string()))
    }

    async fn show(&self, id: &BeadId) -> Result<Option<Bead>> {
        match self.run(&["show", id.value(), "--json"]).await {
            Ok(output) => Ok(Some(parse_bead_json(&Self::parse_json(&output)?)?)),
            Err(CitadelError::Adapter(msg)) if msg.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, status: Option<BeadStatus>) -> Result<Vec<Bead>> {
        let mut args = vec!["list".to_string()];
        if let Some(status) = status {
            let (external, verify) = unproject_status(status);
            args.push("--status".to_string());
            args.push(external.to_string());
            let _ = verify; // caller filters verify-projection client side below
        }
        args.push("--json".to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        let value = Self::parse_json(&output)?;
        let items = value
            .as_array()
            .ok_or_else(|| CitadelError::Adapter("bd list did not return an array".to_string()))?;
        let mut beads = items
            .iter()
            .map(parse_bead_json)
            .collect::<Result<Vec<_>>>()?;
        if let Some(status) = status {
            beads.retain(|b| b.status == status);
        }
        Ok(beads)
    }

    async fn ready(&self) -> Result<Vec<Bead>> {
        let output = self.run(&["ready", "--json"]).await?;
        let value = Self::parse_json(&output)?;
        let items = value
            .as_array()
            .ok_or_else(|| CitadelError::Adapter("bd ready did not return an array".to_string()))?;
        items.iter().map(parse_bead_json).collect()
    }

    async fn update(&self, id: &BeadId, update: BeadUpdate) -> Result<()> {
        let mut args: Vec<String> = vec!["update".to_string(), id.value().to_string()];

        if let Some(status) = update.status {
            let (external, verify) = unproject_status(status);
            args.push("--status".to_string());
            args.push(external.to_string());
            if verify {
                args.push("--add-label".to_string());
                args.push("verify".to_string());
            } else {
                args.push("--remove-label".to_string());
                args.push("verify".to_string());
            }
        }
        for label in &update.add_labels {
            args.push("--add-label".to_string());
            args.push(label.clone());
        }
        for label in &update.remove_labels {
            args.push("--remove-label".to_string());
            args.push(label.clone());
        }
        if let Some(test) = &update.acceptance_test {
            args.push("--acceptance-test".to_string());
            args.push(test.clone());
        }
        if let Some(context) = &update.context {
            let current = self.show(id).await?.and_then(|b| b.description).unwrap_or_default();
            let new_description = embed_context(&current, context);
            args.push("--description".to_string());
            args.push(new_description);
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await?;
        Ok(())
    }

    async fn dep_add(&self, child: &BeadId, parent: &BeadId) -> Result<()> {
        self.run(&["dep", "add", child.value(), parent.value()])
            .await?;
        Ok(())
    }
}
