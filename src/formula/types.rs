#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Declarative TOML formula shape (spec §3, §6). Deserialized with `serde`
//! the way the teacher's `contracts.rs` derives `Deserialize` for its own
//! wire-shaped structs, parsed with the `toml` crate (grounded on
//! `bobisme-botbox`'s use of `toml`/`toml_edit` for its own template
//! files — a new dependency for this crate, since the teacher itself
//! parses no TOML).

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct VariableSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForSpec {
    pub items: String,
    #[serde(rename = "as")]
    pub as_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(rename = "for", default)]
    pub for_spec: Option<ForSpec>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub prompts: Option<serde_json::Value>,
    #[serde(default)]
    pub mcp_resources: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Formula {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Formula {
    /// Parses a formula from TOML source text.
    ///
    /// # Errors
    /// Returns [`crate::error::CitadelError::Formula`] if the document is
    /// not valid TOML or does not match the formula schema. Unknown
    /// top-level keys are accepted and ignored (spec §6), since `toml`
    /// deserializes structurally rather than rejecting unrecognized
    /// fields by default.
    pub fn parse(source: &str) -> crate::error::Result<Self> {
        toml::from_str(source)
            .map_err(|e| crate::error::CitadelError::Formula(format!("invalid formula TOML: {e}")))
    }

    /// Which step (if any) this step id is the `on_failure` recovery
    /// target for.
    #[must_use]
    pub fn recovery_target_of(&self, step_id: &str) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.on_failure.as_deref() == Some(step_id))
    }
}
