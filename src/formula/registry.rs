#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::types::Formula;
use crate::error::{CitadelError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Loads and holds formula definitions from `.citadel/formulas/*.toml`
/// (spec §6), keyed by formula name.
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulas: HashMap<String, Formula>,
}

impl FormulaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.toml` file in `dir`, skipping (with a warning) any
    /// file that fails to parse rather than aborting the whole load.
    ///
    /// # Errors
    /// Returns [`CitadelError::Io`] if `dir` cannot be read.
    pub async fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        if !dir.exists() {
            return Ok(registry);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(std::ffi::OsStr::to_str) != Some("toml") {
                continue;
            }
            match Self::load_file(&path).await {
                Ok(formula) => {
                    info!(name = %formula.name, path = %path.display(), "loaded formula");
                    registry.formulas.insert(formula.name.clone(), formula);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load formula"),
            }
        }
        Ok(registry)
    }

    async fn load_file(path: &PathBuf) -> Result<Formula> {
        let content = tokio::fs::read_to_string(path).await?;
        Formula::parse(&content)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    pub fn insert(&mut self, formula: Formula) {
        self.formulas.insert(formula.name.clone(), formula);
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.formulas.keys().map(String::as_str).collect()
    }

    /// # Errors
    /// Returns [`CitadelError::NotFound`] if no formula with this name is
    /// registered.
    pub fn require(&self, name: &str) -> Result<&Formula> {
        self.get(name)
            .ok_or_else(|| CitadelError::NotFound(format!("formula {name} not registered")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_errors_for_unknown_formula() {
        let registry = FormulaRegistry::new();
        assert!(registry.require("nope").is_err());
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut registry = FormulaRegistry::new();
        let formula = Formula::parse("name = \"f\"\ndescription = \"d\"\n").expect("parses");
        registry.insert(formula);
        assert!(registry.get("f").is_some());
        assert_eq!(registry.names(), vec!["f"]);
    }
}
