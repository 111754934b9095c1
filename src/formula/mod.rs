#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Formula Compiler / Workflow Engine (spec §4.5): declarative TOML
//! formulas expanded into beads, dependencies, and recovery wiring.

mod compiler;
mod expr;
mod registry;
mod types;

pub use compiler::{instantiate_formula, resolve_variables};
pub use expr::{eval_condition, render_for_items, render_vars};
pub use registry::FormulaRegistry;
pub use types::{Formula, ForSpec, Step, VariableSpec};
