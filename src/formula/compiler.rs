#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Formula-to-graph compiler (spec §4.5). Reads a declarative formula and
//! a variable map, creates a root "molecule" bead plus one child bead per
//! (step, loop iteration), and wires dependency/recovery edges. Grounded
//! on the teacher's `orchestrator_service::run_once` "do these steps in
//! order, collect results" shape, generalized to bead creation instead of
//! port calls.

use super::expr::{eval_condition, render_for_items, render_vars};
use super::types::{Formula, Step};
use crate::bead_store::{BeadStore, CreateBeadParams};
use crate::error::{CitadelError, Result};
use crate::types::{labels, BeadId};
use std::collections::BTreeMap;
use tracing::info;

/// Resolves missing variables from each `VariableSpec.default`, erroring
/// if a `required` variable is still unset (spec §4.5 step 1).
///
/// # Errors
/// Returns [`CitadelError::Validation`] if a required variable has no
/// value and no default.
pub fn resolve_variables(
    formula: &Formula,
    provided: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut resolved = provided.clone();
    for (name, spec) in &formula.variables {
        if resolved.contains_key(name) {
            continue;
        }
        if let Some(default) = &spec.default {
            resolved.insert(name.clone(), default.clone());
        } else if spec.required {
            return Err(CitadelError::Validation(format!(
                "formula {}: missing required variable {name}",
                formula.name
            )));
        }
    }
    Ok(resolved)
}

/// One step's compiled output: the bead ids it produced (more than one if
/// it was a `for` loop), in loop order.
type StepBeads = BTreeMap<String, Vec<BeadId>>;

/// Instantiates `formula` against `variables`, creating the root molecule
/// bead and every step bead, then wiring `needs`/`on_failure` dependency
/// edges. Returns the root molecule's bead id (spec §4.5, tool contract
/// `instantiate_formula`).
///
/// # Errors
/// Returns [`CitadelError::Validation`] for missing required variables,
/// or any error the bead store raises while creating beads/edges.
pub async fn instantiate_formula(
    store: &dyn BeadStore,
    formula: &Formula,
    variables: BTreeMap<String, String>,
    parent: Option<BeadId>,
) -> Result<BeadId> {
    let vars = resolve_variables(formula, &variables)?;

    let rendered_description = render_vars(&formula.description, &vars);
    let molecule_id = store
        .create(CreateBeadParams {
            title: format!("[Molecule] {rendered_description}"),
            priority: None,
            parent,
            bead_type: Some("epic".to_string()),
            description: Some(rendered_description),
        })
        .await?;
    info!(formula = %formula.name, molecule = %molecule_id, "instantiated formula");

    let mut step_beads: StepBeads = BTreeMap::new();

    for step in &formula.steps {
        if let Some(expr) = &step.if_expr {
            let rendered = render_vars(expr, &vars);
            if !eval_condition(&rendered) {
                info!(step = %step.id, "skipped step (if evaluated false)");
                continue;
            }
        }

        let iterations = compile_iterations(step, &vars);
        let mut created = Vec::with_capacity(iterations.len().max(1));

        for iter_vars in iterations {
            let bead_id =
                create_step_bead(store, formula, step, &molecule_id, &iter_vars).await?;
            created.push(bead_id);
        }
        step_beads.insert(step.id.clone(), created);
    }

    wire_dependencies(store, formula, &step_beads).await?;

    Ok(molecule_id)
}

/// Returns one variable map per loop iteration (or a single map, a clone
/// of `vars`, when the step has no `for`).
fn compile_iterations(step: &Step, vars: &BTreeMap<String, String>) -> Vec<BTreeMap<String, String>> {
    let Some(for_spec) = &step.for_spec else {
        return vec![vars.clone()];
    };
    let rendered_items = render_vars(&for_spec.items, vars);
    render_for_items(&rendered_items)
        .into_iter()
        .map(|item| {
            let mut iter_vars = vars.clone();
            iter_vars.insert(for_spec.as_name.clone(), item);
            iter_vars
        })
        .collect()
}

async fn create_step_bead(
    store: &dyn BeadStore,
    formula: &Formula,
    step: &Step,
    molecule_id: &BeadId,
    vars: &BTreeMap<String, String>,
) -> Result<BeadId> {
    let title = render_vars(&step.title, vars);
    let description = step.description.as_ref().map(|d| render_vars(d, vars));

    let bead_id = store
        .create(CreateBeadParams {
            title,
            priority: None,
            parent: Some(molecule_id.clone()),
            bead_type: Some("task".to_string()),
            description,
        })
        .await?;

    let mut add_labels = vec![labels::formula(&formula.name), labels::step(&step.id)];
    if formula.recovery_target_of(&step.id).is_some() {
        // This step IS another step's on_failure target: it's a recovery
        // step. `recovers:<beadId>` is filled in by wire_dependencies once
        // the main step's bead id is known, via a context update, not here
        // (a fresh bead has no peers yet at creation time).
        add_labels.push(labels::RECOVERY.to_string());
    }

    let context: serde_json::Map<String, serde_json::Value> = step
        .context
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(render_vars(v, vars))))
        .collect();

    store
        .update(
            &bead_id,
            crate::bead_store::BeadUpdate {
                add_labels,
                context: if context.is_empty() {
                    None
                } else {
                    Some(serde_json::Value::Object(context))
                },
                ..crate::bead_store::BeadUpdate::default()
            },
        )
        .await?;

    Ok(bead_id)
}

/// Wires `needs` fan-in edges and `on_failure` recovery edges (spec
/// §4.5 step 4). Skipped steps produce no beads, so `needs` edges to them
/// are simply omitted (no entry in `step_beads`).
async fn wire_dependencies(store: &dyn BeadStore, formula: &Formula, step_beads: &StepBeads) -> Result<()> {
    for step in &formula.steps {
        let Some(children) = step_beads.get(&step.id) else {
            continue;
        };

        for needed_id in &step.needs {
            let Some(needed_beads) = step_beads.get(needed_id) else {
                continue;
            };
            for child in children {
                for needed in needed_beads {
                    store.dep_add(child, needed).await?;
                }
            }
        }

        if let Some(recovery_step_id) = &step.on_failure {
            if let Some(recovery_beads) = step_beads.get(recovery_step_id) {
                for main_bead in children {
                    for recovery_bead in recovery_beads {
                        store.dep_add(recovery_bead, main_bead).await?;
                        store
                            .update(
                                recovery_bead,
                                crate::bead_store::BeadUpdate {
                                    add_labels: vec![labels::recovers(main_bead.value())],
                                    ..crate::bead_store::BeadUpdate::default()
                                },
                            )
                            .await?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bead_store::InMemoryBeadStore;
    use crate::types::BeadStatus;

    fn recovery_formula() -> Formula {
        Formula::parse(
            r#"
            name = "recovery_flow"
            description = "demo"

            [[steps]]
            id = "main"
            title = "Do the main thing"
            on_failure = "recovery"

            [[steps]]
            id = "recovery"
            title = "Clean up after main"
            "#,
        )
        .expect("parses")
    }

    #[tokio::test]
    async fn instantiate_creates_molecule_and_step_beads() {
        let store = InMemoryBeadStore::new();
        let formula = recovery_formula();
        let molecule = instantiate_formula(&store, &formula, BTreeMap::new(), None)
            .await
            .expect("instantiate succeeds");

        let molecule_bead = store.show(&molecule).await.expect("show").expect("exists");
        assert_eq!(molecule_bead.bead_type.as_deref(), Some("epic"));

        let all = store.list(None).await.expect("list");
        // molecule + main + recovery
        assert_eq!(all.len(), 3);

        let recovery_bead = all
            .iter()
            .find(|b| b.has_label(&labels::step("recovery")))
            .expect("recovery bead exists");
        assert!(recovery_bead.has_label(labels::RECOVERY));
        assert_eq!(recovery_bead.status, BeadStatus::Open);
    }

    #[tokio::test]
    async fn conditional_step_is_skipped_when_false() {
        let formula = Formula::parse(
            r#"
            name = "conditional"
            description = "demo"

            [[steps]]
            id = "only_if_prod"
            title = "prod step"
            if = "{{env}} == \"prod\""
            "#,
        )
        .expect("parses");

        let store = InMemoryBeadStore::new();
        let mut vars = BTreeMap::new();
        vars.insert("env".to_string(), "dev".to_string());
        instantiate_formula(&store, &formula, vars, None)
            .await
            .expect("instantiate succeeds");

        let all = store.list(None).await.expect("list");
        assert_eq!(all.len(), 1); // only the molecule
    }

    #[tokio::test]
    async fn for_loop_expands_one_bead_per_item() {
        let formula = Formula::parse(
            r#"
            name = "fanout"
            description = "demo"

            [[steps]]
            id = "shard"
            title = "Process {{item}}"

            [steps.for]
            items = "[\"a\", \"b\", \"c\"]"
            as = "item"
            "#,
        )
        .expect("parses");

        let store = InMemoryBeadStore::new();
        instantiate_formula(&store, &formula, BTreeMap::new(), None)
            .await
            .expect("instantiate succeeds");

        let all = store.list(None).await.expect("list");
        // molecule + 3 shard beads
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn missing_required_variable_is_an_error() {
        let formula = Formula::parse(
            r#"
            name = "needs_var"
            description = "demo"

            [variables.target]
            required = true

            [[steps]]
            id = "s"
            title = "step"
            "#,
        )
        .expect("parses");

        let store = InMemoryBeadStore::new();
        let err = instantiate_formula(&store, &formula, BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CitadelError::Validation(_)));
    }
}
