use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::catalog::{RoleName, WorkflowDefinition};
use crate::error::CrewError;
use crate::worker::Worker;

/// A task bound to the worker of its declared role.
#[derive(Debug, Clone)]
pub struct TaskItem {
    pub name: String,
    pub instruction: String,
    pub worker: Arc<Worker>,
}

impl TaskItem {
    pub fn role(&self) -> &RoleName {
        self.worker.role()
    }
}

/// Renders the caller's free text as `"<task>: <text>"`.
pub fn task_instruction(task: &str, input: &str) -> String {
    format!("{}: {}", task, input.trim())
}

/// Binds every declared task to the worker for its declared role, in task
/// order. Inputs are keyed by task name; a missing or blank input is a
/// configuration error.
pub fn bind_tasks(
    definition: &WorkflowDefinition,
    inputs: &HashMap<String, String>,
    workers: &[Arc<Worker>],
) -> Result<Vec<TaskItem>, CrewError> {
    let by_role = workers
        .iter()
        .map(|worker| (worker.role().clone(), worker.clone()))
        .collect::<BTreeMap<RoleName, Arc<Worker>>>();

    let unknown_inputs = inputs
        .keys()
        .filter(|key| !definition.tasks.iter().any(|task| task == *key))
        .cloned()
        .collect::<Vec<String>>();
    if !unknown_inputs.is_empty() {
        return Err(CrewError::config(format!(
            "workflow '{}' has no task named {}",
            definition.id,
            unknown_inputs
                .iter()
                .map(|name| format!("'{name}'"))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    definition
        .tasks
        .iter()
        .map(|task| {
            let role = definition.declared_role(task)?;
            let input = inputs
                .get(task)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    CrewError::config(format!("missing input for task '{task}' (pass --input \"{task}=...\")"))
                })?;
            let worker = by_role.get(role).ok_or_else(|| CrewError::UnboundTask {
                task: task.clone(),
                role: role.to_string(),
            })?;
            Ok(TaskItem {
                name: task.clone(),
                instruction: task_instruction(task, input),
                worker: worker.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::backend::testing::ScriptedBackend;
    use crate::capability::policy::CapabilityPolicy;
    use crate::capability::resolver::{CapabilityResolver, RoleCapabilityMap};
    use crate::capability::{CapabilityRegistry, Credentials};
    use crate::catalog::{Catalog, TaskBinding};
    use crate::error::ErrorKind;
    use crate::worker::{DEFAULT_GOAL_TEMPLATE, SharedBackend, WorkerFactory};

    fn workers_for(roles: &[&str]) -> Vec<Arc<Worker>> {
        let map = RoleCapabilityMap::default();
        let pool = CapabilityRegistry::new().instantiate(&BTreeSet::new(), &Credentials::default());
        let policy = CapabilityPolicy::default();
        let resolver = CapabilityResolver::new(&map, &pool, &policy);
        let overrides = BTreeMap::new();
        let shared = SharedBackend(ScriptedBackend::echo());
        let roles = roles.iter().map(|r| RoleName::from(*r)).collect::<Vec<_>>();
        WorkerFactory::new(DEFAULT_GOAL_TEMPLATE, &overrides, &shared)
            .build(&roles, &resolver)
            .unwrap()
    }

    fn abc_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "abc".to_string(),
            description: "three steps".to_string(),
            roles: vec!["A".into(), "B".into(), "C".into()],
            tasks: vec!["T1".to_string(), "T2".to_string(), "T3".to_string()],
            binding: TaskBinding::Positional,
            goal_overrides: BTreeMap::new(),
        }
    }

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn binding_ignores_worker_construction_order() {
        let definition = abc_definition();
        let mut workers = workers_for(&["C", "A", "B"]);
        workers.reverse();
        let items = bind_tasks(
            &definition,
            &inputs(&[("T1", "x"), ("T2", "y"), ("T3", "z")]),
            &workers,
        )
        .expect("bind");

        let pairs = items
            .iter()
            .map(|item| (item.name.as_str(), item.role().as_str()))
            .collect::<Vec<_>>();
        assert_eq!(pairs, vec![("T1", "A"), ("T2", "B"), ("T3", "C")]);
        assert_eq!(items[1].instruction, "T2: y");
    }

    #[test]
    fn every_marketing_task_binds_to_its_declared_role() {
        let catalog = Catalog::builtin();
        let definition = catalog.get("Marketing Campaign").unwrap();
        let roles = definition.roles.iter().map(RoleName::as_str).collect::<Vec<_>>();
        let workers = workers_for(&roles);
        let inputs = definition
            .tasks
            .iter()
            .map(|task| (task.clone(), "spring launch".to_string()))
            .collect::<HashMap<_, _>>();

        let items = bind_tasks(definition, &inputs, &workers).unwrap();
        assert_eq!(items.len(), definition.tasks.len());
        for item in &items {
            assert_eq!(item.role(), definition.declared_role(&item.name).unwrap());
        }
    }

    #[test]
    fn missing_worker_is_an_unbound_task_error() {
        let definition = abc_definition();
        let workers = workers_for(&["A", "C"]);
        let err = bind_tasks(
            &definition,
            &inputs(&[("T1", "x"), ("T2", "y"), ("T3", "z")]),
            &workers,
        )
        .unwrap_err();
        assert!(matches!(err, CrewError::UnboundTask { ref task, ref role } if task == "T2" && role == "B"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn blank_or_unknown_inputs_are_rejected() {
        let definition = abc_definition();
        let workers = workers_for(&["A", "B", "C"]);

        let err = bind_tasks(&definition, &inputs(&[("T1", "x"), ("T2", "  "), ("T3", "z")]), &workers)
            .unwrap_err();
        assert!(err.to_string().contains("missing input for task 'T2'"));

        let err = bind_tasks(
            &definition,
            &inputs(&[("T1", "x"), ("T2", "y"), ("T3", "z"), ("T9", "?")]),
            &workers,
        )
        .unwrap_err();
        assert!(err.to_string().contains("'T9'"));
    }
}
