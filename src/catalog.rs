use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capability::resolver::RoleCapabilityMap;
use crate::error::CrewError;

/// Functional role label; keys both worker creation and capability resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleName(String);

impl RoleName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoleName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How each task finds its declared role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskBinding {
    /// Task `i` belongs to role `i`.
    Positional,
    /// Named task → role pairs.
    Explicit(BTreeMap<String, RoleName>),
}

impl TaskBinding {
    pub fn label(&self) -> &'static str {
        match self {
            TaskBinding::Positional => "positional",
            TaskBinding::Explicit(_) => "explicit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub description: String,
    pub roles: Vec<RoleName>,
    pub tasks: Vec<String>,
    pub binding: TaskBinding,
    pub goal_overrides: BTreeMap<RoleName, String>,
}

impl WorkflowDefinition {
    /// Role the catalog declares for `task`. Depends only on the definition.
    pub fn declared_role(&self, task: &str) -> Result<&RoleName, CrewError> {
        match &self.binding {
            TaskBinding::Positional => {
                let index = self
                    .tasks
                    .iter()
                    .position(|name| name == task)
                    .ok_or_else(|| {
                        CrewError::config(format!(
                            "task '{}' is not declared by workflow '{}'",
                            task, self.id
                        ))
                    })?;
                self.roles.get(index).ok_or_else(|| {
                    CrewError::config(format!(
                        "task '{}' (position {}) has no positional role in workflow '{}'",
                        task,
                        index + 1,
                        self.id
                    ))
                })
            }
            TaskBinding::Explicit(pairs) => pairs.get(task).ok_or_else(|| {
                CrewError::config(format!(
                    "task '{}' has no explicit role binding in workflow '{}'",
                    task, self.id
                ))
            }),
        }
    }

    pub fn validate(&self) -> Result<(), CrewError> {
        if self.id.trim().is_empty() {
            return Err(CrewError::config("workflow id cannot be empty"));
        }
        if self.tasks.is_empty() {
            return Err(CrewError::config(format!(
                "workflow '{}' declares no tasks",
                self.id
            )));
        }
        if let Some(role) = self.roles.iter().find(|role| role.as_str().trim().is_empty()) {
            return Err(CrewError::config(format!(
                "workflow '{}' has an empty role name ('{}')",
                self.id, role
            )));
        }

        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if task.trim().is_empty() {
                return Err(CrewError::config(format!(
                    "workflow '{}' has an empty task name",
                    self.id
                )));
            }
            if !seen.insert(task.as_str()) {
                return Err(CrewError::config(format!(
                    "workflow '{}' declares task '{}' more than once",
                    self.id, task
                )));
            }
        }

        if let TaskBinding::Explicit(pairs) = &self.binding {
            if let Some(unknown) = pairs.keys().find(|task| !seen.contains(task.as_str())) {
                return Err(CrewError::config(format!(
                    "workflow '{}' binds unknown task '{}'",
                    self.id, unknown
                )));
            }
        }

        for task in &self.tasks {
            let role = self.declared_role(task)?;
            if !self.roles.contains(role) {
                return Err(CrewError::config(format!(
                    "workflow '{}' binds task '{}' to undeclared role '{}'",
                    self.id, task, role
                )));
            }
        }

        for role in self.goal_overrides.keys() {
            if !self.roles.contains(role) {
                return Err(CrewError::config(format!(
                    "workflow '{}' overrides the goal of undeclared role '{}'",
                    self.id, role
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowFileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowFileEntry {
    pub description: String,
    pub roles: Vec<String>,
    pub tasks: Vec<String>,
    /// Empty means positional binding.
    #[serde(default)]
    pub task_roles: BTreeMap<String, String>,
    #[serde(default)]
    pub goals: BTreeMap<String, String>,
}

impl WorkflowFileEntry {
    pub fn into_definition(self, id: String) -> WorkflowDefinition {
        let binding = if self.task_roles.is_empty() {
            TaskBinding::Positional
        } else {
            TaskBinding::Explicit(
                self.task_roles
                    .into_iter()
                    .map(|(task, role)| (task, RoleName::new(role)))
                    .collect(),
            )
        };
        WorkflowDefinition {
            id,
            description: self.description,
            roles: self.roles.into_iter().map(RoleName::new).collect(),
            tasks: self.tasks,
            binding,
            goal_overrides: self
                .goals
                .into_iter()
                .map(|(role, goal)| (RoleName::new(role), goal))
                .collect(),
        }
    }
}

/// Read-only set of workflow definitions, loaded once per process.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl Catalog {
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        catalog.workflows.insert(
            "Marketing Campaign".to_string(),
            WorkflowDefinition {
                id: "Marketing Campaign".to_string(),
                description: "Generate a marketing plan, target audience research, and ad copy."
                    .to_string(),
                roles: [
                    "Market Researcher",
                    "Target Audience Analyst",
                    "Content Writer",
                    "Campaign Manager",
                ]
                .into_iter()
                .map(RoleName::from)
                .collect(),
                tasks: [
                    "Generate Marketing Plan",
                    "Research Target Audience",
                    "Write Ad Copy",
                    "Create Campaign Schedule",
                ]
                .into_iter()
                .map(str::to_string)
                .collect(),
                binding: TaskBinding::Positional,
                goal_overrides: BTreeMap::new(),
            },
        );
        catalog
    }

    pub fn from_definitions(
        definitions: impl IntoIterator<Item = WorkflowDefinition>,
    ) -> Result<Self, CrewError> {
        let mut catalog = Self::default();
        for definition in definitions {
            catalog.insert(definition)?;
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, definition: WorkflowDefinition) -> Result<(), CrewError> {
        definition.validate()?;
        self.workflows.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn merge_toml_str(&mut self, content: &str) -> Result<(), CrewError> {
        let parsed = toml::from_str::<CatalogFile>(content)
            .map_err(|err| CrewError::config(format!("invalid catalog file: {err}")))?;
        for (id, entry) in parsed.workflows {
            self.insert(entry.into_definition(id))?;
        }
        Ok(())
    }

    /// Built-in workflows plus entries from `path`; file entries replace
    /// built-ins with the same id.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut catalog = Self::builtin();
        let Some(path) = path else {
            return Ok(catalog);
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "catalog file not found; using built-in workflows");
            return Ok(catalog);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog file at '{}'", path.display()))?;
        catalog.merge_toml_str(&content).with_context(|| {
            format!(
                "invalid catalog configuration in '{}'. Check roles, tasks, and task_roles.",
                path.display()
            )
        })?;
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Result<&WorkflowDefinition, CrewError> {
        self.workflows.get(id.trim()).ok_or_else(|| {
            CrewError::config(format!(
                "workflow '{}' not found in catalog. Available workflows: {}",
                id.trim(),
                self.ids().join(", ")
            ))
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.workflows.values()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

pub fn run_examples_list(catalog: &Catalog) -> Result<()> {
    println!("Available workflows ({}):", catalog.len());
    for definition in catalog.iter() {
        println!(
            "- {} ({} roles, {} tasks): {}",
            definition.id,
            definition.roles.len(),
            definition.tasks.len(),
            definition.description
        );
    }
    Ok(())
}

pub fn run_examples_show(
    catalog: &Catalog,
    role_capabilities: &RoleCapabilityMap,
    name: &str,
) -> Result<()> {
    let definition = catalog.get(name)?;
    println!("Workflow: {}", definition.id);
    println!("Description: {}", definition.description);
    println!("Binding: {}", definition.binding.label());
    println!("Tasks:");
    for (index, task) in definition.tasks.iter().enumerate() {
        let role = definition.declared_role(task)?;
        println!("{}. {} -> {}", index + 1, task, role);
    }
    println!("Roles:");
    for role in &definition.roles {
        let capabilities = role_capabilities.capabilities_for(role);
        if capabilities.is_empty() {
            println!("- {role} (no capabilities)");
        } else {
            println!("- {role} ({})", capabilities.join(", "));
        }
    }
    if !definition.goal_overrides.is_empty() {
        println!("Goal overrides:");
        for (role, goal) in &definition.goal_overrides {
            println!("- {role}: {goal}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_marketing_campaign_binds_positionally() {
        let catalog = Catalog::builtin();
        let definition = catalog.get("Marketing Campaign").expect("built-in workflow");
        definition.validate().expect("built-in workflow should validate");

        let pairs = definition
            .tasks
            .iter()
            .map(|task| {
                (
                    task.as_str(),
                    definition.declared_role(task).expect("role").as_str(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                ("Generate Marketing Plan", "Market Researcher"),
                ("Research Target Audience", "Target Audience Analyst"),
                ("Write Ad Copy", "Content Writer"),
                ("Create Campaign Schedule", "Campaign Manager"),
            ]
        );
    }

    #[test]
    fn explicit_bindings_load_from_toml() {
        let mut catalog = Catalog::default();
        catalog
            .merge_toml_str(
                r#"
                [workflows."Product Launch"]
                description = "Plan a launch."
                roles = ["Strategist", "Writer"]
                tasks = ["Draft Announcement", "Set Strategy"]

                [workflows."Product Launch".task_roles]
                "Draft Announcement" = "Writer"
                "Set Strategy" = "Strategist"

                [workflows."Product Launch".goals]
                "Writer" = "Write crisp launch copy."
                "#,
            )
            .expect("catalog should parse");

        let definition = catalog.get("Product Launch").expect("workflow");
        assert_eq!(definition.binding.label(), "explicit");
        assert_eq!(
            definition.declared_role("Draft Announcement").unwrap().as_str(),
            "Writer"
        );
        assert_eq!(
            definition.goal_overrides.get(&RoleName::from("Writer")).map(String::as_str),
            Some("Write crisp launch copy.")
        );
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let err = Catalog::from_definitions([WorkflowDefinition {
            id: "dup".to_string(),
            description: String::new(),
            roles: vec![RoleName::from("A"), RoleName::from("B")],
            tasks: vec!["T".to_string(), "T".to_string()],
            binding: TaskBinding::Positional,
            goal_overrides: BTreeMap::new(),
        }])
        .expect_err("duplicate tasks must fail");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn positional_binding_requires_a_role_per_task() {
        let definition = WorkflowDefinition {
            id: "short".to_string(),
            description: String::new(),
            roles: vec![RoleName::from("A")],
            tasks: vec!["T1".to_string(), "T2".to_string()],
            binding: TaskBinding::Positional,
            goal_overrides: BTreeMap::new(),
        };
        let err = definition.validate().expect_err("missing role must fail");
        assert!(err.to_string().contains("no positional role"));
    }

    #[test]
    fn explicit_binding_to_undeclared_role_is_rejected() {
        let mut catalog = Catalog::default();
        let err = catalog
            .merge_toml_str(
                r#"
                [workflows.bad]
                description = "x"
                roles = ["A"]
                tasks = ["T1"]
                task_roles = { "T1" = "Z" }
                "#,
            )
            .expect_err("undeclared role must fail");
        assert!(err.to_string().contains("undeclared role 'Z'"));
    }

    #[test]
    fn unknown_workflow_lists_available_ids() {
        let err = Catalog::builtin().get("Nope").expect_err("unknown id");
        assert!(err.to_string().contains("Marketing Campaign"));
    }

    #[test]
    fn demo_catalog_loads_alongside_builtin() {
        let mut catalog = Catalog::builtin();
        catalog
            .merge_toml_str(include_str!("../demos/catalog.toml"))
            .expect("demo catalog should parse");
        assert_eq!(catalog.len(), 3);

        let launch = catalog.get("Product Launch").unwrap();
        assert_eq!(
            launch.declared_role("Draft Announcement").unwrap().as_str(),
            "Content Writer"
        );
        let research = catalog.get("Customer Research").unwrap();
        assert_eq!(
            research.declared_role("Profile Customers").unwrap().as_str(),
            "Target Audience Analyst"
        );
    }
}
