// Workflow definition model
//
// A workflow is an ordered list of steps, optionally grouped for parallel
// execution. Definitions are YAML files shipped by providers; the executor
// consumes the parsed form.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("unknown workflow status: '{other}'")),
        }
    }
}

/// Status of a single step within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status: '{other}'")),
        }
    }
}

/// One step of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<i32>,
    /// Conditional expression; a falsy result marks the step `skipped`
    #[serde(rename = "if", alias = "when", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Wrapper accepting both bare `steps:` and `spec.steps:` layouts
#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    metadata: Option<RawWorkflowMetadata>,
    #[serde(default)]
    spec: Option<RawWorkflowSpec>,
    #[serde(default)]
    steps: Vec<StepDefinition>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowMetadata {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowSpec {
    #[serde(default)]
    steps: Vec<StepDefinition>,
}

/// A parsed, validated workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Build from steps directly (tests and programmatic callers)
    pub fn from_steps(steps: Vec<StepDefinition>) -> Self {
        Self { name: None, steps }
    }

    /// Parse a workflow definition from YAML and validate it
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: RawWorkflow = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::invalid_workflow(format!("workflow parse error: {e}")))?;

        let steps = match raw.spec {
            Some(spec) if !spec.steps.is_empty() => spec.steps,
            _ => raw.steps,
        };

        let definition = Self {
            name: raw.metadata.and_then(|m| m.name),
            steps,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Structural validation: at least one step, unique names, resolvable
    /// dependencies
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(CoreError::invalid_workflow("workflow has no steps"));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(CoreError::invalid_workflow("step with empty name"));
            }
            if step.step_type.trim().is_empty() {
                return Err(CoreError::invalid_workflow(format!(
                    "step '{}' has no type",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(CoreError::invalid_workflow(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        for step in &self.steps {
            for dependency in &step.depends_on {
                if dependency == &step.name {
                    return Err(CoreError::invalid_workflow(format!(
                        "step '{}' depends on itself",
                        step.name
                    )));
                }
                if !self.steps.iter().any(|s| &s.name == dependency) {
                    return Err(CoreError::invalid_workflow(format!(
                        "step '{}' depends on unknown step '{dependency}'",
                        step.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
metadata:
  name: provision-postgres
spec:
  steps:
    - name: validate-spec
      type: validate
    - name: generate
      type: terraform-generate
      config:
        resource: postgres
    - name: apply
      type: terraform
      depends_on: [generate]
      config:
        operation: apply
"#;

    const PARALLEL_WORKFLOW: &str = r#"
steps:
  - name: base
    type: dummy
  - name: left
    type: dummy
    parallel: true
    parallel_group: 1
    depends_on: [base]
  - name: right
    type: dummy
    parallel: true
    parallel_group: 1
    depends_on: [base]
  - name: conditional
    type: dummy
    if: "steps.base.outputs.enabled == 'true'"
"#;

    #[test]
    fn test_parse_spec_steps_layout() {
        let workflow = WorkflowDefinition::from_yaml(WORKFLOW).unwrap();
        assert_eq!(workflow.name.as_deref(), Some("provision-postgres"));
        assert_eq!(workflow.total_steps(), 3);
        assert_eq!(workflow.steps[2].depends_on, vec!["generate"]);
        assert_eq!(workflow.steps[1].config["resource"], "postgres");
    }

    #[test]
    fn test_parse_bare_steps_layout() {
        let workflow = WorkflowDefinition::from_yaml(PARALLEL_WORKFLOW).unwrap();
        assert_eq!(workflow.total_steps(), 4);
        assert!(workflow.steps[1].parallel);
        assert_eq!(workflow.steps[1].parallel_group, Some(1));
        assert_eq!(
            workflow.steps[3].condition.as_deref(),
            Some("steps.base.outputs.enabled == 'true'")
        );
    }

    #[test]
    fn test_round_trip() {
        let workflow = WorkflowDefinition::from_yaml(WORKFLOW).unwrap();
        let yaml = serde_yaml::to_string(&workflow).unwrap();
        let reparsed: WorkflowDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(workflow, reparsed);
    }

    #[test]
    fn test_validation_failures() {
        assert!(WorkflowDefinition::from_yaml("steps: []").is_err());

        let duplicate = r#"
steps:
  - name: a
    type: dummy
  - name: a
    type: dummy
"#;
        assert!(WorkflowDefinition::from_yaml(duplicate).is_err());

        let unknown_dep = r#"
steps:
  - name: a
    type: dummy
    depends_on: [ghost]
"#;
        assert!(WorkflowDefinition::from_yaml(unknown_dep).is_err());

        let self_dep = r#"
steps:
  - name: a
    type: dummy
    depends_on: [a]
"#;
        assert!(WorkflowDefinition::from_yaml(self_dep).is_err());
    }
}
