// In-process step executors

use async_trait::async_trait;
use serde_json::{Map, Value};

use scoreflow_core::{CoreError, Result, ScoreSpec};

use super::{optional_str, StepContext, StepExecutor, StepOutput};

/// Test step: succeeds by default, fails when `fail: true`, passes any
/// configured `outputs` through
pub struct DummyStep;

#[async_trait]
impl StepExecutor for DummyStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        if config.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            let message = optional_str(config, "message").unwrap_or("dummy step failed");
            return Err(CoreError::step_failed(message));
        }

        let mut output = StepOutput::with_logs(format!("dummy step '{}' ok", ctx.step_name));
        if let Some(Value::Object(outputs)) = config.get("outputs") {
            output.outputs = outputs.clone();
        }
        Ok(output)
    }
}

/// Structural validation of an inline Score spec
///
/// With a `spec` field the YAML is parsed and validated; without one the
/// step degrades to a config presence check.
pub struct ValidateStep;

#[async_trait]
impl StepExecutor for ValidateStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        if let Some(raw) = optional_str(config, "spec") {
            let spec = ScoreSpec::from_yaml(raw)
                .map_err(|e| CoreError::step_failed(format!("spec validation failed: {e}")))?;
            return Ok(StepOutput::with_logs(format!(
                "validated spec for app '{}' ({} resources)",
                spec.app_name(),
                spec.resources.len()
            ))
            .output("app", spec.app_name())
            .output("resource_count", spec.resources.len()));
        }

        Ok(StepOutput::with_logs(format!(
            "validation for app '{}' passed (no inline spec)",
            ctx.app_name
        )))
    }
}

/// Rule-based config checks
///
/// `rules` is a list of `{path, equals}` objects evaluated against the
/// `input` object; the first violated rule fails the step.
pub struct PolicyStep;

#[async_trait]
impl StepExecutor for PolicyStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        _ctx: &StepContext,
    ) -> Result<StepOutput> {
        let input = config
            .get("input")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let rules = config
            .get("rules")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut checked = 0usize;
        for rule in &rules {
            let Some(rule) = rule.as_object() else {
                return Err(CoreError::step_failed("malformed policy rule"));
            };
            let Some(path) = rule.get("path").and_then(|v| v.as_str()) else {
                return Err(CoreError::step_failed("policy rule without path"));
            };
            let expected = rule.get("equals").cloned().unwrap_or(Value::Null);

            let mut current = input.get(path.split('.').next().unwrap_or(path));
            for part in path.split('.').skip(1) {
                current = current.and_then(|v| v.as_object()).and_then(|o| o.get(part));
            }

            if current != Some(&expected) {
                return Err(CoreError::step_failed(format!(
                    "policy violation: '{path}' is {:?}, expected {expected}",
                    current
                )));
            }
            checked += 1;
        }

        Ok(StepOutput::with_logs(format!("{checked} policy rules passed")))
    }
}

/// Renders a Terraform configuration into the step workspace
///
/// Emits the generated file path as the `manifest_path` output so a later
/// `terraform` step can apply it.
pub struct TerraformGenerateStep;

#[async_trait]
impl StepExecutor for TerraformGenerateStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let resource = optional_str(config, "resource").unwrap_or("resource");
        let variables = config
            .get("variables")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let document = serde_json::json!({
            "variable": variables,
            "module": {
                resource: {
                    "source": config.get("source").cloned().unwrap_or_else(|| Value::String(format!("./modules/{resource}"))),
                }
            }
        });

        tokio::fs::create_dir_all(&ctx.workspace)
            .await
            .map_err(|e| CoreError::step_failed(format!("workspace create failed: {e}")))?;
        let path = ctx.workspace.join("main.tf.json");
        let rendered = serde_json::to_string_pretty(&document)
            .map_err(|e| CoreError::step_failed(e.to_string()))?;
        tokio::fs::write(&path, rendered)
            .await
            .map_err(|e| CoreError::step_failed(format!("write {} failed: {e}", path.display())))?;

        Ok(
            StepOutput::with_logs(format!("generated {}", path.display()))
                .output("manifest_path", path.display().to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use tokio::sync::watch;

    fn ctx(workspace: PathBuf) -> StepContext {
        let (_tx, cancel) = watch::channel(false);
        StepContext {
            app_name: "demo".to_string(),
            execution_id: 1,
            step_name: "step".to_string(),
            workspace,
            cancel,
        }
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_dummy_success_and_outputs() {
        let out = DummyStep
            .execute(
                &config(json!({"outputs": {"endpoint": "db:5432"}})),
                &ctx(PathBuf::from("/tmp")),
            )
            .await
            .unwrap();
        assert_eq!(out.outputs["endpoint"], "db:5432");
    }

    #[tokio::test]
    async fn test_dummy_failure() {
        let err = DummyStep
            .execute(
                &config(json!({"fail": true, "message": "boom"})),
                &ctx(PathBuf::from("/tmp")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "step failed: boom");
    }

    #[tokio::test]
    async fn test_validate_inline_spec() {
        let spec = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
resources:
  db:
    type: postgres
"#;
        let out = ValidateStep
            .execute(&config(json!({"spec": spec})), &ctx(PathBuf::from("/tmp")))
            .await
            .unwrap();
        assert_eq!(out.outputs["app"], "demo");
        assert_eq!(out.outputs["resource_count"], 1);
    }

    #[tokio::test]
    async fn test_policy_rules() {
        let cfg = config(json!({
            "input": {"tier": "production", "limits": {"replicas": 3}},
            "rules": [
                {"path": "tier", "equals": "production"},
                {"path": "limits.replicas", "equals": 3}
            ]
        }));
        PolicyStep.execute(&cfg, &ctx(PathBuf::from("/tmp"))).await.unwrap();

        let bad = config(json!({
            "input": {"tier": "dev"},
            "rules": [{"path": "tier", "equals": "production"}]
        }));
        assert!(PolicyStep.execute(&bad, &ctx(PathBuf::from("/tmp"))).await.is_err());
    }

    #[tokio::test]
    async fn test_terraform_generate_writes_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let out = TerraformGenerateStep
            .execute(
                &config(json!({"resource": "postgres", "variables": {"size": {"default": "small"}}})),
                &ctx(tmp.path().join("work")),
            )
            .await
            .unwrap();

        let path = out.outputs["manifest_path"].as_str().unwrap();
        let rendered = tokio::fs::read_to_string(path).await.unwrap();
        assert!(rendered.contains("postgres"));
    }
}
