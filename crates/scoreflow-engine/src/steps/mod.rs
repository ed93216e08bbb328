// Step executor plug-ins
//
// A step executor is addressed by the `type` string of a workflow step.
// Executors receive the rendered step config plus an execution context and
// return success (optionally with structured outputs) or a failure message.
// They must honor the cancellation signal and never wait without a
// deadline.

mod builtin;
mod command;
mod http;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;

use scoreflow_core::{CoreError, Result};

pub use builtin::{DummyStep, PolicyStep, TerraformGenerateStep, ValidateStep};
pub use command::{AnsibleStep, GitCommitManifestsStep, KubernetesStep, TerraformStep};
pub use http::{ArgocdAppStep, GiteaRepoStep};

/// Execution context handed to every step executor
#[derive(Debug, Clone)]
pub struct StepContext {
    pub app_name: String,
    pub execution_id: i64,
    pub step_name: String,
    /// Per-step scratch directory, created lazily by the executor
    pub workspace: PathBuf,
    /// Flips to true on shutdown; executors must stop promptly
    pub cancel: watch::Receiver<bool>,
}

impl StepContext {
    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Successful step result
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Structured outputs visible to later steps and merged into resource
    /// provider metadata
    pub outputs: Map<String, Value>,
    /// Human-readable log text persisted on the step record
    pub logs: String,
}

impl StepOutput {
    pub fn with_logs(logs: impl Into<String>) -> Self {
        Self {
            outputs: Map::new(),
            logs: logs.into(),
        }
    }

    pub fn output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// A pluggable handler for one step type
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, config: &Map<String, Value>, ctx: &StepContext)
        -> Result<StepOutput>;
}

impl std::fmt::Debug for dyn StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StepExecutor")
    }
}

/// Table-driven registry mapping step types to executors
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// An empty registry; callers register their own handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler slot populated
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("dummy", DummyStep);
        registry.register("validate", ValidateStep);
        registry.register("validation", ValidateStep);
        registry.register("policy", PolicyStep);
        registry.register("terraform-generate", TerraformGenerateStep);
        registry.register("terraform", TerraformStep::default());
        registry.register("kubernetes", KubernetesStep::default());
        registry.register("ansible", AnsibleStep::default());
        registry.register("git-commit-manifests", GitCommitManifestsStep::default());
        registry.register("gitea-repo", GiteaRepoStep::default());
        registry.register("argocd-app", ArgocdAppStep::default());
        registry
    }

    /// Register (or replace) a handler for a step type
    pub fn register(&mut self, step_type: impl Into<String>, handler: impl StepExecutor + 'static) {
        self.handlers.insert(step_type.into(), Arc::new(handler));
    }

    /// Look up the handler for a step type
    pub fn get(&self, step_type: &str) -> Result<Arc<dyn StepExecutor>> {
        self.handlers
            .get(step_type)
            .cloned()
            .ok_or_else(|| CoreError::UnknownStepType(step_type.to_string()))
    }

    /// Registered step types, sorted
    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Read a required string field from a step config
pub(crate) fn required_str<'a>(config: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::step_failed(format!("missing required config field '{key}'")))
}

/// Read an optional string field from a step config
pub(crate) fn optional_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_required_slots() {
        let registry = StepRegistry::with_builtins();
        for step_type in [
            "validate",
            "kubernetes",
            "terraform",
            "terraform-generate",
            "ansible",
            "gitea-repo",
            "argocd-app",
            "git-commit-manifests",
            "policy",
            "validation",
            "dummy",
        ] {
            assert!(registry.get(step_type).is_ok(), "missing slot {step_type}");
        }
    }

    #[test]
    fn test_unknown_type_fails_loudly() {
        let registry = StepRegistry::with_builtins();
        let err = registry.get("quantum-fabric").unwrap_err();
        assert!(matches!(err, CoreError::UnknownStepType(_)));
        assert_eq!(err.to_string(), "unknown step type: 'quantum-fabric'");
    }
}
