// External-CLI step executors
//
// terraform / kubectl / ansible-playbook / git run as child processes in
// the step workspace (or a configured directory). Cancellation kills the
// child; output is captured into the step logs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use scoreflow_core::{CoreError, Result};

use super::{optional_str, required_str, StepContext, StepExecutor, StepOutput};

/// Hard ceiling for a single child process
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1800);

/// Run one child process under the step's cancellation signal
async fn run_command(
    program: &str,
    args: &[&str],
    dir: &Path,
    ctx: &StepContext,
) -> Result<String> {
    if ctx.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    debug!(program, ?args, dir = %dir.display(), "Running step command");

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::step_failed(format!("{program}: {e}")))?;

    let mut cancel = ctx.cancel.clone();
    let output = tokio::select! {
        output = child.wait_with_output() => {
            output.map_err(|e| CoreError::step_failed(format!("{program}: {e}")))?
        }
        _ = cancel.changed() => {
            warn!(program, "Step command cancelled");
            return Err(CoreError::Cancelled);
        }
        _ = tokio::time::sleep(DEFAULT_COMMAND_TIMEOUT) => {
            return Err(CoreError::step_failed(format!(
                "{program} timed out after {}s",
                DEFAULT_COMMAND_TIMEOUT.as_secs()
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        Ok(stdout)
    } else {
        Err(CoreError::step_failed(format!(
            "{program} {} exited with {}: {}",
            args.first().unwrap_or(&""),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn working_dir(config: &Map<String, Value>, ctx: &StepContext) -> PathBuf {
    optional_str(config, "working_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.workspace.clone())
}

/// `terraform` step: init + plan/apply/destroy in the working directory
#[derive(Default)]
pub struct TerraformStep;

#[async_trait]
impl StepExecutor for TerraformStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let operation = optional_str(config, "operation").unwrap_or("apply");
        let dir = working_dir(config, ctx);

        let op_args: &[&str] = match operation {
            "plan" => &["plan", "-input=false"],
            "apply" => &["apply", "-input=false", "-auto-approve"],
            "destroy" => &["destroy", "-input=false", "-auto-approve"],
            other => {
                return Err(CoreError::step_failed(format!(
                    "unsupported terraform operation '{other}'"
                )))
            }
        };

        let mut logs = run_command("terraform", &["init", "-input=false"], &dir, ctx).await?;
        logs.push_str(&run_command("terraform", op_args, &dir, ctx).await?);

        Ok(StepOutput::with_logs(logs).output("operation", operation))
    }
}

/// `kubernetes` step: kubectl apply of configured manifests
#[derive(Default)]
pub struct KubernetesStep;

#[async_trait]
impl StepExecutor for KubernetesStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let manifests = required_str(config, "manifests")?;
        let dir = working_dir(config, ctx);

        let mut args = vec!["apply", "-f", manifests];
        let namespace = optional_str(config, "namespace");
        if let Some(namespace) = namespace {
            args.extend(["-n", namespace]);
        }

        let logs = run_command("kubectl", &args, &dir, ctx).await?;
        let mut output = StepOutput::with_logs(logs);
        if let Some(namespace) = namespace {
            output = output.output("namespace", namespace);
        }
        Ok(output)
    }
}

/// `ansible` step: ansible-playbook with optional inventory and extra vars
#[derive(Default)]
pub struct AnsibleStep;

#[async_trait]
impl StepExecutor for AnsibleStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let playbook = required_str(config, "playbook")?;
        let dir = working_dir(config, ctx);

        let mut args: Vec<&str> = vec![playbook];
        if let Some(inventory) = optional_str(config, "inventory") {
            args.extend(["-i", inventory]);
        }
        let extra_vars = config
            .get("extra_vars")
            .map(|v| v.to_string())
            .unwrap_or_default();
        if !extra_vars.is_empty() {
            args.extend(["--extra-vars", extra_vars.as_str()]);
        }

        let logs = run_command("ansible-playbook", &args, &dir, ctx).await?;
        Ok(StepOutput::with_logs(logs))
    }
}

/// `git-commit-manifests` step: stage, commit and push rendered manifests
#[derive(Default)]
pub struct GitCommitManifestsStep;

#[async_trait]
impl StepExecutor for GitCommitManifestsStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let repo_dir = PathBuf::from(required_str(config, "repo_dir")?);
        let message = optional_str(config, "message").unwrap_or("update manifests");
        let branch = optional_str(config, "branch").unwrap_or("main");

        let mut logs = run_command("git", &["add", "-A"], &repo_dir, ctx).await?;

        // An empty tree is not a failure; there is just nothing to push
        let status = run_command("git", &["status", "--porcelain"], &repo_dir, ctx).await?;
        if status.trim().is_empty() {
            logs.push_str("nothing to commit\n");
            return Ok(StepOutput::with_logs(logs).output("committed", false));
        }

        logs.push_str(&run_command("git", &["commit", "-m", message], &repo_dir, ctx).await?);
        logs.push_str(&run_command("git", &["push", "origin", branch], &repo_dir, ctx).await?);

        Ok(StepOutput::with_logs(logs).output("committed", true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
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

    #[tokio::test]
    async fn test_missing_required_config() {
        let err = KubernetesStep
            .execute(&Map::new(), &ctx(PathBuf::from("/tmp")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("manifests"));
    }

    #[tokio::test]
    async fn test_unsupported_terraform_operation() {
        let config = json!({"operation": "teleport"}).as_object().unwrap().clone();
        let err = TerraformStep
            .execute(&config, &ctx(PathBuf::from("/tmp")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (tx, cancel) = watch::channel(true);
        let ctx = StepContext {
            app_name: "demo".to_string(),
            execution_id: 1,
            step_name: "step".to_string(),
            workspace: PathBuf::from("/tmp"),
            cancel,
        };
        drop(tx);

        let err = run_command("git", &["status"], Path::new("/tmp"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }
}
