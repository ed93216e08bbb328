// API-backed step executors (Gitea, Argo CD)
//
// Both talk to their service REST APIs with short request timeouts and
// treat cancellation as an abort. Credentials come from the step config or
// the conventional environment variables.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use scoreflow_core::{CoreError, Result};

use super::{optional_str, required_str, StepContext, StepExecutor, StepOutput};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| CoreError::step_failed(format!("http client: {e}")))
}

fn credential(config: &Map<String, Value>, key: &str, env: &str) -> Result<String> {
    if let Some(value) = optional_str(config, key) {
        return Ok(value.to_string());
    }
    std::env::var(env)
        .map_err(|_| CoreError::step_failed(format!("missing '{key}' config and {env} env var")))
}

async fn send_cancellable(
    request: reqwest::RequestBuilder,
    ctx: &StepContext,
) -> Result<reqwest::Response> {
    if ctx.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    let mut cancel = ctx.cancel.clone();
    tokio::select! {
        response = request.send() => {
            response.map_err(|e| CoreError::step_failed(format!("request failed: {e}")))
        }
        _ = cancel.changed() => Err(CoreError::Cancelled),
    }
}

/// `gitea-repo` step: ensure a repository exists for the application
#[derive(Default)]
pub struct GiteaRepoStep;

#[async_trait]
impl StepExecutor for GiteaRepoStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let base_url = credential(config, "url", "GITEA_URL")?;
        let token = credential(config, "token", "GITEA_TOKEN")?;
        let owner = required_str(config, "owner")?;
        let repo = optional_str(config, "repo").unwrap_or(&ctx.app_name);

        let client = http_client()?;
        let base_url = base_url.trim_end_matches('/');

        // Idempotent: an existing repository is a success
        let existing = send_cancellable(
            client
                .get(format!("{base_url}/api/v1/repos/{owner}/{repo}"))
                .header("Authorization", format!("token {token}")),
            ctx,
        )
        .await?;
        if existing.status().is_success() {
            debug!(owner, repo, "Gitea repository already exists");
            return Ok(StepOutput::with_logs(format!("repository {owner}/{repo} exists"))
                .output("repo", format!("{owner}/{repo}")));
        }

        let response = send_cancellable(
            client
                .post(format!("{base_url}/api/v1/orgs/{owner}/repos"))
                .header("Authorization", format!("token {token}"))
                .json(&json!({
                    "name": repo,
                    "private": config.get("private").and_then(|v| v.as_bool()).unwrap_or(true),
                    "auto_init": true,
                })),
            ctx,
        )
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::step_failed(format!(
                "gitea repo create returned {status}: {body}"
            )));
        }

        Ok(StepOutput::with_logs(format!("created repository {owner}/{repo}"))
            .output("repo", format!("{owner}/{repo}")))
    }
}

/// `argocd-app` step: create or update an Argo CD application
#[derive(Default)]
pub struct ArgocdAppStep;

#[async_trait]
impl StepExecutor for ArgocdAppStep {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput> {
        let base_url = credential(config, "url", "ARGOCD_URL")?;
        let token = credential(config, "token", "ARGOCD_TOKEN")?;
        let repo_url = required_str(config, "repo_url")?;
        let path = optional_str(config, "path").unwrap_or(".");
        let namespace = optional_str(config, "namespace").unwrap_or(&ctx.app_name);
        let app = optional_str(config, "app").unwrap_or(&ctx.app_name);

        let client = http_client()?;
        let base_url = base_url.trim_end_matches('/');

        let body = json!({
            "metadata": { "name": app },
            "spec": {
                "project": config.get("project").cloned().unwrap_or_else(|| Value::String("default".into())),
                "source": { "repoURL": repo_url, "path": path, "targetRevision": "HEAD" },
                "destination": { "server": "https://kubernetes.default.svc", "namespace": namespace },
                "syncPolicy": { "automated": { "prune": true, "selfHeal": true } }
            }
        });

        // upsert=true makes re-runs idempotent
        let response = send_cancellable(
            client
                .post(format!("{base_url}/api/v1/applications?upsert=true"))
                .bearer_auth(&token)
                .json(&body),
            ctx,
        )
        .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::step_failed(format!(
                "argocd application create returned {status}: {text}"
            )));
        }

        Ok(StepOutput::with_logs(format!("argocd application '{app}' synced"))
            .output("application", app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::sync::watch;

    fn ctx() -> StepContext {
        let (_tx, cancel) = watch::channel(false);
        StepContext {
            app_name: "demo".to_string(),
            execution_id: 1,
            step_name: "step".to_string(),
            workspace: PathBuf::from("/tmp"),
            cancel,
        }
    }

    #[tokio::test]
    async fn test_gitea_requires_credentials() {
        // No config and (presumably) no env vars in the test environment
        let config = Map::new();
        std::env::remove_var("GITEA_URL");
        let err = GiteaRepoStep.execute(&config, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("GITEA_URL"));
    }

    #[tokio::test]
    async fn test_argocd_requires_repo_url() {
        let mut config = Map::new();
        config.insert("url".into(), Value::String("http://argocd.local".into()));
        config.insert("token".into(), Value::String("secret".into()));
        let err = ArgocdAppStep.execute(&config, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("repo_url"));
    }
}
