// Provider manifest loading
//
// Sources: a single file, a directory tree, or a Git repository checked out
// into a local cache. Directory loads continue past broken manifests with a
// warning and fail as a whole only on cross-provider capability conflicts.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, warn};

use scoreflow_core::{CoreError, ProviderManifest, Result, WorkflowDefinition};

use crate::registry::detect_conflicts;

/// Manifest file names accepted by the loader, current first
const MANIFEST_NAMES: [&str; 4] = [
    "provider.yaml",
    "provider.yml",
    "platform.yaml", // legacy
    "platform.yml",  // legacy
];

/// A validated provider together with the directory its workflow files
/// are relative to
#[derive(Debug, Clone)]
pub struct LoadedProvider {
    pub manifest: ProviderManifest,
    pub dir: PathBuf,
}

impl LoadedProvider {
    pub fn name(&self) -> &str {
        &self.manifest.metadata.name
    }

    /// Absolute path of a workflow file declared in the manifest
    pub fn workflow_path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

/// Remote provider source: a Git repository plus a ref to check out
#[derive(Debug, Clone)]
pub struct GitProviderSource {
    pub name: String,
    pub repo: String,
    /// Refs starting with `v` are treated as tags, anything else as a branch
    pub reference: String,
}

/// Loads and validates provider manifests
pub struct ProviderLoader {
    core_version: String,
}

impl ProviderLoader {
    pub fn new(core_version: impl Into<String>) -> Self {
        Self {
            core_version: core_version.into(),
        }
    }

    /// Load a single manifest: parse, migrate legacy lists, validate,
    /// check core compatibility, and validate every referenced workflow
    /// file
    pub async fn load_file(&self, path: &Path) -> Result<LoadedProvider> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::invalid_provider(format!("cannot read {}: {e}", path.display()))
        })?;

        let mut manifest = ProviderManifest::from_yaml(&raw)?;
        manifest.migrate_legacy();
        manifest.validate()?;
        manifest.check_compatibility(&self.core_version)?;

        let dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        for workflow in &manifest.workflows {
            let workflow_path = dir.join(&workflow.file);
            let yaml = tokio::fs::read_to_string(&workflow_path).await.map_err(|e| {
                CoreError::invalid_workflow(format!(
                    "provider '{}' workflow '{}': cannot read {}: {e}",
                    manifest.metadata.name,
                    workflow.name,
                    workflow_path.display()
                ))
            })?;
            WorkflowDefinition::from_yaml(&yaml).map_err(|e| {
                CoreError::invalid_workflow(format!(
                    "provider '{}' workflow '{}': {e}",
                    manifest.metadata.name, workflow.name
                ))
            })?;
        }

        info!(
            provider = %manifest.metadata.name,
            version = %manifest.metadata.version,
            workflows = manifest.workflows.len(),
            "Loaded provider manifest"
        );

        Ok(LoadedProvider { manifest, dir })
    }

    /// Walk a directory tree loading every manifest found
    ///
    /// Individual file failures are warnings; a capability conflict across
    /// the loaded set fails the whole load.
    pub async fn load_directory(&self, root: &Path) -> Result<Vec<LoadedProvider>> {
        let mut providers = Vec::new();
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                CoreError::invalid_provider(format!("cannot read {}: {e}", dir.display()))
            })?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| CoreError::invalid_provider(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !MANIFEST_NAMES.contains(&file_name) {
                    continue;
                }

                match self.load_file(&path).await {
                    Ok(provider) => providers.push(provider),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping provider manifest");
                    }
                }
            }
        }

        detect_conflicts(&providers)?;

        info!(count = providers.len(), root = %root.display(), "Provider directory loaded");
        Ok(providers)
    }

    /// Clone (or update) a Git-hosted provider into the cache and load it
    pub async fn load_from_git(
        &self,
        source: &GitProviderSource,
        cache_root: &Path,
    ) -> Result<LoadedProvider> {
        let checkout = cache_root.join(&source.name);

        if checkout.join(".git").is_dir() {
            info!(provider = %source.name, reference = %source.reference, "Updating cached provider checkout");
            run_git(&checkout, &["fetch", "--tags", "origin"]).await?;
        } else {
            tokio::fs::create_dir_all(&checkout).await.map_err(|e| {
                CoreError::invalid_provider(format!(
                    "cannot create cache dir {}: {e}",
                    checkout.display()
                ))
            })?;
            restrict_dir_mode(&checkout).await?;

            info!(provider = %source.name, repo = %source.repo, "Cloning provider repository");
            run_git(&checkout, &["clone", &source.repo, "."]).await?;
        }

        // Refs starting with `v` are tags by convention
        let refspec = if source.reference.starts_with('v') {
            format!("tags/{}", source.reference)
        } else {
            source.reference.clone()
        };
        run_git(&checkout, &["checkout", &refspec]).await?;

        let manifest_path = MANIFEST_NAMES
            .iter()
            .map(|name| checkout.join(name))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                CoreError::invalid_provider(format!(
                    "no provider manifest in {}",
                    checkout.display()
                ))
            })?;

        self.load_file(&manifest_path).await
    }
}

/// Run a git subcommand, surfacing stderr on failure
async fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| CoreError::invalid_provider(format!("git {}: {e}", args.join(" "))))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(CoreError::invalid_provider(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Cache checkouts are group-readable only (0750)
#[cfg(unix)]
async fn restrict_dir_mode(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750))
        .await
        .map_err(|e| CoreError::invalid_provider(format!("chmod {}: {e}", dir.display())))
}

#[cfg(not(unix))]
async fn restrict_dir_mode(_dir: &Path) -> Result<()> {
    Ok(())
}
