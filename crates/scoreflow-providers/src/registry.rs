// Provider registry and resolver
//
// The registry owns loaded providers and the capability index mapping each
// resource type (primary or alias) to its claiming provider. Spec
// validation at the ingest edge and workflow resolution in the execution
// path both consume this one index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use scoreflow_core::{CoreError, Operation, Result, WorkflowMetadata};
use scoreflow_core::provider::CATEGORY_PROVISIONER;

use crate::loader::LoadedProvider;

/// One capability index entry
#[derive(Debug, Clone)]
struct CapabilityEntry {
    provider_name: String,
    /// Primary type this entry routes to (identity for non-aliases)
    primary_type: String,
}

#[derive(Default)]
struct RegistryInner {
    providers: HashMap<String, Arc<LoadedProvider>>,
    capability_index: HashMap<String, CapabilityEntry>,
}

/// Build the capability index for a provider set, rejecting conflicting
/// primary claims
///
/// The error lists every conflicting type with both claimants, so a
/// directory-load failure names the offenders.
fn build_capability_index(
    providers: &[&LoadedProvider],
) -> Result<HashMap<String, CapabilityEntry>> {
    let mut index: HashMap<String, CapabilityEntry> = HashMap::new();
    let mut conflicts: Vec<String> = Vec::new();

    for provider in providers {
        let name = provider.name();
        for primary in provider.manifest.primary_resource_types() {
            match index.get(&primary) {
                Some(existing) if existing.provider_name != name => {
                    conflicts.push(format!(
                        "resource type '{primary}' claimed by '{}' and '{name}'",
                        existing.provider_name
                    ));
                }
                _ => {
                    index.insert(
                        primary.clone(),
                        CapabilityEntry {
                            provider_name: name.to_string(),
                            primary_type: primary,
                        },
                    );
                }
            }
        }
    }

    // Aliases route to their target's entry; they are excluded from the
    // conflict check
    for provider in providers {
        let name = provider.name();
        for capability in &provider.manifest.capabilities.resource_type_capabilities {
            if let Some(target) = &capability.alias_for {
                index
                    .entry(capability.resource_type.clone())
                    .or_insert_with(|| CapabilityEntry {
                        provider_name: name.to_string(),
                        primary_type: target.clone(),
                    });
            }
        }
    }

    if conflicts.is_empty() {
        Ok(index)
    } else {
        Err(CoreError::conflict(conflicts.join("; ")))
    }
}

/// Check a provider set for conflicting primary claims without registering
pub fn detect_conflicts(providers: &[LoadedProvider]) -> Result<()> {
    let refs: Vec<&LoadedProvider> = providers.iter().collect();
    build_capability_index(&refs).map(|_| ())
}

/// Holds loaded providers; resolves resource types to workflows
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, rebuilding the capability index atomically
    ///
    /// Fails on a duplicate name or a capability conflict; on failure the
    /// registry is unchanged.
    pub fn register(&self, provider: LoadedProvider) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.providers.contains_key(provider.name()) {
            return Err(CoreError::invalid_provider(format!(
                "provider '{}' already registered",
                provider.name()
            )));
        }

        let mut candidates: Vec<&LoadedProvider> =
            inner.providers.values().map(|p| p.as_ref()).collect();
        candidates.push(&provider);
        let index = build_capability_index(&candidates)?;

        inner.capability_index = index;
        inner
            .providers
            .insert(provider.name().to_string(), Arc::new(provider));
        Ok(())
    }

    /// Register a whole set atomically; on any failure nothing is
    /// registered
    pub fn register_all(&self, providers: Vec<LoadedProvider>) -> Result<()> {
        let mut inner = self.inner.write();

        let mut candidates: Vec<&LoadedProvider> =
            inner.providers.values().map(|p| p.as_ref()).collect();
        for provider in &providers {
            if inner.providers.contains_key(provider.name())
                || providers
                    .iter()
                    .filter(|p| p.name() == provider.name())
                    .count()
                    > 1
            {
                return Err(CoreError::invalid_provider(format!(
                    "provider '{}' already registered",
                    provider.name()
                )));
            }
        }
        candidates.extend(providers.iter());
        let index = build_capability_index(&candidates)?;

        inner.capability_index = index;
        for provider in providers {
            inner
                .providers
                .insert(provider.name().to_string(), Arc::new(provider));
        }
        Ok(())
    }

    /// Read-only snapshot of all providers
    pub fn list(&self) -> Vec<Arc<LoadedProvider>> {
        let mut providers: Vec<Arc<LoadedProvider>> =
            self.inner.read().providers.values().cloned().collect();
        providers.sort_by(|a, b| a.name().cmp(b.name()));
        providers
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedProvider>> {
        self.inner.read().providers.get(name).cloned()
    }

    /// Whether any provider claims the resource type (primary or alias)
    ///
    /// Spec validation uses this; it reads the same index `resolve` does.
    pub fn has_resource_type(&self, resource_type: &str) -> bool {
        self.inner
            .read()
            .capability_index
            .contains_key(resource_type)
    }

    /// Resolve a resource type + operation + tags to a provider and
    /// workflow
    pub fn resolve(
        &self,
        resource_type: &str,
        operation: Operation,
        tags: &[String],
    ) -> Result<(Arc<LoadedProvider>, WorkflowMetadata)> {
        let inner = self.inner.read();

        let entry = inner
            .capability_index
            .get(resource_type)
            .cloned()
            .ok_or_else(|| CoreError::no_provider(resource_type))?;
        let provider = inner
            .providers
            .get(&entry.provider_name)
            .cloned()
            .ok_or_else(|| CoreError::no_provider(resource_type))?;
        drop(inner);

        debug!(
            resource_type,
            primary_type = %entry.primary_type,
            provider = %entry.provider_name,
            operation = %operation,
            "Resolving workflow"
        );

        let mut candidates: Vec<&WorkflowMetadata> = provider
            .manifest
            .workflows
            .iter()
            .filter(|w| w.category == CATEGORY_PROVISIONER)
            .filter(|w| w.supports_operation(operation))
            .collect();

        if candidates.is_empty() {
            return Err(CoreError::no_workflow(resource_type, operation.as_str()));
        }

        if candidates.len() > 1 && !tags.is_empty() {
            let tagged: Vec<&WorkflowMetadata> = candidates
                .iter()
                .copied()
                .filter(|w| tags.iter().all(|tag| w.tags.contains(tag)))
                .collect();
            if tagged.is_empty() {
                return Err(CoreError::no_workflow(resource_type, operation.as_str()));
            }
            candidates = tagged;
        }

        if candidates.len() > 1 {
            candidates = highest_version(candidates);
        }

        match candidates.as_slice() {
            [workflow] => Ok((provider.clone(), (*workflow).clone())),
            many => Err(CoreError::AmbiguousWorkflow {
                resource_type: resource_type.to_string(),
                candidates: many.iter().map(|w| w.name.clone()).collect(),
            }),
        }
    }

    /// Resolve a named workflow from the provider claiming the type
    /// (workflow-override path)
    pub fn resolve_named(
        &self,
        resource_type: &str,
        workflow_name: &str,
    ) -> Result<(Arc<LoadedProvider>, WorkflowMetadata)> {
        let inner = self.inner.read();
        let entry = inner
            .capability_index
            .get(resource_type)
            .cloned()
            .ok_or_else(|| CoreError::no_provider(resource_type))?;
        let provider = inner
            .providers
            .get(&entry.provider_name)
            .cloned()
            .ok_or_else(|| CoreError::no_provider(resource_type))?;
        drop(inner);

        let workflow = provider
            .manifest
            .workflows
            .iter()
            .find(|w| w.name == workflow_name)
            .cloned()
            .ok_or_else(|| CoreError::no_workflow(resource_type, workflow_name))?;

        Ok((provider, workflow))
    }
}

/// Keep only the workflows with the highest declared semver version
///
/// Undeclared versions rank lowest. Returns more than one entry only when
/// the tie cannot be broken.
fn highest_version<'a>(candidates: Vec<&'a WorkflowMetadata>) -> Vec<&'a WorkflowMetadata> {
    let version_of = |w: &WorkflowMetadata| {
        w.version
            .as_deref()
            .and_then(|v| semver::Version::parse(v).ok())
            .unwrap_or_else(|| semver::Version::new(0, 0, 0))
    };

    let Some(max) = candidates.iter().map(|w| version_of(w)).max() else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|w| version_of(w) == max)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoreflow_core::ProviderManifest;
    use std::path::PathBuf;

    fn provider(yaml: &str) -> LoadedProvider {
        let mut manifest = ProviderManifest::from_yaml(yaml).unwrap();
        manifest.migrate_legacy();
        manifest.validate().unwrap();
        LoadedProvider {
            manifest,
            dir: PathBuf::from("/tmp/providers"),
        }
    }

    fn database_team() -> LoadedProvider {
        provider(
            r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata:
  name: database-team
  version: 1.0.0
compatibility:
  minCoreVersion: 0.1.0
capabilities:
  resourceTypes: [postgres]
  resourceTypeCapabilities:
    - type: postgresql
      aliasFor: postgres
workflows:
  - name: provision-postgres
    file: workflows/provision.yaml
    version: 1.0.0
    category: provisioner
    operations: [create]
  - name: provision-postgres-ha
    file: workflows/provision-ha.yaml
    version: 1.1.0
    category: provisioner
    tags: [ha]
    operations: [create]
  - name: teardown-postgres
    file: workflows/teardown.yaml
    version: 1.0.0
    category: provisioner
    operations: [delete]
  - name: postgres-goldenpath
    file: workflows/goldenpath.yaml
    category: goldenpath
"#,
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("database-team").is_some());
        assert!(registry.has_resource_type("postgres"));
        assert!(registry.has_resource_type("postgresql")); // alias
        assert!(!registry.has_resource_type("mysql"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();
        assert!(registry.register(database_team()).is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_resolve_by_operation() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        let (provider, workflow) = registry
            .resolve("postgres", Operation::Delete, &[])
            .unwrap();
        assert_eq!(provider.name(), "database-team");
        assert_eq!(workflow.name, "teardown-postgres");
    }

    #[test]
    fn test_resolve_alias_routes_to_primary() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        let (_, workflow) = registry
            .resolve("postgresql", Operation::Delete, &[])
            .unwrap();
        assert_eq!(workflow.name, "teardown-postgres");
    }

    #[test]
    fn test_resolve_tags_pick_superset() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        let tags = vec!["ha".to_string()];
        let (_, workflow) = registry.resolve("postgres", Operation::Create, &tags).unwrap();
        assert_eq!(workflow.name, "provision-postgres-ha");
    }

    #[test]
    fn test_resolve_version_tie_break() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        // Two create workflows; the ha variant has the higher version
        let (_, workflow) = registry.resolve("postgres", Operation::Create, &[]).unwrap();
        assert_eq!(workflow.name, "provision-postgres-ha");
    }

    #[test]
    fn test_resolve_ambiguous() {
        let registry = ProviderRegistry::new();
        registry.register(provider(
            r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata:
  name: cache-team
  version: 1.0.0
compatibility:
  minCoreVersion: 0.1.0
capabilities:
  resourceTypes: [redis]
workflows:
  - name: provision-a
    file: workflows/a.yaml
    version: 1.0.0
    category: provisioner
  - name: provision-b
    file: workflows/b.yaml
    version: 1.0.0
    category: provisioner
"#,
        ))
        .unwrap();

        let err = registry.resolve("redis", Operation::Create, &[]).unwrap_err();
        assert!(matches!(err, CoreError::AmbiguousWorkflow { .. }));
    }

    #[test]
    fn test_resolve_unknown_type() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        let err = registry.resolve("mysql", Operation::Create, &[]).unwrap_err();
        assert!(matches!(err, CoreError::NoProvider(_)));
        assert_eq!(
            err.to_string(),
            "no provider for resource type 'mysql'"
        );
    }

    #[test]
    fn test_goldenpath_not_resolved_for_operations() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        // update has no provisioner workflow declared
        let err = registry.resolve("postgres", Operation::Update, &[]).unwrap_err();
        assert!(matches!(err, CoreError::NoWorkflow { .. }));
    }

    #[test]
    fn test_resolve_named_override() {
        let registry = ProviderRegistry::new();
        registry.register(database_team()).unwrap();

        let (_, workflow) = registry
            .resolve_named("postgres", "postgres-goldenpath")
            .unwrap();
        assert_eq!(workflow.category, "goldenpath");
    }

    #[test]
    fn test_conflict_detection_lists_claimants() {
        let a = provider(
            r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata: { name: team-a, version: 1.0.0 }
compatibility: { minCoreVersion: 0.1.0 }
capabilities: { resourceTypes: [postgres] }
workflows:
  - { name: a, file: a.yaml, category: provisioner }
"#,
        );
        let b = provider(
            r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata: { name: team-b, version: 1.0.0 }
compatibility: { minCoreVersion: 0.1.0 }
capabilities: { resourceTypes: [postgres] }
workflows:
  - { name: b, file: b.yaml, category: provisioner }
"#,
        );

        let err = detect_conflicts(&[a, b]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("postgres"));
        assert!(msg.contains("team-a"));
        assert!(msg.contains("team-b"));
    }

    #[test]
    fn test_register_all_is_atomic() {
        let registry = ProviderRegistry::new();
        let a = database_team();
        let conflicting = provider(
            r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata: { name: team-b, version: 1.0.0 }
compatibility: { minCoreVersion: 0.1.0 }
capabilities: { resourceTypes: [postgres] }
workflows:
  - { name: b, file: b.yaml, category: provisioner }
"#,
        );

        assert!(registry.register_all(vec![a, conflicting]).is_err());
        assert!(registry.list().is_empty());
        assert!(!registry.has_resource_type("postgres"));
    }
}
