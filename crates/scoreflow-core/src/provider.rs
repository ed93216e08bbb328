// Provider manifest model
//
// A provider is a versioned bundle declaring which resource types it can
// provision and which workflow files accomplish that. Manifests arrive as
// `provider.yaml` (legacy `platform.yaml` still accepted); the legacy
// top-level `provisioners`/`goldenpaths` lists are migrated into
// `workflows` on load.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Accepted manifest kinds
pub const KIND_PROVIDER: &str = "Provider";
/// Legacy manifest kind, still accepted
pub const KIND_PLATFORM: &str = "Platform";

/// Core versions that skip the compatibility check
const DEV_CORE_VERSIONS: [&str; 2] = ["dev", "unknown"];

/// Workflow category assigned to migrated legacy provisioners
pub const CATEGORY_PROVISIONER: &str = "provisioner";
/// Workflow category assigned to migrated legacy goldenpaths
pub const CATEGORY_GOLDENPATH: &str = "goldenpath";

/// Resource operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "read" => Ok(Operation::Read),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: '{other}'")),
        }
    }
}

/// Provider category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCategory {
    #[default]
    Infrastructure,
    Service,
}

/// Manifest metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: ProviderCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Core version compatibility range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compatibility {
    pub min_core_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_core_version: Option<String>,
}

/// Advanced capability declaration for a single resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTypeCapability {
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Synonym pointing at another primary type of the same provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_for: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
}

/// Capability block: simple and advanced forms may be mixed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_type_capabilities: Vec<ResourceTypeCapability>,
}

/// A workflow a provider ships
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub name: String,
    /// Path relative to the manifest's directory
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
}

impl WorkflowMetadata {
    /// Whether this workflow declares support for the operation
    /// (no declared operations means "any")
    pub fn supports_operation(&self, operation: Operation) -> bool {
        self.operations.is_empty() || self.operations.contains(&operation)
    }
}

/// Parsed provider manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ProviderMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<Compatibility>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub workflows: Vec<WorkflowMetadata>,
    /// Legacy list, migrated into `workflows` by `migrate_legacy`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provisioners: Vec<WorkflowMetadata>,
    /// Legacy list, migrated into `workflows` by `migrate_legacy`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goldenpaths: Vec<WorkflowMetadata>,
}

impl ProviderManifest {
    /// Parse a manifest from YAML (no migration or validation)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::invalid_provider(format!("manifest parse error: {e}")))
    }

    /// Serialize back to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| CoreError::invalid_provider(format!("manifest serialize error: {e}")))
    }

    /// Fold legacy `provisioners` and `goldenpaths` into `workflows`
    ///
    /// Migrated entries get the category of their source list unless the
    /// entry already declares one.
    pub fn migrate_legacy(&mut self) {
        for mut workflow in self.provisioners.drain(..) {
            if workflow.category.is_empty() {
                workflow.category = CATEGORY_PROVISIONER.to_string();
            }
            self.workflows.push(workflow);
        }
        for mut workflow in self.goldenpaths.drain(..) {
            workflow.category = CATEGORY_GOLDENPATH.to_string();
            self.workflows.push(workflow);
        }
    }

    /// Structural validation (run after `migrate_legacy`)
    pub fn validate(&self) -> Result<()> {
        if self.api_version.trim().is_empty() {
            return Err(CoreError::invalid_provider("missing apiVersion"));
        }
        if self.kind != KIND_PROVIDER && self.kind != KIND_PLATFORM {
            return Err(CoreError::invalid_provider(format!(
                "kind must be '{KIND_PROVIDER}' or '{KIND_PLATFORM}', got '{}'",
                self.kind
            )));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(CoreError::invalid_provider("missing metadata.name"));
        }
        if self.metadata.version.trim().is_empty() {
            return Err(CoreError::invalid_provider("missing metadata.version"));
        }
        semver::Version::parse(&self.metadata.version).map_err(|e| {
            CoreError::invalid_provider(format!(
                "metadata.version '{}' is not semver: {e}",
                self.metadata.version
            ))
        })?;

        let compatibility = self
            .compatibility
            .as_ref()
            .ok_or_else(|| CoreError::invalid_provider("missing compatibility block"))?;
        if compatibility.min_core_version.trim().is_empty() {
            return Err(CoreError::invalid_provider(
                "missing compatibility.minCoreVersion",
            ));
        }

        if self.workflows.is_empty() {
            return Err(CoreError::invalid_provider(
                "provider declares no workflows or provisioners",
            ));
        }
        for workflow in &self.workflows {
            if workflow.name.trim().is_empty() {
                return Err(CoreError::invalid_provider("workflow with empty name"));
            }
            if workflow.file.trim().is_empty() {
                return Err(CoreError::invalid_provider(format!(
                    "workflow '{}' has no file",
                    workflow.name
                )));
            }
        }

        // Alias targets must be primary types declared by this provider
        let primaries = self.primary_resource_types();
        for capability in &self.capabilities.resource_type_capabilities {
            if let Some(target) = &capability.alias_for {
                if !primaries.iter().any(|t| t == target) {
                    return Err(CoreError::invalid_provider(format!(
                        "alias '{}' points at undeclared type '{target}'",
                        capability.resource_type
                    )));
                }
            }
        }

        Ok(())
    }

    /// Check the core version against the declared compatibility range
    ///
    /// Skipped when the running core identifies as a development build.
    pub fn check_compatibility(&self, core_version: &str) -> Result<()> {
        if DEV_CORE_VERSIONS.contains(&core_version) {
            return Ok(());
        }
        let Some(compatibility) = &self.compatibility else {
            return Ok(());
        };

        let core = semver::Version::parse(core_version).map_err(|e| {
            CoreError::invalid_provider(format!("core version '{core_version}' is not semver: {e}"))
        })?;
        let min = semver::Version::parse(&compatibility.min_core_version).map_err(|e| {
            CoreError::invalid_provider(format!(
                "minCoreVersion '{}' is not semver: {e}",
                compatibility.min_core_version
            ))
        })?;

        let mut range = format!(">= {min}");
        let mut compatible = core >= min;
        if let Some(max_raw) = &compatibility.max_core_version {
            let max = semver::Version::parse(max_raw).map_err(|e| {
                CoreError::invalid_provider(format!("maxCoreVersion '{max_raw}' is not semver: {e}"))
            })?;
            range = format!(">= {min}, <= {max}");
            compatible = compatible && core <= max;
        }

        if compatible {
            Ok(())
        } else {
            Err(CoreError::IncompatibleProvider {
                name: self.metadata.name.clone(),
                range,
                core_version: core_version.to_string(),
            })
        }
    }

    /// Resource types this provider primary-claims (aliases excluded)
    pub fn primary_resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.capabilities.resource_types.clone();
        for capability in &self.capabilities.resource_type_capabilities {
            if capability.alias_for.is_none() && !types.contains(&capability.resource_type) {
                types.push(capability.resource_type.clone());
            }
        }
        types
    }

    /// Resolve a possibly-aliased type to its primary type, if this
    /// provider declares it at all
    pub fn canonical_resource_type(&self, resource_type: &str) -> Option<String> {
        for capability in &self.capabilities.resource_type_capabilities {
            if capability.resource_type == resource_type {
                return Some(
                    capability
                        .alias_for
                        .clone()
                        .unwrap_or_else(|| capability.resource_type.clone()),
                );
            }
        }
        if self.capabilities.resource_types.iter().any(|t| t == resource_type) {
            return Some(resource_type.to_string());
        }
        None
    }

    /// Declared operations for a resource type (empty = all)
    pub fn operations_for(&self, resource_type: &str) -> Vec<Operation> {
        self.capabilities
            .resource_type_capabilities
            .iter()
            .find(|c| c.resource_type == resource_type)
            .map(|c| c.operations.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata:
  name: database-team
  version: 1.2.0
  category: infrastructure
  description: Managed databases
compatibility:
  minCoreVersion: 0.2.0
  maxCoreVersion: 0.9.0
capabilities:
  resourceTypes:
    - postgres
  resourceTypeCapabilities:
    - type: postgresql
      aliasFor: postgres
    - type: redis
      operations: [create, delete]
workflows:
  - name: provision-postgres
    file: workflows/provision-postgres.yaml
    version: 1.0.0
    category: provisioner
    tags: [ha]
    operations: [create]
"#;

    const LEGACY_MANIFEST: &str = r#"
apiVersion: scoreflow.dev/v1
kind: Platform
metadata:
  name: legacy-team
  version: 0.1.0
compatibility:
  minCoreVersion: 0.1.0
capabilities:
  resourceTypes: [postgres]
provisioners:
  - name: provision-postgres
    file: workflows/provision.yaml
goldenpaths:
  - name: deploy-app
    file: workflows/deploy.yaml
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.metadata.name, "database-team");
        assert_eq!(manifest.capabilities.resource_types, vec!["postgres"]);
        assert_eq!(manifest.workflows.len(), 1);
        assert_eq!(manifest.workflows[0].tags, vec!["ha"]);
    }

    #[test]
    fn test_round_trip() {
        let mut manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();
        manifest.migrate_legacy();
        let yaml = manifest.to_yaml().unwrap();
        let reparsed = ProviderManifest::from_yaml(&yaml).unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn test_legacy_migration() {
        let mut manifest = ProviderManifest::from_yaml(LEGACY_MANIFEST).unwrap();
        manifest.migrate_legacy();

        assert!(manifest.provisioners.is_empty());
        assert!(manifest.goldenpaths.is_empty());
        assert_eq!(manifest.workflows.len(), 2);
        assert_eq!(manifest.workflows[0].category, CATEGORY_PROVISIONER);
        assert_eq!(manifest.workflows[1].category, CATEGORY_GOLDENPATH);
        manifest.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let mut manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();
        manifest.compatibility = None;
        assert!(matches!(
            manifest.validate(),
            Err(CoreError::InvalidProvider(_))
        ));

        let mut manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();
        manifest.kind = "Gadget".into();
        assert!(manifest.validate().is_err());

        let mut manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();
        manifest.workflows.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_dangling_alias() {
        let mut manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();
        manifest.capabilities.resource_type_capabilities[0].alias_for = Some("mysql".into());
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_compatibility_range() {
        let manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();

        manifest.check_compatibility("0.3.0").unwrap();
        assert!(matches!(
            manifest.check_compatibility("0.1.0"),
            Err(CoreError::IncompatibleProvider { .. })
        ));
        assert!(manifest.check_compatibility("1.0.0").is_err());
        // Development markers skip the check
        manifest.check_compatibility("dev").unwrap();
        manifest.check_compatibility("unknown").unwrap();
    }

    #[test]
    fn test_capability_lookups() {
        let manifest = ProviderManifest::from_yaml(MANIFEST).unwrap();

        let mut primaries = manifest.primary_resource_types();
        primaries.sort();
        assert_eq!(primaries, vec!["postgres", "redis"]);

        assert_eq!(
            manifest.canonical_resource_type("postgresql").as_deref(),
            Some("postgres")
        );
        assert_eq!(
            manifest.canonical_resource_type("postgres").as_deref(),
            Some("postgres")
        );
        assert_eq!(manifest.canonical_resource_type("mysql"), None);

        assert_eq!(
            manifest.operations_for("redis"),
            vec![Operation::Create, Operation::Delete]
        );
        assert!(manifest.operations_for("postgres").is_empty());
    }
}
