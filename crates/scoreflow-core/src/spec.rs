// Score spec model
//
// The declarative description external callers submit. Only the parts the
// core acts on are modeled: application identity and the resources block.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::provider::Operation;

/// Spec metadata block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMetadata {
    pub name: String,
}

/// One requested resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Workflow override: bypass resolution and run this named workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Tags narrowing workflow selection during resolution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

/// A parsed Score spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSpec {
    pub api_version: String,
    pub metadata: ScoreMetadata,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceSpec>,
}

impl ScoreSpec {
    /// Parse and validate a spec from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: ScoreSpec = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("spec parse error: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural validation
    pub fn validate(&self) -> Result<()> {
        if self.api_version.trim().is_empty() {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "spec missing apiVersion"
            )));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "spec missing metadata.name"
            )));
        }
        for (name, resource) in &self.resources {
            if resource.resource_type.trim().is_empty() {
                return Err(CoreError::Internal(anyhow::anyhow!(
                    "resource '{name}' has no type"
                )));
            }
        }
        Ok(())
    }

    pub fn app_name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
containers:
  web:
    image: nginx:1.27
resources:
  db:
    type: postgres
    params:
      version: "16"
    tags: [ha]
  cache:
    type: redis
"#;

    #[test]
    fn test_parse_spec() {
        let spec = ScoreSpec::from_yaml(SPEC).unwrap();
        assert_eq!(spec.app_name(), "demo");
        assert_eq!(spec.resources.len(), 2);
        assert_eq!(spec.resources["db"].resource_type, "postgres");
        assert_eq!(spec.resources["db"].tags, vec!["ha"]);
        assert_eq!(spec.resources["db"].params["version"], "16");
    }

    #[test]
    fn test_rejects_missing_name() {
        let bad = r#"
apiVersion: score.dev/v1b1
metadata:
  name: ""
"#;
        assert!(ScoreSpec::from_yaml(bad).is_err());
    }

    #[test]
    fn test_rejects_untyped_resource() {
        let bad = r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
resources:
  db:
    type: ""
"#;
        assert!(ScoreSpec::from_yaml(bad).is_err());
    }
}
