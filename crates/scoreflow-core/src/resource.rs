// Resource lifecycle state machine
//
// The allowed-transition table is the authority for every state change a
// resource instance may take; repositories enforce it before writing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::provider::Operation;

/// Lifecycle state of a resource instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Requested,
    Provisioning,
    Active,
    Degraded,
    Updating,
    Scaling,
    Failed,
    Terminating,
    Terminated,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Requested => "requested",
            ResourceState::Provisioning => "provisioning",
            ResourceState::Active => "active",
            ResourceState::Degraded => "degraded",
            ResourceState::Updating => "updating",
            ResourceState::Scaling => "scaling",
            ResourceState::Failed => "failed",
            ResourceState::Terminating => "terminating",
            ResourceState::Terminated => "terminated",
        }
    }

    /// Whether `self -> to` appears in the allowed-transition table
    pub fn can_transition_to(&self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (Requested, Provisioning)
                | (Requested, Failed)
                | (Requested, Terminating)
                | (Provisioning, Active)
                | (Provisioning, Degraded)
                | (Provisioning, Failed)
                | (Provisioning, Terminating)
                | (Active, Degraded)
                | (Active, Updating)
                | (Active, Scaling)
                | (Active, Failed)
                | (Active, Terminating)
                | (Degraded, Active)
                | (Degraded, Updating)
                | (Degraded, Failed)
                | (Degraded, Terminating)
                | (Updating, Active)
                | (Updating, Degraded)
                | (Updating, Failed)
                | (Updating, Terminating)
                | (Scaling, Active)
                | (Scaling, Degraded)
                | (Scaling, Failed)
                | (Scaling, Terminating)
                | (Failed, Provisioning)
                | (Failed, Terminating)
                | (Terminating, Failed)
                | (Terminating, Terminated)
        )
    }

    /// Validate a transition, returning `InvalidTransition` when disallowed
    pub fn check_transition_to(&self, to: ResourceState) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition { from: *self, to })
        }
    }

    /// Terminated resources accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Terminated)
    }

    pub const ALL: [ResourceState; 9] = [
        ResourceState::Requested,
        ResourceState::Provisioning,
        ResourceState::Active,
        ResourceState::Degraded,
        ResourceState::Updating,
        ResourceState::Scaling,
        ResourceState::Failed,
        ResourceState::Terminating,
        ResourceState::Terminated,
    ];
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ResourceState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown resource state: '{s}'"))
    }
}

/// Observed health of a resource, orthogonal to lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "unknown" => Ok(HealthStatus::Unknown),
            other => Err(format!("unknown health status: '{other}'")),
        }
    }
}

/// A managed piece of infrastructure requested by an application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub id: i64,
    pub application_name: String,
    pub resource_name: String,
    pub resource_type: String,
    pub state: ResourceState,
    pub health_status: HealthStatus,
    pub provider_id: Option<String>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
    #[serde(default)]
    pub provider_metadata: Map<String, Value>,
    pub error_message: Option<String>,
    pub workflow_execution_id: Option<i64>,
    pub desired_operation: Option<Operation>,
    pub workflow_override: Option<String>,
    #[serde(default)]
    pub workflow_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_names_round_trip() {
        for state in ResourceState::ALL {
            assert_eq!(ResourceState::from_str(state.as_str()).unwrap(), state);
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use ResourceState::*;
        assert!(Requested.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Active));
        assert!(Active.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Active));
        assert!(Active.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
    }

    #[test]
    fn test_failed_recovery_path() {
        use ResourceState::*;
        // Operator retry re-provisions a failed resource
        assert!(Failed.can_transition_to(Provisioning));
        assert!(Failed.can_transition_to(Terminating));
        // But a failed resource is never directly re-requested
        assert!(!Failed.can_transition_to(Requested));
        assert!(!Failed.can_transition_to(Active));
    }

    #[test]
    fn test_terminated_is_terminal() {
        for to in ResourceState::ALL {
            assert!(!ResourceState::Terminated.can_transition_to(to));
        }
        assert!(ResourceState::Terminated.is_terminal());
    }

    #[test]
    fn test_no_state_reaches_requested() {
        // `requested` is an entry state only
        for from in ResourceState::ALL {
            assert!(!from.can_transition_to(ResourceState::Requested));
        }
    }

    #[test]
    fn test_check_transition_error() {
        let err = ResourceState::Active
            .check_transition_to(ResourceState::Provisioning)
            .unwrap_err();
        assert!(err.to_string().contains("active -> provisioning"));
    }
}
