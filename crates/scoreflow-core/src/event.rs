// Typed lifecycle events
//
// Every observable state change in the core flows through an Event record.
// The type set is closed: the SSE wire protocol and subscription filters
// both key on it, so new types are a deliberate API change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Closed set of event types emitted by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "spec.created")]
    SpecCreated,
    #[serde(rename = "spec.validated")]
    SpecValidated,
    #[serde(rename = "resource.created")]
    ResourceCreated,
    #[serde(rename = "resource.requested")]
    ResourceRequested,
    #[serde(rename = "resource.provisioning")]
    ResourceProvisioning,
    #[serde(rename = "resource.active")]
    ResourceActive,
    #[serde(rename = "resource.failed")]
    ResourceFailed,
    #[serde(rename = "workflow.created")]
    WorkflowCreated,
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "step.progress")]
    StepProgress,
    #[serde(rename = "provider.resolved")]
    ProviderResolved,
    #[serde(rename = "deployment.started")]
    DeploymentStarted,
    #[serde(rename = "deployment.completed")]
    DeploymentCompleted,
    #[serde(rename = "deployment.failed")]
    DeploymentFailed,
}

impl EventType {
    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SpecCreated => "spec.created",
            EventType::SpecValidated => "spec.validated",
            EventType::ResourceCreated => "resource.created",
            EventType::ResourceRequested => "resource.requested",
            EventType::ResourceProvisioning => "resource.provisioning",
            EventType::ResourceActive => "resource.active",
            EventType::ResourceFailed => "resource.failed",
            EventType::WorkflowCreated => "workflow.created",
            EventType::WorkflowStarted => "workflow.started",
            EventType::WorkflowCompleted => "workflow.completed",
            EventType::WorkflowFailed => "workflow.failed",
            EventType::StepStarted => "step.started",
            EventType::StepCompleted => "step.completed",
            EventType::StepFailed => "step.failed",
            EventType::StepProgress => "step.progress",
            EventType::ProviderResolved => "provider.resolved",
            EventType::DeploymentStarted => "deployment.started",
            EventType::DeploymentCompleted => "deployment.completed",
            EventType::DeploymentFailed => "deployment.failed",
        }
    }

    /// All event types, in wire order
    pub const ALL: [EventType; 19] = [
        EventType::SpecCreated,
        EventType::SpecValidated,
        EventType::ResourceCreated,
        EventType::ResourceRequested,
        EventType::ResourceProvisioning,
        EventType::ResourceActive,
        EventType::ResourceFailed,
        EventType::WorkflowCreated,
        EventType::WorkflowStarted,
        EventType::WorkflowCompleted,
        EventType::WorkflowFailed,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::StepProgress,
        EventType::ProviderResolved,
        EventType::DeploymentStarted,
        EventType::DeploymentCompleted,
        EventType::DeploymentFailed,
    ];
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type: '{s}'"))
    }
}

/// A single lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub app_name: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Create an event with an empty data payload
    pub fn new(
        event_type: EventType,
        app_name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            app_name: app_name.into(),
            timestamp: Utc::now(),
            source: source.into(),
            data: Map::new(),
        }
    }

    /// Attach a data field
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Serialize to the JSON wire record
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_event_type_wire_names_round_trip() {
        for event_type in EventType::ALL {
            let parsed = EventType::from_str(event_type.as_str()).unwrap();
            assert_eq!(parsed, event_type);
        }
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        assert!(EventType::from_str("resource.exploded").is_err());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(EventType::ResourceActive, "demo", "test")
            .with_data("resource_id", 42)
            .with_data("resource_name", "db");

        let json = event.to_json();
        assert_eq!(json["type"], "resource.active");
        assert_eq!(json["app_name"], "demo");
        assert_eq!(json["data"]["resource_id"], 42);
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{
            "id": "0191b7ae-6a50-7000-8000-000000000000",
            "type": "workflow.started",
            "app_name": "demo",
            "timestamp": "2024-01-01T00:00:00Z",
            "source": "executor",
            "data": {"workflow_name": "provision-postgres"}
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, EventType::WorkflowStarted);
        assert_eq!(event.data["workflow_name"], "provision-postgres");
    }
}
