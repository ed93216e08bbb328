// Core orchestration abstractions for Scoreflow
//
// This crate holds the runtime types every other crate builds on:
// - the typed event model and the in-process event bus
// - the provider manifest model (with legacy schema migration)
// - the workflow definition model
// - the resource lifecycle state machine
// - the Score spec model
//
// It deliberately has no dependency on the storage layer.

pub mod bus;
pub mod error;
pub mod event;
pub mod provider;
pub mod resource;
pub mod spec;
pub mod workflow;

pub use bus::{EventBus, SubscriptionFilter};
pub use error::{CoreError, Result};
pub use event::{Event, EventType};
pub use provider::{
    Capabilities, Compatibility, Operation, ProviderCategory, ProviderManifest, ProviderMetadata,
    ResourceTypeCapability, WorkflowMetadata,
};
pub use resource::{HealthStatus, ResourceInstance, ResourceState};
pub use spec::{ResourceSpec, ScoreSpec};
pub use workflow::{StepDefinition, StepStatus, WorkflowDefinition, WorkflowStatus};
