// Error types for the orchestration core

use thiserror::Error;

use crate::resource::ResourceState;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Provider manifest failed structural validation
    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    /// Referenced workflow file is unreadable or invalid
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Provider declares a core version range this build falls outside of
    #[error("provider '{name}' requires core version {range}, running {core_version}")]
    IncompatibleProvider {
        name: String,
        range: String,
        core_version: String,
    },

    /// Two providers primary-claim the same resource type
    #[error("provider capability conflict: {0}")]
    ProviderConflict(String),

    /// No provider claims the resource type
    #[error("no provider for resource type '{0}'")]
    NoProvider(String),

    /// The claiming provider has no workflow for the operation
    #[error("no workflow for resource type '{resource_type}' operation '{operation}'")]
    NoWorkflow {
        resource_type: String,
        operation: String,
    },

    /// Multiple workflows match with no tie-breaker
    #[error("ambiguous workflow for resource type '{resource_type}': candidates {candidates:?}")]
    AmbiguousWorkflow {
        resource_type: String,
        candidates: Vec<String>,
    },

    /// Disallowed resource state transition
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ResourceState,
        to: ResourceState,
    },

    /// Worker channel did not accept the task within the enqueue budget
    #[error("queue full: task channel send timed out")]
    QueueFull,

    /// No step executor registered for the step type
    #[error("unknown step type: '{0}'")]
    UnknownStepType(String),

    /// Step executor returned a failure
    #[error("step failed: {0}")]
    StepFailed(String),

    /// Resource instance not found
    #[error("resource not found: {0}")]
    ResourceNotFound(i64),

    /// Workflow execution not found
    #[error("workflow execution not found: {0}")]
    ExecutionNotFound(i64),

    /// Storage layer failure
    #[error("store error: {0}")]
    Store(String),

    /// Operation was cancelled by shutdown
    #[error("cancelled")]
    Cancelled,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Create an invalid-provider error
    pub fn invalid_provider(msg: impl Into<String>) -> Self {
        CoreError::InvalidProvider(msg.into())
    }

    /// Create an invalid-workflow error
    pub fn invalid_workflow(msg: impl Into<String>) -> Self {
        CoreError::InvalidWorkflow(msg.into())
    }

    /// Create a provider-conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::ProviderConflict(msg.into())
    }

    /// Create a no-provider error
    pub fn no_provider(resource_type: impl Into<String>) -> Self {
        CoreError::NoProvider(resource_type.into())
    }

    /// Create a no-workflow error
    pub fn no_workflow(resource_type: impl Into<String>, operation: impl Into<String>) -> Self {
        CoreError::NoWorkflow {
            resource_type: resource_type.into(),
            operation: operation.into(),
        }
    }

    /// Create a step-failed error
    pub fn step_failed(msg: impl Into<String>) -> Self {
        CoreError::StepFailed(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        CoreError::Store(msg.into())
    }

    /// True for errors the orchestration engine treats as transient
    /// (the resource stays `requested` and is retried on the next tick)
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::QueueFull | CoreError::Cancelled)
    }
}
