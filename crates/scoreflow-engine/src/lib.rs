// Workflow execution engine
//
// The concurrent heart of Scoreflow:
// - step executor plug-ins dispatched by step type
// - the workflow executor (DAG execution, conditionals, retry-from-failed-step)
// - the persistent bounded task queue with its worker pool
// - the orchestration engine polling `requested` resources
// - Score spec intake (materializing resources + lifecycle events)

pub mod conditions;
pub mod engine;
pub mod executor;
pub mod intake;
pub mod queue;
pub mod steps;

pub use engine::{EngineConfig, OrchestrationEngine};
pub use executor::{ExecutionRequest, WorkflowExecutor};
pub use intake::materialize_spec;
pub use queue::{QueueConfig, QueueMetricsSnapshot, WorkflowQueue};
pub use steps::{StepContext, StepExecutor, StepOutput, StepRegistry};
