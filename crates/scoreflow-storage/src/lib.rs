// Durable state for Scoreflow
//
// The relational store is authoritative for resource instances, workflow
// executions and queue tasks. Three table groups, three owners:
// - resource_instances (+ transition history) -> resource repository
// - workflow_executions / workflow_step_executions -> workflow repository
// - queue_tasks -> async queue
// Graph tables record observational lineage and are never on the critical
// path.

pub mod backend;
pub mod memory;
pub mod models;
pub mod repositories;

pub use backend::StorageBackend;
pub use memory::InMemoryDatabase;
pub use models::*;
pub use repositories::Database;
