//! `dbos_core`: a library for writing reliable distributed programs whose
//! workflows survive process crashes, network partitions, and restarts.
//!
//! Workflows are plain async functions that take a [`workflow::WorkflowContext`]
//! and call back into it for every durable step. Each step is keyed by
//! `(workflow_uuid, function_id)`; the engine persists the step's recorded
//! result before the workflow observes it, so re-running the same workflow
//! body from the top after a crash reproduces every already-completed step
//! from the store instead of re-executing it — Once-And-Only-Once (OAOO)
//! semantics for the whole program, not just its individual calls.
//!
//! ```text
//! ┌─────────────────────────┐
//! workflow() ───────▶│ Executor │
//! transaction() ────▶│ registry · buffer · │
//! external() ───────▶│ notification dispatcher │
//! └───────────┬───────────────┘
//! │
//! ┌────────────┴────────────┐
//! │ │
//! ┌────────▼────────┐ ┌─────────▼────────┐
//! │ WorkflowContext │ │ SystemDatabase │
//! │ (per-invoke) │──────▶│ (dbos.* schema) │
//! └────────┬────────┘ └───────────────────┘
//! │
//! ┌────────▼────────┐
//! │ UserDatabase │ (application's own tables,
//! │ Adapter (UDB) │ co-committed per Transaction step)
//! └──────────────────┘
//! ```
//!
//! See `SPEC_FULL.md` for the entity model, execution semantics, and
//! configuration surface this crate implements.

pub mod admin;
pub mod communicator;
pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod reliability;
pub mod udb;
pub mod workflow;

/// Common imports for applications built on this crate.
pub mod prelude {
    pub use crate::communicator::CommunicatorOptions;
    pub use crate::config::{DatabaseConfig, DbosConfig, ExecutorConfig, RuntimeConfig, TelemetryConfig};
    pub use crate::engine::{Executor, ExecutorError, OperationConfig, OperationKind};
    pub use crate::error::DbosError;
    pub use crate::persistence::{Identity, SystemDatabase, WorkflowFilter, WorkflowStatusValue};
    pub use crate::reliability::RetryPolicy;
    pub use crate::udb::{TransactionConfig, UserDatabaseAdapter};
    pub use crate::workflow::{StepDriver, WorkflowContext, WorkflowHandle, WorkflowStatus};
}

pub use config::{DatabaseConfig, DbosConfig, ExecutorConfig, RuntimeConfig, TelemetryConfig};
pub use engine::{Executor, ExecutorError};
pub use error::DbosError;
pub use persistence::{Identity, SystemDatabase, WorkflowFilter, WorkflowStatusValue};
pub use reliability::RetryPolicy;
pub use workflow::{StepDriver, WorkflowContext, WorkflowHandle, WorkflowStatus};
