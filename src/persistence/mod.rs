//! The System Database (SDB): durable state for workflow status, recorded
//! step outputs, inter-workflow notifications, and workflow events.

pub mod entities;
pub mod memory;
pub mod postgres;
pub mod schema;
pub mod store;

pub use entities::{
    Identity, NotificationRow, OperationOutputRow, WorkflowEventRow, WorkflowFilter,
    WorkflowInputsRow, WorkflowStatusRow, WorkflowStatusValue, NULL_TOPIC,
};
pub use memory::InMemorySystemDatabase;
pub use postgres::PostgresSystemDatabase;
pub use store::{CheckedWorkflowOutput, StoreError, SystemDatabase, WorkflowStatusSnapshot};
