//! The execution engine: operation registry, notification dispatch,
//! buffered status writes, and the `Executor` that ties them together.

pub mod buffer;
pub mod executor;
pub mod notify;
pub mod registry;

pub use executor::{Executor, ExecutorError, StoredProcedureRunner, WorkflowBody};
pub use notify::NotificationDispatcher;
pub use registry::{IsolationLevel, OperationConfig, OperationEntry, OperationKind, OperationRegistry, RegistryError};
