//! Operation registry: associates each user function symbol with
//! its kind and configuration at program start.
//!
//! The source material identifies operations via language-level decorators;
//! the portable realization here is an explicit registration step — a
//! builder that records `{symbol, kind, name, class, config, roles}` — that
//! user code calls at init time. Identity comparison is by function symbol
//! (a `TypeId`-keyed string here, since Rust has no decorator equivalent).

use std::any::TypeId;
use std::collections::HashMap;

use crate::reliability::RetryPolicy;

/// The kind of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Workflow,
    Transaction,
    Communicator,
    Handler,
    Initializer,
    /// Optional alternative backend; no runner ships
    /// with this crate, so dispatch to this kind always fails until a
    /// caller registers one via [`super::executor::Executor::register_stored_procedure_runner`].
    StoredProcedure,
}

/// Per-operation configuration recorded at registration time.
#[derive(Debug, Clone, Default)]
pub struct OperationConfig {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: bool,
    pub retry_policy: Option<RetryPolicy>,
}

/// UDB transaction isolation level; default is SERIALIZABLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Serializable
    }
}

/// A single registered operation.
///
/// `symbol` is `None` for operations registered through
/// [`OperationRegistry::register_dynamic`] — used where the caller only has
/// a runtime name (the executor's workflow bodies are boxed closures with
/// no compile-time marker type to key a `TypeId` off of).
#[derive(Debug, Clone)]
pub struct OperationEntry {
    pub symbol: Option<TypeId>,
    pub name: String,
    pub class_name: Option<String>,
    pub config_name: Option<String>,
    pub kind: OperationKind,
    pub config: OperationConfig,
    pub required_roles: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("operation not registered: {0}")]
    Unknown(String),

    #[error("operation {0} is already registered")]
    AlreadyRegistered(String),
}

/// Registry of `{symbol, kind, name, class, config, roles}` tuples,
/// populated by an explicit registration step at process init rather than
/// by scanning decorators.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    by_symbol: HashMap<TypeId, OperationEntry>,
    by_name: HashMap<String, TypeId>,
    /// Entries registered by name alone, via [`Self::register_dynamic`].
    dynamic: HashMap<String, OperationEntry>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation identified by the Rust type `T` (its
    /// `TypeId` stands in for "function symbol").
    pub fn register<T: 'static>(
        &mut self,
        name: impl Into<String>,
        kind: OperationKind,
        config: OperationConfig,
    ) -> Result<(), RegistryError> {
        let symbol = TypeId::of::<T>();
        let name = name.into();
        if self.by_symbol.contains_key(&symbol) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.by_name.insert(name.clone(), symbol);
        self.by_symbol.insert(
            symbol,
            OperationEntry {
                symbol: Some(symbol),
                name,
                class_name: None,
                config_name: None,
                kind,
                config,
                required_roles: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn register_with_roles<T: 'static>(
        &mut self,
        name: impl Into<String>,
        kind: OperationKind,
        config: OperationConfig,
        required_roles: Vec<String>,
    ) -> Result<(), RegistryError> {
        self.register::<T>(name, kind, config)?;
        let symbol = TypeId::of::<T>();
        if let Some(entry) = self.by_symbol.get_mut(&symbol) {
            entry.required_roles = required_roles;
        }
        Ok(())
    }

    /// Register an operation identified only by its runtime name, with no
    /// compile-time marker type to key a `TypeId` off of. Used by
    /// [`super::executor::Executor::register`], whose workflow bodies are
    /// boxed async closures supplied at runtime. Re-registering the same
    /// name overwrites the prior entry, matching the executor's own
    /// body-map semantics (a second `register` call for the same name
    /// replaces it rather than erroring).
    pub fn register_dynamic(
        &mut self,
        name: impl Into<String>,
        kind: OperationKind,
        config: OperationConfig,
        required_roles: Vec<String>,
    ) {
        let name = name.into();
        self.dynamic.insert(
            name.clone(),
            OperationEntry {
                symbol: None,
                name,
                class_name: None,
                config_name: None,
                kind,
                config,
                required_roles,
            },
        );
    }

    pub fn lookup<T: 'static>(&self) -> Result<&OperationEntry, RegistryError> {
        let symbol = TypeId::of::<T>();
        self.by_symbol
        .get(&symbol)
        .ok_or_else(|| RegistryError::Unknown(std::any::type_name::<T>().to_string()))
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<&OperationEntry, RegistryError> {
        if let Some(entry) = self.dynamic.get(name) {
            return Ok(entry);
        }
        let symbol = self
        .by_name
        .get(name)
        .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        self.by_symbol
        .get(symbol)
        .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.by_symbol.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len() + self.dynamic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty() && self.dynamic.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IncrementAndInsert;
    struct SendEmail;

    #[test]
    fn registers_and_looks_up_by_type() {
        let mut registry = OperationRegistry::new();
        registry
        .register::<IncrementAndInsert>("incrementAndInsert", OperationKind::Transaction, OperationConfig::default())
        .unwrap();

        let entry = registry.lookup::<IncrementAndInsert>().unwrap();
        assert_eq!(entry.name, "incrementAndInsert");
        assert_eq!(entry.kind, OperationKind::Transaction);
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let registry = OperationRegistry::new();
        let err = registry.lookup::<SendEmail>().unwrap_err();
        assert!(matches!(err, RegistryError::Unknown(_)));
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = OperationRegistry::new();
        registry
        .register::<IncrementAndInsert>("a", OperationKind::Workflow, OperationConfig::default())
        .unwrap();
        let err = registry
        .register::<IncrementAndInsert>("a", OperationKind::Workflow, OperationConfig::default())
        .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(_)));
    }

    #[test]
    fn lookup_by_name_finds_registered_entry() {
        let mut registry = OperationRegistry::new();
        registry
        .register::<SendEmail>("sendEmail", OperationKind::Communicator, OperationConfig::default())
        .unwrap();
        assert_eq!(registry.lookup_by_name("sendEmail").unwrap().kind, OperationKind::Communicator);
        assert!(registry.lookup_by_name("missing").is_err());
    }
}
