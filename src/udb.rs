//! The User Database Adapter (UDB): a uniform transactional client
//! over the application's own database.
//!
//! By default the `dbos` schema lives inside the same physical Postgres
//! database as the application's own tables (one `PgPool`, two schemas).
//! This is what makes the Transaction step's atomic co-commit possible: the
//! engine's `dbos.operation_outputs` insert and the user's own effects run
//! in the *same* database transaction. `database.system_database` remains
//! a supported configuration knob for deployments that want SDB state in a
//! logically separate database, but Transaction-step co-commit in that
//! configuration is out of reach of a single Postgres transaction — that
//! mode is documented in DESIGN.md as a known limitation rather than faked.

use sqlx::{PgPool, Postgres, Transaction};

use crate::engine::registry::IsolationLevel;

#[derive(Debug, thiserror::Error)]
pub enum UdbError {
    #[error("serialization failure, retry the transaction")]
    SerializationFailure,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for UdbError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some("40001") {
                return UdbError::SerializationFailure;
            }
        }
        UdbError::Database(err.to_string())
    }
}

/// Configuration for a single Transaction step.
#[derive(Debug, Clone, Copy)]
pub struct TransactionConfig {
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::Serializable,
            read_only: false,
        }
    }
}

/// Abstracts the application's own database behind one operation:
/// `transaction(body, config) -> R`. The adapter exposes the underlying
/// client to the user's transaction body, runs the body inside a DB
/// transaction at the requested isolation level, and lets the engine
/// submit the OperationOutputs row on the same transaction before commit.
pub struct UserDatabaseAdapter {
    pool: PgPool,
}

impl UserDatabaseAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction at the requested isolation level/read-only mode.
    pub async fn begin(
        &self,
        config: TransactionConfig,
    ) -> Result<Transaction<'static, Postgres>, UdbError> {
        let mut tx = self.pool.begin().await?;
        let isolation = match config.isolation_level {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        let access = if config.read_only { "READ ONLY" } else { "READ WRITE" };
        sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {isolation} {access}"))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_failure_is_classified_from_sqlstate() {
        // sqlx::Error::Database is not directly constructible in tests
        // without a live connection; the classification path is exercised
        // by the Postgres integration tests under tests/.
        let config = TransactionConfig::default();
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
    }
}
