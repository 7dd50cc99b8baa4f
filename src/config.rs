//! Configuration block and the environment variables the core consumes.

use std::time::Duration;

/// Supported application-database client families. The core only ever
/// speaks to Postgres directly through `sqlx`; this enum documents the
/// adapter-selection contract external collaborators may implement against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppDbClient {
    #[default]
    Sqlx,
    NodePg,
    Knex,
    TypeOrm,
    Prisma,
}

/// `database.*` configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub user_database: String,
    /// SDB database name; defaults to `<user_database>_dbos_sys`.
    pub system_database: String,
    pub app_db_client: AppDbClient,
    pub ssl_ca: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(hostname: impl Into<String>, user_database: impl Into<String>) -> Self {
        let user_database = user_database.into();
        let system_database = format!("{user_database}_dbos_sys");
        Self {
            hostname: hostname.into(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            user_database,
            system_database,
            app_db_client: AppDbClient::default(),
            ssl_ca: None,
            max_connections: 20,
        }
    }

    /// Populate `username`/`password` from the environment, following the
    /// precedence the core consumes: `PGPASSWORD`, falling back to
    /// `DB_PASSWORD`.
    pub fn with_env_password(mut self) -> Self {
        if let Ok(password) = std::env::var("PGPASSWORD").or_else(|_| std::env::var("DB_PASSWORD")) {
            self.password = password;
        }
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_system_database(mut self, name: impl Into<String>) -> Self {
        self.system_database = name.into();
        self
    }

    pub fn with_ssl_ca(mut self, path: impl Into<String>) -> Self {
        self.ssl_ca = Some(path.into());
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn user_database_url(&self) -> String {
        self.database_url(&self.user_database)
    }

    pub fn system_database_url(&self) -> String {
        self.database_url(&self.system_database)
    }

    fn database_url(&self, database: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.hostname, self.port, database
        )
    }
}

/// `telemetry.*` configuration. Exporters are out-of-core; this struct
/// only carries enough to wire up `tracing-subscriber`/OpenTelemetry from
/// the host application.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub logs_enabled: bool,
    pub traces_enabled: bool,
    pub otlp_endpoint: Option<String>,
}

/// `runtimeConfig.*`; `port`/`entrypoints` are out-of-core concerns the
/// host application surfaces the core through, kept here only so a single
/// config struct maps onto the whole documented surface.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub port: Option<u16>,
    pub entrypoints: Vec<String>,
    pub admin_port: Option<u16>,
}

/// Executor-level tuning that isn't part of the documented config surface
/// but is needed by the engine itself (buffer intervals, recovery limits,
/// identity).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub executor_id: String,
    pub application_version: Option<String>,
    pub max_recovery_attempts: i64,
    pub status_buffer_flush_interval: Duration,
    pub recovery_poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_id: "local".to_string(),
            application_version: None,
            max_recovery_attempts: 50,
            status_buffer_flush_interval: Duration::from_secs(1),
            recovery_poll_interval: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Read `DBOS__VMID`/`DBOS__APPVERSION`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(vmid) = std::env::var("DBOS__VMID") {
            if !vmid.is_empty() {
                config.executor_id = vmid;
            }
        }
        if let Ok(version) = std::env::var("DBOS__APPVERSION") {
            if !version.is_empty() {
                config.application_version = Some(version);
            }
        }
        config
    }

    pub fn with_max_recovery_attempts(mut self, max: i64) -> Self {
        self.max_recovery_attempts = max;
        self
    }

    pub fn with_status_buffer_flush_interval(mut self, interval: Duration) -> Self {
        self.status_buffer_flush_interval = interval;
        self
    }
}

/// The complete configuration block, wrapping the sub-blocks above
/// plus `application.*`, an opaque application-defined config value.
#[derive(Debug, Clone)]
pub struct DbosConfig {
    pub database: DatabaseConfig,
    pub telemetry: TelemetryConfig,
    pub runtime: RuntimeConfig,
    pub executor: ExecutorConfig,
    pub application: serde_json::Value,
}

impl DbosConfig {
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            telemetry: TelemetryConfig::default(),
            runtime: RuntimeConfig::default(),
            executor: ExecutorConfig::from_env(),
            application: serde_json::Value::Null,
        }
    }

    /// Load a `.env` file if present, then build a config with `database`
    /// populated from `PGPASSWORD`/`DB_PASSWORD` and `executor` from
    /// `DBOS__VMID`/`DBOS__APPVERSION`.
    pub fn from_env(hostname: impl Into<String>, user_database: impl Into<String>) -> Self {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!(?path, "loaded .env file"),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => tracing::warn!(error = %e, "failed to parse .env file"),
        }
        Self::new(DatabaseConfig::new(hostname, user_database).with_env_password())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_database_defaults_from_user_database() {
        let db = DatabaseConfig::new("localhost", "app");
        assert_eq!(db.system_database, "app_dbos_sys");
    }

    #[test]
    fn executor_config_reads_env() {
        std::env::set_var("DBOS__VMID", "executor-7");
        std::env::set_var("DBOS__APPVERSION", "v3");
        let config = ExecutorConfig::from_env();
        assert_eq!(config.executor_id, "executor-7");
        assert_eq!(config.application_version.as_deref(), Some("v3"));
        std::env::remove_var("DBOS__VMID");
        std::env::remove_var("DBOS__APPVERSION");
    }
}
