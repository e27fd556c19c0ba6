//! PostgreSQL store configuration.

use std::time::Duration;

use apimigrate_migrate::{StoreConfig, TableNames};

use crate::error::{PgError, PgResult};

/// PostgreSQL store configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Host.
    pub host: String,
    /// Port (default: 5432).
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Application name (shown in pg_stat_activity).
    pub application_name: String,
    /// Pool size.
    pub max_connections: usize,
    /// Table names.
    pub tables: TableNames,
}

impl PgConfig {
    /// Parse a `postgres://` or `postgresql://` URL.
    ///
    /// Recognised query parameters: `sslmode` (`disable` or `prefer`;
    /// connections are never encrypted), `connect_timeout` (seconds),
    /// `application_name` and `pool_size`.
    pub fn from_url(url: &str) -> PgResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PgError::config(format!("invalid database URL: {}", e)))?;

        if parsed.scheme() != "postgresql" && parsed.scheme() != "postgres" {
            return Err(PgError::config(format!(
                "invalid scheme: expected 'postgresql' or 'postgres', got '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| PgError::config("missing host in URL"))?
            .to_string();
        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(PgError::config("missing database name in URL"));
        }
        let user = if parsed.username().is_empty() {
            "postgres".to_string()
        } else {
            parsed.username().to_string()
        };

        let mut config = Self {
            host,
            port: parsed.port().unwrap_or(5432),
            database,
            user,
            password: parsed.password().map(String::from),
            connect_timeout: Duration::from_secs(30),
            application_name: "apimigrate".to_string(),
            max_connections: 4,
            tables: TableNames::default(),
        };

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "sslmode" => match value.as_ref() {
                    "disable" | "prefer" => {}
                    other => {
                        return Err(PgError::config(format!("unsupported sslmode: {}", other)));
                    }
                },
                "connect_timeout" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| PgError::config("invalid connect_timeout"))?;
                    config.connect_timeout = Duration::from_secs(secs);
                }
                "application_name" => config.application_name = value.into_owned(),
                "pool_size" => {
                    config.max_connections = value
                        .parse()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| PgError::config("invalid pool_size"))?;
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Build from a stage's `store` section.
    pub fn from_store_config(config: &StoreConfig) -> PgResult<Self> {
        let dsn = config
            .dsn
            .as_deref()
            .ok_or_else(|| PgError::config("postgres store requires 'dsn'"))?;
        let tables = config
            .table_names()
            .map_err(|e| PgError::config(e.to_string()))?;
        Ok(Self::from_url(dsn)?.tables(tables))
    }

    /// Set the table names.
    pub fn tables(mut self, tables: TableNames) -> Self {
        self.tables = tables;
        self
    }

    /// Set the pool size.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Convert to tokio-postgres config.
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.dbname(&self.database);
        config.user(&self.user);
        if let Some(ref password) = self.password {
            config.password(password);
        }
        config.application_name(&self.application_name);
        config.connect_timeout(self.connect_timeout);
        config
    }
}
