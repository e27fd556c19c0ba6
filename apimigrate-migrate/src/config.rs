//! Per-stage configuration (`config.yaml`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::store::TableNames;

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default migrations directory, relative to the config file.
pub const DEFAULT_MIGRATE_DIR: &str = "migrations";

/// Default SQLite database file, relative to the config file.
pub const DEFAULT_SQLITE_PATH: &str = "apimigrate.db";

/// Default pause between migrations.
pub const DEFAULT_MIGRATION_DELAY_MS: u64 = 1000;

/// Configuration for one migration directory and its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Migrations directory
    pub migrate_dir: PathBuf,

    /// Pause between successful migrations, in milliseconds
    pub migration_delay_ms: u64,

    /// Named auth providers
    pub auth: Vec<AuthConfig>,

    /// Global variables
    pub env: Vec<EnvVarConfig>,

    /// Backing store
    pub store: StoreConfig,

    /// Health check run before migrating
    pub wait: Option<WaitConfig>,

    /// HTTP client options
    pub client: ClientConfig,

    /// Logging options
    pub logging: LoggingConfig,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            migrate_dir: PathBuf::from(DEFAULT_MIGRATE_DIR),
            migration_delay_ms: DEFAULT_MIGRATION_DELAY_MS,
            auth: Vec::new(),
            env: Vec::new(),
            store: StoreConfig::default(),
            wait: None,
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl ProjectConfig {
    /// Parse configuration text. Relative paths resolve against `base_dir`.
    pub fn from_yaml(content: &str, base_dir: impl Into<PathBuf>) -> MigrateResult<Self> {
        let mut config: ProjectConfig = serde_yaml::from_str(content)?;
        config.base_dir = base_dir.into();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&content, base_dir)
            .map_err(|e| MigrationError::config(format!("{}: {}", path.display(), e)))
    }

    /// Absolute (or base-relative) migrations directory.
    pub fn migrations_path(&self) -> PathBuf {
        resolve(&self.base_dir, &self.migrate_dir)
    }

    /// Inter-migration delay.
    pub fn migration_delay(&self) -> Duration {
        Duration::from_millis(self.migration_delay_ms)
    }

    /// Check structural constraints.
    pub fn validate(&self) -> MigrateResult<()> {
        let mut names = BTreeSet::new();
        for auth in &self.auth {
            if auth.kind.trim().is_empty() {
                return Err(MigrationError::config("auth entry is missing 'type'"));
            }
            if auth.name.trim().is_empty() {
                return Err(MigrationError::config(format!(
                    "auth entry of type '{}' is missing 'name'",
                    auth.kind
                )));
            }
            if !names.insert(auth.name.to_lowercase()) {
                return Err(MigrationError::config(format!(
                    "auth name '{}' is declared more than once",
                    auth.name
                )));
            }
        }

        for var in &self.env {
            if var.name.trim().is_empty() {
                return Err(MigrationError::config("env entry is missing 'name'"));
            }
            if var.value.is_some() == var.value_from_env.is_some() {
                return Err(MigrationError::config(format!(
                    "env '{}' must set exactly one of 'value' or 'valueFromEnv'",
                    var.name
                )));
            }
        }

        self.store.table_names()?;
        if self.store.driver == StoreDriver::Postgres && self.store.dsn.is_none() {
            return Err(MigrationError::config("postgres store requires 'dsn'"));
        }
        Ok(())
    }

    /// Resolve `env[]` into the global variable layer.
    pub fn global_env(&self) -> MigrateResult<BTreeMap<String, String>> {
        self.env
            .iter()
            .map(|var| Ok((var.name.clone(), var.resolve()?)))
            .collect()
    }
}

/// A named auth provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registry key
    #[serde(rename = "type")]
    pub kind: String,

    /// Name used by `request.auth` and `{{.auth.NAME}}`
    pub name: String,

    /// Provider-specific settings; string fields are rendered first
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A global variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarConfig {
    /// Variable name
    pub name: String,

    /// Literal value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Process environment variable to read
    #[serde(default, rename = "valueFromEnv", skip_serializing_if = "Option::is_none")]
    pub value_from_env: Option<String>,
}

impl EnvVarConfig {
    /// The effective value.
    pub fn resolve(&self) -> MigrateResult<String> {
        match (&self.value, &self.value_from_env) {
            (Some(value), None) => Ok(value.clone()),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                MigrationError::config(format!(
                    "env '{}': environment variable '{}' is not set",
                    self.name, var
                ))
            }),
            _ => Err(MigrationError::config(format!(
                "env '{}' must set exactly one of 'value' or 'valueFromEnv'",
                self.name
            ))),
        }
    }
}

/// Store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    /// Embedded single-file store
    #[default]
    #[serde(alias = "sqlite3", alias = "embedded", alias = "embedded-file")]
    Sqlite,
    /// Networked relational store
    #[serde(alias = "postgresql", alias = "pg", alias = "networked-relational")]
    Postgres,
}

/// Backing store settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend
    pub driver: StoreDriver,

    /// SQLite file (`:memory:` allowed)
    pub path: Option<PathBuf>,

    /// Postgres connection URL
    pub dsn: Option<String>,

    /// Keep response bodies in the run history
    pub save_response_body: bool,

    /// Prefix applied to the default table names
    pub table_prefix: Option<String>,

    /// Explicit table names, taking precedence over the prefix
    pub tables: TableOverrides,
}

/// Per-table name overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableOverrides {
    /// Applied versions table
    pub migrations: Option<String>,
    /// Run history table
    pub runs: Option<String>,
    /// Stored variables table
    pub stored_env: Option<String>,
}

impl StoreConfig {
    /// Effective, validated table names.
    pub fn table_names(&self) -> MigrateResult<TableNames> {
        let mut names = TableNames::with_prefix(self.table_prefix.as_deref().unwrap_or(""))?;
        if let Some(name) = &self.tables.migrations {
            names.migrations = name.clone();
        }
        if let Some(name) = &self.tables.runs {
            names.runs = name.clone();
        }
        if let Some(name) = &self.tables.stored_env {
            names.stored_env = name.clone();
        }
        names.validate()?;
        Ok(names)
    }

    /// SQLite file location, resolved against `base_dir`.
    pub fn sqlite_path(&self, base_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.as_os_str() == ":memory:" => path.clone(),
            Some(path) => resolve(base_dir, path),
            None => base_dir.join(DEFAULT_SQLITE_PATH),
        }
    }
}

/// Health check polled before a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// URL to poll (templated)
    pub url: String,

    /// HTTP method
    #[serde(default = "default_wait_method")]
    pub method: String,

    /// Status that means ready
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Give up after this long
    #[serde(default = "default_wait_timeout", with = "duration_format")]
    pub timeout: Duration,

    /// Pause between polls
    #[serde(default = "default_wait_interval", with = "duration_format")]
    pub interval: Duration,
}

fn default_wait_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_wait_interval() -> Duration {
    Duration::from_secs(2)
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2
    #[serde(rename = "1.2", alias = "TLS1.2", alias = "tls1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "1.3", alias = "TLS1.3", alias = "tls1.3")]
    Tls13,
}

/// HTTP client settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Skip certificate verification
    pub insecure: bool,

    /// Lowest accepted TLS version
    pub min_tls_version: Option<TlsVersion>,

    /// Highest accepted TLS version
    pub max_tls_version: Option<TlsVersion>,

    /// Per-request timeout
    #[serde(with = "duration_format::option")]
    pub timeout: Option<Duration>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// JSON lines
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive or level
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Redact credentials in logged headers
    pub mask_sensitive: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            mask_sensitive: true,
        }
    }
}

/// Join `path` onto `base` unless it is absolute.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h` or bare seconds.
pub fn parse_duration(input: &str) -> MigrateResult<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| MigrationError::config(format!("invalid duration '{input}'")))?;

    let scaled = |factor: u64| {
        amount
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| MigrationError::config(format!("duration out of range '{input}'")))
    };
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(amount),
        "ms" => Duration::from_millis(amount),
        "m" => scaled(60)?,
        "h" => scaled(3600)?,
        other => {
            return Err(MigrationError::config(format!(
                "invalid duration unit '{other}' in '{input}'"
            )));
        }
    };
    Ok(duration)
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else {
        format!("{}s", duration.as_secs())
    }
}

/// Serde adapter for human-readable durations.
pub mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    fn convert(raw: Raw) -> Result<Duration, String> {
        match raw {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(|e| e.to_string()),
        }
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        convert(Raw::deserialize(deserializer)?).map_err(serde::de::Error::custom)
    }

    /// Optional variant.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<super::Raw>::deserialize(deserializer)?
                .map(super::convert)
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}
