//! Versioned store abstraction.
//!
//! A store keeps three logical tables:
//!
//! - applied versions (`schema_migrations`)
//! - an append-only run history (`migration_runs`)
//! - per-version extracted variables (`stored_env`)
//!
//! Backends implement [`MigrationStore`]. The engine only ever writes through
//! [`MigrationStore::commit_up`], [`MigrationStore::commit_down`] and
//! [`MigrationStore::record_run`], so a backend that overrides the two commit
//! methods with a single transaction guarantees a version is never applied
//! without its run being recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{MigrateResult, MigrationError};

/// Migration version encoded in a filename prefix.
pub type Version = i64;

/// Variables extracted by a run.
pub type EnvMap = BTreeMap<String, String>;

/// Direction of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Forward.
    Up,
    /// Rollback.
    Down,
}

impl Direction {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    /// Parse the stored representation.
    pub fn parse(s: &str) -> MigrateResult<Self> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(MigrationError::store(format!("unknown run direction '{other}'"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A run about to be appended to the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    /// Version executed.
    pub version: Version,
    /// Direction.
    pub direction: Direction,
    /// HTTP status, when a response was received.
    pub status_code: Option<u16>,
    /// Response body, when body saving is enabled.
    pub body: Option<String>,
    /// Extracted variables.
    pub env: Option<EnvMap>,
    /// Whether the run failed.
    pub failed: bool,
}

impl NewRun {
    /// A run with no response details yet.
    pub fn new(version: Version, direction: Direction) -> Self {
        Self {
            version,
            direction,
            status_code: None,
            body: None,
            env: None,
            failed: false,
        }
    }
}

/// A row of the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Row id, increasing in insertion order.
    pub id: i64,
    /// Version executed.
    pub version: Version,
    /// Direction.
    pub direction: Direction,
    /// HTTP status, if a response was received.
    pub status_code: Option<u16>,
    /// Whether the run failed.
    pub failed: bool,
    /// When the run was recorded.
    pub ran_at: DateTime<Utc>,
    /// Saved response body.
    pub body: Option<String>,
    /// Extracted variables.
    pub env: Option<EnvMap>,
}

/// Physical table names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNames {
    /// Applied versions.
    pub migrations: String,
    /// Run history.
    pub runs: String,
    /// Per-version variables.
    pub stored_env: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            migrations: "schema_migrations".to_string(),
            runs: "migration_runs".to_string(),
            stored_env: "stored_env".to_string(),
        }
    }
}

impl TableNames {
    /// Default names with a prefix applied.
    pub fn with_prefix(prefix: &str) -> MigrateResult<Self> {
        let defaults = Self::default();
        let names = Self {
            migrations: format!("{prefix}{}", defaults.migrations),
            runs: format!("{prefix}{}", defaults.runs),
            stored_env: format!("{prefix}{}", defaults.stored_env),
        };
        names.validate()?;
        Ok(names)
    }

    /// Check every name is a plain SQL identifier and the names are distinct.
    pub fn validate(&self) -> MigrateResult<()> {
        for name in [&self.migrations, &self.runs, &self.stored_env] {
            validate_identifier(name)?;
        }
        let distinct: BTreeSet<_> = [&self.migrations, &self.runs, &self.stored_env]
            .into_iter()
            .collect();
        if distinct.len() != 3 {
            return Err(MigrationError::config("store table names must be distinct"));
        }
        Ok(())
    }
}

/// Validate a table name as `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> MigrateResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(MigrationError::config(format!("invalid table name '{name}'")))
    }
}

/// Persistence for applied versions, run history and stored variables.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Create tables if needed.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Highest currently applied version, or 0.
    async fn current_version(&self) -> MigrateResult<Version> {
        Ok(self.list_applied().await?.last().copied().unwrap_or(0))
    }

    /// Applied versions in ascending order.
    async fn list_applied(&self) -> MigrateResult<Vec<Version>>;

    /// Mark a version applied.
    async fn apply(&self, version: Version) -> MigrateResult<()>;

    /// Mark a version not applied.
    async fn remove(&self, version: Version) -> MigrateResult<()>;

    /// Append a run to the history, returning its id.
    async fn record_run(&self, run: &NewRun) -> MigrateResult<i64>;

    /// The whole run history in insertion order.
    async fn list_runs(&self) -> MigrateResult<Vec<RunRecord>>;

    /// Replace the stored variables of a version.
    async fn insert_stored_env(&self, version: Version, env: &EnvMap) -> MigrateResult<()>;

    /// Stored variables of a version, if any row exists.
    async fn load_stored_env(&self, version: Version) -> MigrateResult<Option<EnvMap>>;

    /// Delete the stored variables of a version.
    async fn delete_stored_env(&self, version: Version) -> MigrateResult<()>;

    /// Env snapshot of the most recent successful `up` run of a version.
    async fn latest_run_env(&self, version: Version) -> MigrateResult<Option<EnvMap>> {
        Ok(self
            .list_runs()
            .await?
            .into_iter()
            .rev()
            .find(|r| r.version == version && r.direction == Direction::Up && !r.failed)
            .and_then(|r| r.env))
    }

    /// Record a successful `up`, store its variables and mark it applied.
    async fn commit_up(&self, run: &NewRun, env: &EnvMap) -> MigrateResult<()> {
        self.record_run(run).await?;
        self.insert_stored_env(run.version, env).await?;
        self.apply(run.version).await
    }

    /// Record a successful `down`, drop its variables and mark it unapplied.
    async fn commit_down(&self, run: &NewRun) -> MigrateResult<()> {
        self.record_run(run).await?;
        self.delete_stored_env(run.version).await?;
        self.remove(run.version).await
    }

    /// Union of stored variables over all applied versions, oldest first,
    /// earlier versions winning on key collisions.
    async fn applied_env(&self) -> MigrateResult<EnvMap> {
        let mut merged = EnvMap::new();
        for version in self.list_applied().await? {
            if let Some(env) = self.load_stored_env(version).await? {
                for (k, v) in env {
                    merged.entry(k).or_insert(v);
                }
            }
        }
        Ok(merged)
    }

    /// Release resources.
    async fn close(&self) -> MigrateResult<()> {
        Ok(())
    }
}

/// Opens stores from configuration.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Open (and initialize) the store described by `config`. Relative paths
    /// are resolved against `base_dir`.
    async fn open(
        &self,
        config: &StoreConfig,
        base_dir: &Path,
    ) -> MigrateResult<Arc<dyn MigrationStore>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    applied: BTreeSet<Version>,
    runs: Vec<RunRecord>,
    stored_env: BTreeMap<Version, EnvMap>,
}

/// Process-local store, used for dry runs and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn list_applied(&self) -> MigrateResult<Vec<Version>> {
        Ok(self.state.lock().applied.iter().copied().collect())
    }

    async fn apply(&self, version: Version) -> MigrateResult<()> {
        self.state.lock().applied.insert(version);
        Ok(())
    }

    async fn remove(&self, version: Version) -> MigrateResult<()> {
        self.state.lock().applied.remove(&version);
        Ok(())
    }

    async fn record_run(&self, run: &NewRun) -> MigrateResult<i64> {
        let mut state = self.state.lock();
        let id = state.runs.len() as i64 + 1;
        state.runs.push(RunRecord {
            id,
            version: run.version,
            direction: run.direction,
            status_code: run.status_code,
            failed: run.failed,
            ran_at: Utc::now(),
            body: run.body.clone(),
            env: run.env.clone(),
        });
        Ok(id)
    }

    async fn list_runs(&self) -> MigrateResult<Vec<RunRecord>> {
        Ok(self.state.lock().runs.clone())
    }

    async fn insert_stored_env(&self, version: Version, env: &EnvMap) -> MigrateResult<()> {
        self.state.lock().stored_env.insert(version, env.clone());
        Ok(())
    }

    async fn load_stored_env(&self, version: Version) -> MigrateResult<Option<EnvMap>> {
        Ok(self.state.lock().stored_env.get(&version).cloned())
    }

    async fn delete_stored_env(&self, version: Version) -> MigrateResult<()> {
        self.state.lock().stored_env.remove(&version);
        Ok(())
    }

    async fn commit_up(&self, run: &NewRun, env: &EnvMap) -> MigrateResult<()> {
        self.record_run(run).await?;
        let mut state = self.state.lock();
        state.stored_env.insert(run.version, env.clone());
        state.applied.insert(run.version);
        Ok(())
    }

    async fn commit_down(&self, run: &NewRun) -> MigrateResult<()> {
        self.record_run(run).await?;
        let mut state = self.state.lock();
        state.stored_env.remove(&run.version);
        state.applied.remove(&run.version);
        Ok(())
    }
}
