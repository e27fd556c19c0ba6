//! [`MigrationStore`] over a single SQLite file.

use std::sync::Arc;

use apimigrate_migrate::{
    Direction, EnvMap, MigrateResult, MigrationStore, NewRun, RunRecord, Version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use crate::config::{DatabasePath, SqliteConfig};
use crate::error::{SqliteError, SqliteResult};
use crate::schema::Statements;

/// A run row as stored, before decoding.
struct RawRun {
    id: i64,
    version: i64,
    direction: String,
    status_code: Option<i64>,
    failed: bool,
    ran_at: String,
    body: Option<String>,
    env_json: Option<String>,
}

impl RawRun {
    fn decode(self) -> SqliteResult<RunRecord> {
        let direction = Direction::parse(&self.direction)
            .map_err(|_| SqliteError::corrupt(format!("run {} has direction '{}'", self.id, self.direction)))?;
        let status_code = self
            .status_code
            .map(|code| {
                u16::try_from(code)
                    .map_err(|_| SqliteError::corrupt(format!("run {} has status {}", self.id, code)))
            })
            .transpose()?;
        let ran_at = DateTime::parse_from_rfc3339(&self.ran_at)
            .map_err(|e| SqliteError::corrupt(format!("run {} timestamp: {}", self.id, e)))?
            .with_timezone(&Utc);
        let env = self
            .env_json
            .as_deref()
            .map(serde_json::from_str::<EnvMap>)
            .transpose()?;
        Ok(RunRecord {
            id: self.id,
            version: self.version,
            direction,
            status_code,
            failed: self.failed,
            ran_at,
            body: self.body,
            env,
        })
    }
}

/// Embedded store backed by one SQLite database.
///
/// All statements run on the connection's worker thread. `commit_up` and
/// `commit_down` each run in a single transaction.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    sql: Arc<Statements>,
    path: DatabasePath,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path.display())
            .finish()
    }
}

impl SqliteStore {
    /// Open the database and create the tables.
    pub async fn open(config: SqliteConfig) -> SqliteResult<Self> {
        config
            .tables
            .validate()
            .map_err(|e| SqliteError::config(e.to_string()))?;

        let conn = match &config.path {
            DatabasePath::Memory => Connection::open_in_memory().await?,
            DatabasePath::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Connection::open(path).await?
            }
        };

        let sql = Arc::new(Statements::new(&config.tables));
        let init = format!("{}{}", config.init_sql(), sql.create);
        conn.call(move |conn| {
            conn.execute_batch(&init)?;
            Ok(())
        })
        .await?;

        info!(path = %config.path.display(), "SQLite store opened");
        Ok(Self {
            conn,
            sql,
            path: config.path,
        })
    }

    /// Open a fresh in-memory store.
    pub async fn memory() -> SqliteResult<Self> {
        Self::open(SqliteConfig::memory()).await
    }

    /// The database location.
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    async fn list_applied_inner(&self) -> SqliteResult<Vec<Version>> {
        let sql = Arc::clone(&self.sql);
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql.list_applied)?;
                let versions = stmt
                    .query_map([], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(versions)
            })
            .await?)
    }

    async fn execute(&self, statement: fn(&Statements) -> &str, version: Version) -> SqliteResult<()> {
        let sql = Arc::clone(&self.sql);
        self.conn
            .call(move |conn| {
                conn.execute(statement(&sql), params![version])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_runs_inner(&self) -> SqliteResult<Vec<RunRecord>> {
        let sql = Arc::clone(&self.sql);
        let raw = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&sql.list_runs)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(RawRun {
                            id: row.get(0)?,
                            version: row.get(1)?,
                            direction: row.get(2)?,
                            status_code: row.get(3)?,
                            failed: row.get(4)?,
                            ran_at: row.get(5)?,
                            body: row.get(6)?,
                            env_json: row.get(7)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        raw.into_iter().map(RawRun::decode).collect()
    }

    async fn load_env_inner(&self, version: Version) -> SqliteResult<Option<EnvMap>> {
        let sql = Arc::clone(&self.sql);
        let json = self
            .conn
            .call(move |conn| {
                let json = conn
                    .query_row(&sql.load_env, params![version], |row| row.get::<_, String>(0))
                    .optional()?;
                Ok(json)
            })
            .await?;
        Ok(json
            .as_deref()
            .map(serde_json::from_str::<EnvMap>)
            .transpose()?)
    }

    async fn insert_env_inner(&self, version: Version, env: &EnvMap) -> SqliteResult<()> {
        let sql = Arc::clone(&self.sql);
        let json = serde_json::to_string(env)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(&sql.upsert_env, params![version, json, now])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn record_run_inner(&self, run: &NewRun) -> SqliteResult<i64> {
        let sql = Arc::clone(&self.sql);
        let row = RunRow::encode(run)?;
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = row.insert(&tx, &sql)?;
                tx.commit()?;
                Ok(id)
            })
            .await?)
    }

    async fn commit_up_inner(&self, run: &NewRun, env: &EnvMap) -> SqliteResult<()> {
        let sql = Arc::clone(&self.sql);
        let row = RunRow::encode(run)?;
        let env_json = serde_json::to_string(env)?;
        let version = run.version;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                row.insert(&tx, &sql)?;
                tx.execute(&sql.upsert_env, params![version, env_json, row.ran_at])?;
                tx.execute(&sql.apply, params![version, row.ran_at])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(version, "Committed up");
        Ok(())
    }

    async fn commit_down_inner(&self, run: &NewRun) -> SqliteResult<()> {
        let sql = Arc::clone(&self.sql);
        let row = RunRow::encode(run)?;
        let version = run.version;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                row.insert(&tx, &sql)?;
                tx.execute(&sql.delete_env, params![version])?;
                tx.execute(&sql.remove, params![version])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(version, "Committed down");
        Ok(())
    }
}

/// A run encoded for insertion.
struct RunRow {
    version: i64,
    direction: &'static str,
    status_code: Option<i64>,
    failed: bool,
    ran_at: String,
    body: Option<String>,
    env_json: Option<String>,
}

impl RunRow {
    fn encode(run: &NewRun) -> SqliteResult<Self> {
        Ok(Self {
            version: run.version,
            direction: run.direction.as_str(),
            status_code: run.status_code.map(i64::from),
            failed: run.failed,
            ran_at: Utc::now().to_rfc3339(),
            body: run.body.clone(),
            env_json: run.env.as_ref().map(serde_json::to_string).transpose()?,
        })
    }

    fn insert(&self, tx: &Transaction<'_>, sql: &Statements) -> rusqlite::Result<i64> {
        tx.execute(
            &sql.insert_run,
            params![
                self.version,
                self.direction,
                self.status_code,
                self.failed,
                self.ran_at,
                self.body,
                self.env_json
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }
}

#[async_trait]
impl MigrationStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> MigrateResult<()> {
        let sql = Arc::clone(&self.sql);
        self.conn
            .call(move |conn| {
                conn.execute_batch(&sql.create)?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)?;
        Ok(())
    }

    async fn list_applied(&self) -> MigrateResult<Vec<Version>> {
        Ok(self.list_applied_inner().await?)
    }

    async fn apply(&self, version: Version) -> MigrateResult<()> {
        let sql = Arc::clone(&self.sql);
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(&sql.apply, params![version, now])?;
                Ok(())
            })
            .await
            .map_err(SqliteError::from)?;
        Ok(())
    }

    async fn remove(&self, version: Version) -> MigrateResult<()> {
        Ok(self.execute(|s| &s.remove, version).await?)
    }

    async fn record_run(&self, run: &NewRun) -> MigrateResult<i64> {
        Ok(self.record_run_inner(run).await?)
    }

    async fn list_runs(&self) -> MigrateResult<Vec<RunRecord>> {
        Ok(self.list_runs_inner().await?)
    }

    async fn insert_stored_env(&self, version: Version, env: &EnvMap) -> MigrateResult<()> {
        Ok(self.insert_env_inner(version, env).await?)
    }

    async fn load_stored_env(&self, version: Version) -> MigrateResult<Option<EnvMap>> {
        Ok(self.load_env_inner(version).await?)
    }

    async fn delete_stored_env(&self, version: Version) -> MigrateResult<()> {
        Ok(self.execute(|s| &s.delete_env, version).await?)
    }

    async fn commit_up(&self, run: &NewRun, env: &EnvMap) -> MigrateResult<()> {
        Ok(self.commit_up_inner(run, env).await?)
    }

    async fn commit_down(&self, run: &NewRun) -> MigrateResult<()> {
        Ok(self.commit_down_inner(run).await?)
    }
}

#[cfg(test)]
mod tests {
    use apimigrate_migrate::TableNames;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn up_run(version: Version, status: u16) -> NewRun {
        let mut run = NewRun::new(version, Direction::Up);
        run.status_code = Some(status);
        run
    }

    #[tokio::test]
    async fn test_commit_up_and_down() {
        let store = SqliteStore::memory().await.unwrap();

        let mut run = up_run(1, 201);
        run.env = Some(env(&[("id", "7")]));
        run.body = Some("{\"id\":7}".to_string());
        store.commit_up(&run, &env(&[("id", "7")])).await.unwrap();
        store.commit_up(&up_run(3, 200), &EnvMap::new()).await.unwrap();

        assert_eq!(store.list_applied().await.unwrap(), vec![1, 3]);
        assert_eq!(store.current_version().await.unwrap(), 3);
        assert_eq!(store.load_stored_env(1).await.unwrap(), Some(env(&[("id", "7")])));

        store
            .commit_down(&NewRun::new(3, Direction::Down))
            .await
            .unwrap();
        assert_eq!(store.current_version().await.unwrap(), 1);
        assert_eq!(store.load_stored_env(3).await.unwrap(), None);

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].status_code, Some(201));
        assert_eq!(runs[0].body.as_deref(), Some("{\"id\":7}"));
        assert_eq!(runs[0].env, Some(env(&[("id", "7")])));
        assert_eq!(runs[2].direction, Direction::Down);
        assert!(runs[0].id < runs[1].id && runs[1].id < runs[2].id);
    }

    #[tokio::test]
    async fn test_failed_run_is_history_only() {
        let store = SqliteStore::memory().await.unwrap();
        let mut run = up_run(1, 500);
        run.failed = true;
        store.record_run(&run).await.unwrap();

        assert!(store.list_applied().await.unwrap().is_empty());
        let runs = store.list_runs().await.unwrap();
        assert!(runs[0].failed);
        assert_eq!(store.latest_run_env(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = SqliteStore::memory().await.unwrap();
        store.apply(2).await.unwrap();
        store.apply(2).await.unwrap();
        assert_eq!(store.list_applied().await.unwrap(), vec![2]);
        store.remove(2).await.unwrap();
        assert_eq!(store.current_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stored_env_replace_and_applied_env() {
        let store = SqliteStore::memory().await.unwrap();
        store.insert_stored_env(1, &env(&[("a", "old")])).await.unwrap();
        store.insert_stored_env(1, &env(&[("a", "one")])).await.unwrap();
        store.insert_stored_env(2, &env(&[("a", "two"), ("b", "two")])).await.unwrap();
        store.apply(1).await.unwrap();
        store.apply(2).await.unwrap();

        assert_eq!(
            store.applied_env().await.unwrap(),
            env(&[("a", "one"), ("b", "two")])
        );
        store.delete_stored_env(1).await.unwrap();
        assert_eq!(store.load_stored_env(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_survives_reopen_with_custom_tables() {
        let dir = TempDir::new().unwrap();
        let config = SqliteConfig::file(dir.path().join("nested/state.db"))
            .tables(TableNames::with_prefix("stage_a_").unwrap());

        let store = SqliteStore::open(config.clone()).await.unwrap();
        store.commit_up(&up_run(1, 200), &env(&[("k", "v")])).await.unwrap();
        drop(store);

        let store = SqliteStore::open(config).await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(store.list_applied().await.unwrap(), vec![1]);
        assert_eq!(store.applied_env().await.unwrap(), env(&[("k", "v")]));
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_config_error() {
        let config = SqliteConfig::memory().tables(TableNames {
            migrations: "bad name".to_string(),
            ..TableNames::default()
        });
        assert!(matches!(
            SqliteStore::open(config).await,
            Err(SqliteError::Config(_))
        ));
    }
}
