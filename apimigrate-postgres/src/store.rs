//! [`MigrationStore`] over a pooled PostgreSQL connection.

use std::sync::Arc;

use apimigrate_migrate::{
    Direction, EnvMap, MigrateResult, MigrationStore, NewRun, RunRecord, Version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{GenericClient, Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::types::Json;
use tracing::{debug, info};

use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::schema::Statements;

/// Shared store backed by a PostgreSQL database.
///
/// `commit_up` and `commit_down` each run in one transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    sql: Arc<Statements>,
    database: String,
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("database", &self.database)
            .field("size", &self.pool.status().size)
            .finish()
    }
}

impl PgStore {
    /// Connect and create the tables.
    pub async fn open(config: PgConfig) -> PgResult<Self> {
        config
            .tables
            .validate()
            .map_err(|e| PgError::config(e.to_string()))?;

        let manager = Manager::from_config(
            config.to_pg_config(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| PgError::config(e.to_string()))?;

        let store = Self {
            pool,
            sql: Arc::new(Statements::new(&config.tables)),
            database: config.database,
        };
        store.create_tables().await?;

        info!(
            host = %config.host,
            database = %store.database,
            max_connections = config.max_connections,
            "PostgreSQL store opened"
        );
        Ok(store)
    }

    /// Connect using a `postgres://` URL and default table names.
    pub async fn connect(url: &str) -> PgResult<Self> {
        Self::open(PgConfig::from_url(url)?).await
    }

    /// The database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    async fn create_tables(&self) -> PgResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(&self.sql.create).await?;
        Ok(())
    }

    async fn execute(&self, statement: &str, version: Version) -> PgResult<()> {
        let client = self.pool.get().await?;
        client.execute(statement, &[&version]).await?;
        Ok(())
    }

    async fn list_applied_inner(&self) -> PgResult<Vec<Version>> {
        let client = self.pool.get().await?;
        let rows = client.query(&self.sql.list_applied, &[]).await?;
        Ok(rows.iter().map(|row| row.get::<_, i64>(0)).collect())
    }

    async fn list_runs_inner(&self) -> PgResult<Vec<RunRecord>> {
        let client = self.pool.get().await?;
        let rows = client.query(&self.sql.list_runs, &[]).await?;
        rows.iter().map(decode_run).collect()
    }

    async fn load_env_inner(&self, version: Version) -> PgResult<Option<EnvMap>> {
        let client = self.pool.get().await?;
        let row = client.query_opt(&self.sql.load_env, &[&version]).await?;
        Ok(row.map(|row| row.get::<_, Json<EnvMap>>(0).0))
    }

    async fn insert_env_inner(&self, version: Version, env: &EnvMap) -> PgResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(&self.sql.upsert_env, &[&version, &Json(env)])
            .await?;
        Ok(())
    }

    async fn record_run_inner(&self, run: &NewRun) -> PgResult<i64> {
        let client = self.pool.get().await?;
        insert_run(&client, &self.sql, run).await
    }

    async fn commit_up_inner(&self, run: &NewRun, env: &EnvMap) -> PgResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        insert_run(&tx, &self.sql, run).await?;
        tx.execute(&self.sql.upsert_env, &[&run.version, &Json(env)])
            .await?;
        tx.execute(&self.sql.apply, &[&run.version]).await?;
        tx.commit().await?;
        debug!(version = run.version, "Committed up");
        Ok(())
    }

    async fn commit_down_inner(&self, run: &NewRun) -> PgResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        insert_run(&tx, &self.sql, run).await?;
        tx.execute(&self.sql.delete_env, &[&run.version]).await?;
        tx.execute(&self.sql.remove, &[&run.version]).await?;
        tx.commit().await?;
        debug!(version = run.version, "Committed down");
        Ok(())
    }
}

async fn insert_run<C>(client: &C, sql: &Statements, run: &NewRun) -> PgResult<i64>
where
    C: GenericClient,
{
    let status_code = run.status_code.map(i32::from);
    let env = run.env.as_ref().map(Json);
    let row = client
        .query_one(
            &sql.insert_run,
            &[
                &run.version,
                &run.direction.as_str(),
                &status_code,
                &run.failed,
                &run.body,
                &env,
            ],
        )
        .await?;
    Ok(row.get(0))
}

fn decode_run(row: &tokio_postgres::Row) -> PgResult<RunRecord> {
    let id: i64 = row.try_get(0)?;
    let direction: String = row.try_get(2)?;
    let direction = Direction::parse(&direction)
        .map_err(|_| PgError::corrupt(format!("run {} has direction '{}'", id, direction)))?;
    let status_code = row
        .try_get::<_, Option<i32>>(3)?
        .map(|code| {
            u16::try_from(code)
                .map_err(|_| PgError::corrupt(format!("run {} has status {}", id, code)))
        })
        .transpose()?;
    let ran_at: DateTime<Utc> = row.try_get(5)?;
    let env: Option<Json<EnvMap>> = row.try_get(7)?;
    Ok(RunRecord {
        id,
        version: row.try_get(1)?,
        direction,
        status_code,
        failed: row.try_get(4)?,
        ran_at,
        body: row.try_get(6)?,
        env: env.map(|json| json.0),
    })
}

#[async_trait]
impl MigrationStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(&self) -> MigrateResult<()> {
        Ok(self.create_tables().await?)
    }

    async fn list_applied(&self) -> MigrateResult<Vec<Version>> {
        Ok(self.list_applied_inner().await?)
    }

    async fn apply(&self, version: Version) -> MigrateResult<()> {
        Ok(self.execute(&self.sql.apply, version).await?)
    }

    async fn remove(&self, version: Version) -> MigrateResult<()> {
        Ok(self.execute(&self.sql.remove, version).await?)
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
        Ok(self.execute(&self.sql.delete_env, version).await?)
    }

    async fn commit_up(&self, run: &NewRun, env: &EnvMap) -> MigrateResult<()> {
        Ok(self.commit_up_inner(run, env).await?)
    }

    async fn commit_down(&self, run: &NewRun) -> MigrateResult<()> {
        Ok(self.commit_down_inner(run).await?)
    }

    async fn close(&self) -> MigrateResult<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use apimigrate_migrate::TableNames;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Connection URL of a disposable database, if one is configured.
    fn test_url() -> Option<String> {
        std::env::var("APIMIGRATE_TEST_PG_URL").ok()
    }

    async fn fresh_store(prefix: &str) -> Option<PgStore> {
        let url = test_url()?;
        let config = PgConfig::from_url(&url)
            .unwrap()
            .tables(TableNames::with_prefix(prefix).unwrap());
        let store = PgStore::open(config.clone()).await.unwrap();
        let client = store.pool.get().await.unwrap();
        let tables = &config.tables;
        client
            .batch_execute(&format!(
                "TRUNCATE {}, {}, {} RESTART IDENTITY",
                tables.migrations, tables.runs, tables.stored_env
            ))
            .await
            .unwrap();
        Some(store)
    }

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_commit_up_and_down() {
        let Some(store) = fresh_store("pg_commit_").await else {
            return;
        };

        let mut run = NewRun::new(1, Direction::Up);
        run.status_code = Some(201);
        run.env = Some(env(&[("id", "7")]));
        store.commit_up(&run, &env(&[("id", "7")])).await.unwrap();
        store
            .commit_up(&NewRun::new(2, Direction::Up), &EnvMap::new())
            .await
            .unwrap();
        assert_eq!(store.list_applied().await.unwrap(), vec![1, 2]);
        assert_eq!(store.load_stored_env(1).await.unwrap(), Some(env(&[("id", "7")])));

        store
            .commit_down(&NewRun::new(2, Direction::Down))
            .await
            .unwrap();
        assert_eq!(store.current_version().await.unwrap(), 1);

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].status_code, Some(201));
        assert_eq!(runs[0].env, Some(env(&[("id", "7")])));
        assert_eq!(runs[2].direction, Direction::Down);
    }

    #[tokio::test]
    async fn test_failed_run_is_history_only() {
        let Some(store) = fresh_store("pg_failed_").await else {
            return;
        };
        let mut run = NewRun::new(1, Direction::Up);
        run.status_code = Some(500);
        run.failed = true;
        store.record_run(&run).await.unwrap();

        assert!(store.list_applied().await.unwrap().is_empty());
        assert!(store.list_runs().await.unwrap()[0].failed);
    }

    #[tokio::test]
    async fn test_stored_env_upsert() {
        let Some(store) = fresh_store("pg_env_").await else {
            return;
        };
        store.insert_stored_env(1, &env(&[("a", "old")])).await.unwrap();
        store.insert_stored_env(1, &env(&[("a", "new")])).await.unwrap();
        store.apply(1).await.unwrap();
        store.apply(1).await.unwrap();
        assert_eq!(store.applied_env().await.unwrap(), env(&[("a", "new")]));
    }
}
