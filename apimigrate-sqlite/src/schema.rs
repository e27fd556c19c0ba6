//! SQL for the three store tables.

use apimigrate_migrate::TableNames;

/// Every statement the store runs, rendered once for a set of table names.
#[derive(Debug, Clone)]
pub struct Statements {
    /// Table and index creation.
    pub create: String,
    /// Applied versions, ascending.
    pub list_applied: String,
    /// Mark applied (idempotent).
    pub apply: String,
    /// Mark unapplied.
    pub remove: String,
    /// Append a run.
    pub insert_run: String,
    /// The run history.
    pub list_runs: String,
    /// Insert or replace stored variables.
    pub upsert_env: String,
    /// Stored variables of one version.
    pub load_env: String,
    /// Drop stored variables of one version.
    pub delete_env: String,
}

impl Statements {
    /// Render statements for `tables`. Names must already be validated.
    pub fn new(tables: &TableNames) -> Self {
        let TableNames {
            migrations,
            runs,
            stored_env,
        } = tables;
        Self {
            create: format!(
                "CREATE TABLE IF NOT EXISTS {migrations} (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {runs} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    version INTEGER NOT NULL,
                    direction TEXT NOT NULL,
                    status_code INTEGER,
                    failed INTEGER NOT NULL DEFAULT 0,
                    ran_at TEXT NOT NULL,
                    body TEXT,
                    env_json TEXT
                );
                CREATE INDEX IF NOT EXISTS {runs}_version_idx ON {runs} (version);
                CREATE TABLE IF NOT EXISTS {stored_env} (
                    version INTEGER PRIMARY KEY,
                    env_json TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );"
            ),
            list_applied: format!("SELECT version FROM {migrations} ORDER BY version"),
            apply: format!(
                "INSERT OR IGNORE INTO {migrations} (version, applied_at) VALUES (?1, ?2)"
            ),
            remove: format!("DELETE FROM {migrations} WHERE version = ?1"),
            insert_run: format!(
                "INSERT INTO {runs} (version, direction, status_code, failed, ran_at, body, env_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            list_runs: format!(
                "SELECT id, version, direction, status_code, failed, ran_at, body, env_json
                 FROM {runs} ORDER BY id"
            ),
            upsert_env: format!(
                "INSERT INTO {stored_env} (version, env_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(version) DO UPDATE SET env_json = excluded.env_json, updated_at = excluded.updated_at"
            ),
            load_env: format!("SELECT env_json FROM {stored_env} WHERE version = ?1"),
            delete_env: format!("DELETE FROM {stored_env} WHERE version = ?1"),
        }
    }
}
