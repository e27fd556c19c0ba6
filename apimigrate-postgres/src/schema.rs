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
    /// Append a run, returning its id.
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
                    version BIGINT PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE TABLE IF NOT EXISTS {runs} (
                    id BIGSERIAL PRIMARY KEY,
                    version BIGINT NOT NULL,
                    direction TEXT NOT NULL,
                    status_code INTEGER,
                    failed BOOLEAN NOT NULL DEFAULT FALSE,
                    ran_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    body TEXT,
                    env JSONB
                );
                CREATE INDEX IF NOT EXISTS {runs}_version_idx ON {runs} (version);
                CREATE TABLE IF NOT EXISTS {stored_env} (
                    version BIGINT PRIMARY KEY,
                    env JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );"
            ),
            list_applied: format!("SELECT version FROM {migrations} ORDER BY version"),
            apply: format!(
                "INSERT INTO {migrations} (version) VALUES ($1) ON CONFLICT (version) DO NOTHING"
            ),
            remove: format!("DELETE FROM {migrations} WHERE version = $1"),
            insert_run: format!(
                "INSERT INTO {runs} (version, direction, status_code, failed, body, env)
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id"
            ),
            list_runs: format!(
                "SELECT id, version, direction, status_code, failed, ran_at, body, env
                 FROM {runs} ORDER BY id"
            ),
            upsert_env: format!(
                "INSERT INTO {stored_env} (version, env) VALUES ($1, $2)
                 ON CONFLICT (version) DO UPDATE SET env = EXCLUDED.env, updated_at = now()"
            ),
            load_env: format!("SELECT env FROM {stored_env} WHERE version = $1"),
            delete_env: format!("DELETE FROM {stored_env} WHERE version = $1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_use_table_names() {
        let tables = TableNames {
            migrations: "applied".to_string(),
            runs: "history".to_string(),
            stored_env: "vars".to_string(),
        };
        let sql = Statements::new(&tables);
        assert!(sql.create.contains("CREATE TABLE IF NOT EXISTS applied"));
        assert!(sql.create.contains("history_version_idx ON history"));
        assert!(sql.insert_run.ends_with("RETURNING id"));
        assert_eq!(sql.load_env, "SELECT env FROM vars WHERE version = $1");
    }

    #[test]
    fn test_default_table_names() {
        let sql = Statements::new(&TableNames::default());
        assert!(sql.list_applied.contains("schema_migrations"));
        assert!(sql.list_runs.contains("migration_runs"));
        assert!(sql.delete_env.contains("stored_env"));
    }
}
