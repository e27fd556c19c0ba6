//! SQLite store configuration.

use std::path::{Path, PathBuf};

use apimigrate_migrate::{StoreConfig, TableNames};

use crate::error::{SqliteError, SqliteResult};

/// SQLite store configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database path (or ":memory:" for in-memory).
    pub path: DatabasePath,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: Option<u32>,
    /// Synchronous mode.
    pub synchronous: SynchronousMode,
    /// Journal mode. Ignored for in-memory databases.
    pub journal_mode: JournalMode,
    /// Table names.
    pub tables: TableNames,
}

/// Database path configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DatabasePath {
    /// In-memory database.
    #[default]
    Memory,
    /// File-based database.
    File(PathBuf),
}

impl DatabasePath {
    /// Check if this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }

    /// Printable form, for logs.
    pub fn display(&self) -> String {
        match self {
            Self::Memory => ":memory:".to_string(),
            Self::File(path) => path.display().to_string(),
        }
    }
}

/// SQLite synchronous mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SynchronousMode {
    /// Synchronous OFF.
    Off,
    /// Synchronous NORMAL.
    #[default]
    Normal,
    /// Synchronous FULL.
    Full,
}

impl SynchronousMode {
    /// Get the SQLite pragma value.
    pub fn as_pragma(&self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JournalMode {
    /// DELETE - deletes the journal after each transaction.
    Delete,
    /// WAL - write-ahead logging.
    #[default]
    Wal,
}

impl JournalMode {
    /// Get the SQLite pragma value.
    pub fn as_pragma(&self) -> &'static str {
        match self {
            Self::Delete => "DELETE",
            Self::Wal => "WAL",
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: DatabasePath::Memory,
            busy_timeout_ms: Some(5000),
            synchronous: SynchronousMode::Normal,
            journal_mode: JournalMode::Wal,
            tables: TableNames::default(),
        }
    }
}

impl SqliteConfig {
    /// Configuration for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Configuration for a file-based database.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            path: DatabasePath::File(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Build from a stage's `store` section. Relative paths resolve against
    /// `base_dir`.
    pub fn from_store_config(config: &StoreConfig, base_dir: &Path) -> SqliteResult<Self> {
        let tables = config
            .table_names()
            .map_err(|e| SqliteError::config(e.to_string()))?;
        let path = config.sqlite_path(base_dir);
        let base = if path.as_os_str() == ":memory:" {
            Self::memory()
        } else {
            Self::file(path)
        };
        Ok(base.tables(tables))
    }

    /// Parse a SQLite URL into configuration.
    ///
    /// Supported formats:
    /// - `sqlite::memory:` - In-memory database
    /// - `sqlite://path/to/db.sqlite` - File-based database
    /// - `file:path/to/db.sqlite` - Alternative format
    pub fn from_url(url: impl AsRef<str>) -> SqliteResult<Self> {
        let url_str = url.as_ref();
        if url_str == "sqlite::memory:" || url_str == ":memory:" {
            return Ok(Self::memory());
        }

        let (path, query) = match url_str.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (url_str, None),
        };
        let path = path
            .strip_prefix("sqlite://")
            .or_else(|| path.strip_prefix("sqlite:"))
            .or_else(|| path.strip_prefix("file:"))
            .unwrap_or(path);
        if path.is_empty() {
            return Err(SqliteError::config("database path is required"));
        }

        let mut config = if path == ":memory:" {
            Self::memory()
        } else {
            Self::file(path)
        };

        for pair in query.unwrap_or_default().split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "mode" if value == "memory" => config.path = DatabasePath::Memory,
                "busy_timeout" => {
                    let ms = value
                        .parse()
                        .map_err(|_| SqliteError::config(format!("invalid busy_timeout '{value}'")))?;
                    config.busy_timeout_ms = Some(ms);
                }
                "synchronous" => {
                    config.synchronous = match value.to_lowercase().as_str() {
                        "off" => SynchronousMode::Off,
                        "full" => SynchronousMode::Full,
                        _ => SynchronousMode::Normal,
                    };
                }
                "journal_mode" => {
                    config.journal_mode = match value.to_lowercase().as_str() {
                        "delete" => JournalMode::Delete,
                        _ => JournalMode::Wal,
                    };
                }
                _ => {}
            }
        }

        Ok(config)
    }

    /// Pragmas run when a connection is opened.
    pub fn init_sql(&self) -> String {
        let mut sql = String::new();
        if !self.path.is_memory() {
            sql.push_str(&format!(
                "PRAGMA journal_mode = {};\n",
                self.journal_mode.as_pragma()
            ));
        }
        sql.push_str(&format!(
            "PRAGMA synchronous = {};\n",
            self.synchronous.as_pragma()
        ));
        if let Some(timeout) = self.busy_timeout_ms {
            sql.push_str(&format!("PRAGMA busy_timeout = {};\n", timeout));
        }
        sql
    }

    /// Set the busy timeout in milliseconds.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    /// Set the synchronous mode.
    pub fn synchronous(mut self, mode: SynchronousMode) -> Self {
        self.synchronous = mode;
        self
    }

    /// Set the journal mode.
    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    /// Set the table names.
    pub fn tables(mut self, tables: TableNames) -> Self {
        self.tables = tables;
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_from_url() {
        assert!(SqliteConfig::from_url("sqlite::memory:").unwrap().path.is_memory());
        assert!(SqliteConfig::from_url("sqlite::memory:?x=1").unwrap().path.is_memory());

        let config = SqliteConfig::from_url("sqlite://./state.db?busy_timeout=100&synchronous=full")
            .unwrap();
        assert_eq!(config.path, DatabasePath::File(PathBuf::from("./state.db")));
        assert_eq!(config.busy_timeout_ms, Some(100));
        assert_eq!(config.synchronous, SynchronousMode::Full);

        assert!(SqliteConfig::from_url("sqlite://").is_err());
        assert!(SqliteConfig::from_url("sqlite://a.db?busy_timeout=soon").is_err());
    }

    #[test]
    fn test_from_store_config() {
        let store = StoreConfig {
            path: Some(PathBuf::from("data/state.db")),
            table_prefix: Some("billing_".to_string()),
            ..Default::default()
        };
        let config = SqliteConfig::from_store_config(&store, Path::new("/srv/stage")).unwrap();
        assert_eq!(
            config.path,
            DatabasePath::File(PathBuf::from("/srv/stage/data/state.db"))
        );
        assert_eq!(config.tables.runs, "billing_migration_runs");

        let store = StoreConfig {
            path: Some(PathBuf::from(":memory:")),
            ..Default::default()
        };
        let config = SqliteConfig::from_store_config(&store, Path::new(".")).unwrap();
        assert!(config.path.is_memory());
    }

    #[test]
    fn test_init_sql() {
        let sql = SqliteConfig::file("x.db").init_sql();
        assert!(sql.contains("journal_mode = WAL"));
        assert!(sql.contains("synchronous = NORMAL"));
        assert!(sql.contains("busy_timeout = 5000"));

        let sql = SqliteConfig::memory().init_sql();
        assert!(!sql.contains("journal_mode"));
    }
}
