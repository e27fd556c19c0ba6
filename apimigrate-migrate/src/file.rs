//! Migration file discovery.
//!
//! Migration files are named `NNN_description.yaml` (or `.yml`). The leading
//! integer is the version. Files are sorted by version and then by file name
//! right after listing, so the result never depends on directory iteration
//! order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::store::Version;
use crate::task::MigrationTask;

/// A migration file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationFile {
    /// Path to the migration file.
    pub path: PathBuf,
    /// Version parsed from the filename prefix.
    pub version: Version,
    /// Description part of the filename.
    pub name: String,
}

impl MigrationFile {
    /// The file name.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Parse the task this file describes. Always reads the current content.
    pub async fn load(&self) -> MigrateResult<MigrationTask> {
        MigrationTask::load(&self.path).await
    }
}

/// Lists and reads migration files in one directory.
#[derive(Debug, Clone)]
pub struct MigrationFileManager {
    migrations_dir: PathBuf,
}

impl MigrationFileManager {
    /// Create a new file manager.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Get the migrations directory.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// List all migration files ordered by version.
    ///
    /// Files whose names do not match `NNN_description.yaml` are ignored. Two
    /// files with the same version are an error.
    pub async fn list_migrations(&self) -> MigrateResult<Vec<MigrationFile>> {
        if !tokio::fs::try_exists(&self.migrations_dir).await? {
            return Err(MigrationError::config(format!(
                "migrations directory {} does not exist",
                self.migrations_dir.display()
            )));
        }

        let mut entries = tokio::fs::read_dir(&self.migrations_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_migration_name(file_name) {
                Some((version, name)) => files.push(MigrationFile {
                    version,
                    name,
                    path: path.clone(),
                }),
                None => debug!(file = %file_name, "Skipping non-migration file"),
            }
        }

        files.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.file_name().cmp(b.file_name()))
        });

        for pair in files.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(MigrationError::DuplicateVersion {
                    version: pair[0].version,
                    first: pair[0].path.clone(),
                    second: pair[1].path.clone(),
                });
            }
        }

        Ok(files)
    }

    /// Find the file for a version.
    pub async fn find(&self, version: Version) -> MigrateResult<Option<MigrationFile>> {
        Ok(self
            .list_migrations()
            .await?
            .into_iter()
            .find(|f| f.version == version))
    }

    /// Read a `body_file` referenced by a task, relative to the directory.
    pub async fn read_body_file(&self, relative: &str) -> MigrateResult<String> {
        let path = crate::config::resolve(&self.migrations_dir, Path::new(relative));
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            MigrationError::invalid_migration(format!(
                "cannot read body_file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// Parse `NNN_description.yaml` into `(version, description)`.
fn parse_migration_name(file_name: &str) -> Option<(Version, String)> {
    let stem = file_name
        .strip_suffix(".yaml")
        .or_else(|| file_name.strip_suffix(".yml"))?;
    let (prefix, name) = stem.split_once('_')?;
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let version: Version = prefix.parse().ok()?;
    if version <= 0 {
        warn!(file = %file_name, "Ignoring migration with version 0");
        return None;
    }
    Some((version, name.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const TASK: &str = "up:\n  request:\n    url: http://localhost/\n";

    fn write(dir: &TempDir, name: &str) {
        std::fs::write(dir.path().join(name), TASK).unwrap();
    }

    #[test]
    fn test_parse_migration_name() {
        assert_eq!(
            parse_migration_name("001_create_users.yaml"),
            Some((1, "create_users".to_string()))
        );
        assert_eq!(parse_migration_name("42_x.yml"), Some((42, "x".to_string())));
        assert_eq!(parse_migration_name("README.md"), None);
        assert_eq!(parse_migration_name("abc_test.yaml"), None);
        assert_eq!(parse_migration_name("001.yaml"), None);
        assert_eq!(parse_migration_name("000_zero.yaml"), None);
    }

    #[tokio::test]
    async fn test_numeric_order_with_gaps() {
        let dir = TempDir::new().unwrap();
        for name in ["10_ten.yaml", "2_two.yaml", "001_one.yaml", "notes.txt"] {
            write(&dir, name);
        }
        std::fs::create_dir(dir.path().join("003_dir.yaml")).unwrap();

        let files = MigrationFileManager::new(dir.path())
            .list_migrations()
            .await
            .unwrap();
        let versions: Vec<_> = files.iter().map(|f| f.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(files[0].name, "one");
    }

    #[tokio::test]
    async fn test_duplicate_versions_rejected_deterministically() {
        let dir = TempDir::new().unwrap();
        write(&dir, "002_b.yaml");
        write(&dir, "2_a.yaml");

        let err = MigrationFileManager::new(dir.path())
            .list_migrations()
            .await
            .unwrap_err();
        match err {
            MigrationError::DuplicateVersion { version, first, second } => {
                assert_eq!(version, 2);
                assert!(first.ends_with("002_b.yaml"));
                assert!(second.ends_with("2_a.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let manager = MigrationFileManager::new(dir.path().join("nope"));
        assert!(manager.list_migrations().await.unwrap_err().is_config_error());
    }

    #[tokio::test]
    async fn test_find_and_load() {
        let dir = TempDir::new().unwrap();
        write(&dir, "005_five.yaml");
        std::fs::write(dir.path().join("body.json"), "{\"a\":1}").unwrap();

        let manager = MigrationFileManager::new(dir.path());
        let file = manager.find(5).await.unwrap().unwrap();
        let task = file.load().await.unwrap();
        assert_eq!(task.up.request.url, "http://localhost/");
        assert!(manager.find(6).await.unwrap().is_none());
        assert_eq!(manager.read_body_file("body.json").await.unwrap(), "{\"a\":1}");
    }
}
