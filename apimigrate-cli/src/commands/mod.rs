//! CLI command implementations.

use std::path::Path;
use std::sync::Arc;

use apimigrate::{DriverStoreFactory, MigrationEngine, ProjectConfig, StoreFactory};
use tokio_util::sync::CancellationToken;

use crate::error::{CliError, CliResult};
use crate::logging;
use crate::output;

pub mod down;
pub mod stages;
pub mod status;
pub mod up;

/// Load `config.yaml`, start logging and build an engine on its store.
pub(crate) async fn open_engine(
    config_path: &Path,
    dry_run: bool,
    cancel: CancellationToken,
) -> CliResult<MigrationEngine> {
    if !config_path.exists() {
        return Err(CliError::Config(format!(
            "config file {} not found",
            config_path.display()
        )));
    }
    let project = ProjectConfig::load(config_path)?;
    logging::init(&project.logging);

    let store = DriverStoreFactory
        .open(&project.store, &project.base_dir)
        .await?;
    let engine = MigrationEngine::builder(&project)
        .store(Arc::clone(&store))
        .cancellation(cancel)
        .dry_run(dry_run)
        .build()
        .await?;
    output::kv("Config", &config_path.display().to_string());
    output::kv("Store", store.backend());
    output::kv(
        "Migrations",
        &engine.files().migrations_dir().display().to_string(),
    );
    output::newline();
    Ok(engine)
}
