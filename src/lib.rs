//! # apimigrate
//!
//! Versioned HTTP API migrations.
//!
//! A migration is a YAML file holding one request (plus optional
//! pre-requests) for `up` and one for `down`. apimigrate applies them in
//! version order, records what ran in a store, carries variables extracted
//! from responses into later requests and can roll everything back.
//!
//! apimigrate provides:
//! - A single-directory [`MigrationEngine`] with dry runs and status
//! - A multi-stage [`Orchestrator`] with dependency ordering and env imports
//! - SQLite and PostgreSQL stores selected by `store.driver`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use apimigrate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), apimigrate::MigrationError> {
//!     let project = ProjectConfig::load(Path::new("config.yaml"))?;
//!     let store = DriverStoreFactory
//!         .open(&project.store, &project.base_dir)
//!         .await?;
//!     let engine = MigrationEngine::builder(&project).store(store).build().await?;
//!     let results = engine.up(None).await.map_err(|failure| failure.error)?;
//!     println!("applied {} migration(s)", results.len());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

pub use apimigrate_migrate::*;

/// SQLite store backend.
#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite {
    pub use apimigrate_sqlite::*;
}

/// PostgreSQL store backend.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use apimigrate_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::DriverStoreFactory;
    pub use apimigrate_migrate::{
        MigrationEngine, MigrationError, MigrationStore, Orchestrator, ProjectConfig,
        StageSelection, StagesConfig, StoreFactory,
    };
}

/// Opens the store named by `store.driver`.
///
/// Drivers whose cargo feature is disabled fail with a configuration error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverStoreFactory;

#[async_trait]
impl StoreFactory for DriverStoreFactory {
    async fn open(
        &self,
        config: &StoreConfig,
        base_dir: &Path,
    ) -> MigrateResult<Arc<dyn MigrationStore>> {
        debug!(driver = ?config.driver, base_dir = %base_dir.display(), "Opening store");
        match config.driver {
            StoreDriver::Sqlite => open_sqlite(config, base_dir).await,
            StoreDriver::Postgres => open_postgres(config).await,
        }
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(config: &StoreConfig, base_dir: &Path) -> MigrateResult<Arc<dyn MigrationStore>> {
    let sqlite = apimigrate_sqlite::SqliteConfig::from_store_config(config, base_dir)?;
    Ok(Arc::new(apimigrate_sqlite::SqliteStore::open(sqlite).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_: &StoreConfig, _: &Path) -> MigrateResult<Arc<dyn MigrationStore>> {
    Err(MigrationError::config(
        "store driver 'sqlite' requires the `sqlite` feature",
    ))
}

#[cfg(feature = "postgres")]
async fn open_postgres(config: &StoreConfig) -> MigrateResult<Arc<dyn MigrationStore>> {
    let pg = apimigrate_postgres::PgConfig::from_store_config(config)?;
    Ok(Arc::new(apimigrate_postgres::PgStore::open(pg).await?))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_: &StoreConfig) -> MigrateResult<Arc<dyn MigrationStore>> {
    Err(MigrationError::config(
        "store driver 'postgres' requires the `postgres` feature",
    ))
}
