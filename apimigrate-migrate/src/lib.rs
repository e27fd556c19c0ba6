//! # apimigrate-migrate
//!
//! Migration engine for apimigrate.
//!
//! This crate provides functionality for:
//! - Discovering ordered `NNN_description.yaml` migration files
//! - Rendering requests against a layered environment (global, local, auth)
//! - Executing HTTP tasks with status validation and JSON value extraction
//! - Tracking applied versions, run history and stored variables
//! - Rolling back with the variables captured when a version was applied
//! - **Stage orchestration** across independent migration directories
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌─────────────┐
//! │ config.yaml  │────▶│ EngineBuilder  │────▶│ Auth (lazy) │
//! └──────────────┘     └────────────────┘     └─────────────┘
//!                              │                     │
//!                              ▼                     ▼
//!                      ┌────────────────┐     ┌─────────────┐
//!                      │ Migration Plan │────▶│ HTTP task   │
//!                      └────────────────┘     └─────────────┘
//!                                                    │
//!                                                    ▼
//!                                            ┌─────────────┐
//!                                            │ Store       │
//!                                            └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use apimigrate_migrate::{MemoryStore, MigrationEngine, ProjectConfig};
//!
//! async fn run_migrations() -> Result<(), Box<dyn std::error::Error>> {
//!     let project = ProjectConfig::load("config.yaml".as_ref())?;
//!     let engine = MigrationEngine::builder(&project)
//!         .store(Arc::new(MemoryStore::new()))
//!         .build()
//!         .await?;
//!
//!     println!("{}", engine.plan_up(None).await?.summary());
//!     let applied = engine.up(None).await?;
//!     println!("Applied {} migrations", applied.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Migration Files
//!
//! ```text
//! migrations/
//! ├── 001_create_tenant.yaml
//! ├── 002_seed_plans.yaml
//! └── body/
//!     └── plans.json          # referenced through body_file
//! ```
//!
//! ## Stages
//!
//! ```rust,ignore
//! use apimigrate_migrate::{Orchestrator, StageSelection};
//!
//! let orchestrator = Orchestrator::load("stages.yaml".as_ref(), factory)?;
//! for report in orchestrator.up(&StageSelection::all()).await? {
//!     println!("{}: {:?}", report.stage, report.outcome);
//! }
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod file;
pub mod http;
pub mod jsonpath;
pub mod stage;
pub mod store;
pub mod task;
pub mod template;
pub mod wait;

#[cfg(test)]
mod test_support;

// Re-exports
pub use auth::{AuthMethod, AuthRegistry, BasicAuth, CachedToken, OAuth2Auth, PocketBaseAuth, TokenCache};
pub use config::{
    AuthConfig, ClientConfig, EnvVarConfig, LogFormat, LoggingConfig, ProjectConfig, StoreConfig,
    StoreDriver, TlsVersion, WaitConfig,
};
pub use engine::{
    EngineBuilder, MigrationConfig, MigrationEngine, MigrationPlan, MigrationStatus, VersionResult,
};
pub use env::{Env, EnvValue};
pub use error::{MigrateResult, MigrationError, PartialFailure, PartialResult};
pub use file::{MigrationFile, MigrationFileManager};
pub use http::{ExecResult, HttpExecutor, RequestDefaults};
pub use stage::{
    OnFailure, Orchestrator, StageGraph, StageOutcome, StageReport, StageSelection, StageStatus,
    StageValidation, StagesConfig,
};
pub use store::{
    Direction, EnvMap, MemoryStore, MigrationStore, NewRun, RunRecord, StoreFactory, TableNames,
    Version,
};
pub use task::{DownTask, MigrationTask, RequestSpec, ResponseSpec, UpTask};
pub use template::RenderMode;
