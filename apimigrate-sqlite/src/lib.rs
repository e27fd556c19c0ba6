//! SQLite store for apimigrate.
//!
//! This crate keeps applied versions, run history and stored variables in a
//! single SQLite file, using `tokio-rusqlite` so every statement runs off the
//! async runtime.
//!
//! # Features
//!
//! - One database file per stage (or `:memory:`)
//! - Configurable table names, so several stages can share a file
//! - `commit_up`/`commit_down` run in one transaction each
//!
//! # Example
//!
//! ```rust,ignore
//! use apimigrate_sqlite::{SqliteConfig, SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteStore::open(SqliteConfig::from_url("sqlite://./state.db")?).await?;
//!     // Hand `Arc::new(store)` to a MigrationEngine...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod schema;
pub mod store;

pub use config::{DatabasePath, JournalMode, SqliteConfig, SynchronousMode};
pub use error::{SqliteError, SqliteResult};
pub use schema::Statements;
pub use store::SqliteStore;
