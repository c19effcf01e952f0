//! SQLite-backed data access layer.
//!
//! One [`Database`] wraps a connection pool and exposes typed operations
//! per entity, split across submodules by concern:
//!
//! - [`documents`]: document rows and optimistic status transitions
//! - [`tags`]: tags and the document/tag junction
//! - [`series`]: series rows and membership
//! - [`files`]: tag-signature file aggregations
//! - [`prompts`]: versioned prompt families
//! - [`events`]: the append-only audit log
//! - [`locks`]: advisory locks with lease expiry
//!
//! The schema is applied inline via `include_str!` on every open; all
//! timestamps are RFC 3339 strings in UTC.

use std::path::Path;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod documents;
pub mod events;
pub mod files;
pub mod locks;
pub mod prompts;
pub mod registry;
pub mod series;
pub mod tags;

pub use documents::DocumentRecord;
pub use events::{EventRecord, NewEvent};
pub use files::FileRecord;
pub use prompts::{NewPrompt, PromptRecord};
pub use series::SeriesRecord;
pub use tags::TagRecord;

const SCHEMA: &str = include_str!("migrations/001_schema.sql");

/// Pooled handle to the pipeline database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to apply schema migration")?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for testing.
    ///
    /// Pool is capped at one connection so every query sees the same
    /// in-memory instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or migration fails.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("failed to apply schema migration")?;

        Ok(Self { pool })
    }

    /// The underlying pool, for operations composed outside this module.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Current UTC time as the RFC 3339 string stored in every timestamp column.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
