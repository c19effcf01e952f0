//! Series rows, membership, and the prompt/regeneration bookkeeping.
//!
//! Series identity is `(entity_normalized, series_type_normalized,
//! user_id)`; the unique constraint backs up the advisory lock so even a
//! raced create collapses onto one row. Prompts are referenced by id
//! only, never joined structurally, to keep the series ↔ prompt ↔
//! document cycle broken.

use crate::db::documents::DocumentRecord;
use crate::db::{now, Database};

/// Columns selected for a full series record.
const SERIES_COLUMNS: &str = "id, title, entity, entity_normalized, series_type, \
     series_type_normalized, frequency, metadata, active_prompt_id, regeneration_pending, \
     document_count, user_id, created_at, updated_at";

/// A row from the `series` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeriesRecord {
    /// Auto-increment series id.
    pub id: i64,
    /// Display title, e.g. "PG&E monthly utility bill".
    pub title: String,
    /// Entity as the detector canonicalized it.
    pub entity: String,
    /// Normalized entity for identity.
    pub entity_normalized: String,
    /// Recurring pattern, e.g. "monthly_utility_bill".
    pub series_type: String,
    /// Normalized pattern for identity.
    pub series_type_normalized: String,
    /// Cadence hint from the detector.
    pub frequency: Option<String>,
    /// Detector metadata JSON.
    pub metadata: String,
    /// Current series prompt; set exactly once, then only by evolution.
    pub active_prompt_id: Option<i64>,
    /// Whether member documents still need re-extraction.
    pub regeneration_pending: i64,
    /// Member document count.
    pub document_count: i64,
    /// Owning user.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl SeriesRecord {
    /// Whether a regeneration sweep is owed.
    pub fn needs_regeneration(&self) -> bool {
        self.regeneration_pending != 0
    }
}

impl Database {
    /// Fetch one series by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn series(&self, id: i64) -> anyhow::Result<Option<SeriesRecord>> {
        let sql = format!("SELECT {SERIES_COLUMNS} FROM series WHERE id = ?1");
        let row = sqlx::query_as::<_, SeriesRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Look up a series by its normalized identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn find_series(
        &self,
        entity_normalized: &str,
        series_type_normalized: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<SeriesRecord>> {
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM series
             WHERE entity_normalized = ?1 AND series_type_normalized = ?2 AND user_id = ?3"
        );
        let row = sqlx::query_as::<_, SeriesRecord>(&sql)
            .bind(entity_normalized)
            .bind(series_type_normalized)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Create a series if its identity is new, then return the row.
    ///
    /// `INSERT OR IGNORE` plus the unique constraint makes the
    /// read-or-create atomic even without the caller's advisory lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_or_get_series(
        &self,
        title: &str,
        entity: &str,
        entity_normalized: &str,
        series_type: &str,
        series_type_normalized: &str,
        frequency: Option<&str>,
        metadata: &str,
        user_id: &str,
    ) -> anyhow::Result<SeriesRecord> {
        let ts = now();
        sqlx::query(
            "INSERT OR IGNORE INTO series
                 (title, entity, entity_normalized, series_type, series_type_normalized,
                  frequency, metadata, user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(title)
        .bind(entity)
        .bind(entity_normalized)
        .bind(series_type)
        .bind(series_type_normalized)
        .bind(frequency)
        .bind(metadata)
        .bind(user_id)
        .bind(&ts)
        .execute(self.pool())
        .await?;

        self.find_series(entity_normalized, series_type_normalized, user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("series vanished after create: {entity_normalized}"))
    }

    /// Add a document to a series; repeats are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn assign_document_to_series(
        &self,
        document_id: &str,
        series_id: i64,
    ) -> anyhow::Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO document_series (document_id, series_id, added_at)
             VALUES (?1, ?2, ?3)",
        )
        .bind(document_id)
        .bind(series_id)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(
                "UPDATE series SET document_count = document_count + 1, updated_at = ?2 WHERE id = ?1",
            )
            .bind(series_id)
            .bind(now())
            .execute(self.pool())
            .await?;
        }
        Ok(inserted)
    }

    /// The series a document belongs to, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn series_for_document(
        &self,
        document_id: &str,
    ) -> anyhow::Result<Option<SeriesRecord>> {
        // Column names are unambiguous: the junction carries none of the
        // series column names.
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM series
             JOIN document_series ds ON ds.series_id = series.id
             WHERE ds.document_id = ?1
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, SeriesRecord>(&sql)
            .bind(document_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Existing series catalog, largest first, for the detector prompt.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn series_catalog(
        &self,
        user_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<SeriesRecord>> {
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM series
             WHERE user_id = ?1
             ORDER BY document_count DESC, id ASC
             LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, SeriesRecord>(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Set the series prompt for the first time.
    ///
    /// Guarded on `active_prompt_id IS NULL` so the first creator under
    /// the lock wins and any racer observes `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn set_initial_series_prompt(
        &self,
        series_id: i64,
        prompt_id: i64,
    ) -> anyhow::Result<bool> {
        let updated = sqlx::query(
            "UPDATE series SET active_prompt_id = ?2, updated_at = ?3
             WHERE id = ?1 AND active_prompt_id IS NULL",
        )
        .bind(series_id)
        .bind(prompt_id)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;
        Ok(updated)
    }

    /// Point the series at an evolved prompt and flag regeneration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn promote_series_prompt(
        &self,
        series_id: i64,
        prompt_id: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE series SET active_prompt_id = ?2, regeneration_pending = 1, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(series_id)
        .bind(prompt_id)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Series with a pending regeneration sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn series_pending_regeneration(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Vec<SeriesRecord>> {
        let sql = format!(
            "SELECT {SERIES_COLUMNS} FROM series
             WHERE user_id = ?1 AND regeneration_pending = 1
             ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, SeriesRecord>(&sql)
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Clear the regeneration flag once every member is current.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn clear_regeneration_pending(&self, series_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE series SET regeneration_pending = 0, updated_at = ?2 WHERE id = ?1")
            .bind(series_id)
            .bind(now())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Member documents whose extraction predates `prompt_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn series_documents_behind_prompt(
        &self,
        series_id: i64,
        prompt_id: i64,
    ) -> anyhow::Result<Vec<DocumentRecord>> {
        let rows = sqlx::query_as::<_, DocumentRecord>(
            "SELECT d.id, d.filename, d.status, d.document_type, d.extracted_text,
                    d.structured_data, d.structured_data_generic, d.summary, d.series_prompt_id,
                    d.extraction_method, d.ocr_confidence, d.page_count, d.retry_count,
                    d.error_message, d.source_folder, d.user_id, d.created_at, d.updated_at
             FROM documents d
             JOIN document_series ds ON ds.document_id = d.id
             WHERE ds.series_id = ?1
               AND (d.series_prompt_id IS NULL OR d.series_prompt_id != ?2)
               AND d.extracted_text IS NOT NULL
             ORDER BY d.created_at ASC",
        )
        .bind(series_id)
        .bind(prompt_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Database {
        Database::open_in_memory().await.expect("in-memory db")
    }

    async fn make_series(db: &Database) -> SeriesRecord {
        db.create_or_get_series(
            "PG&E monthly utility bill",
            "Pacific Gas & Electric",
            "pacific gas & electric",
            "monthly_utility_bill",
            "monthly_utility_bill",
            Some("monthly"),
            "{}",
            "local",
        )
        .await
        .expect("create series")
    }

    #[tokio::test]
    async fn create_or_get_collapses_duplicates() {
        let db = db().await;
        let first = make_series(&db).await;
        let second = make_series(&db).await;
        assert_eq!(first.id, second.id);

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM series")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn document_count_tracks_assignments() {
        let db = db().await;
        let series = make_series(&db).await;
        for id in ["doc-1", "doc-2"] {
            db.register_document(id, "f", "/f", "local")
                .await
                .expect("register");
            db.assign_document_to_series(id, series.id)
                .await
                .expect("assign");
        }
        // Repeat assignment is a no-op.
        db.assign_document_to_series("doc-1", series.id)
            .await
            .expect("assign repeat");

        let refreshed = db.series(series.id).await.expect("get").expect("exists");
        assert_eq!(refreshed.document_count, 2);

        let found = db
            .series_for_document("doc-1")
            .await
            .expect("lookup")
            .expect("member");
        assert_eq!(found.id, series.id);
    }

    #[tokio::test]
    async fn initial_prompt_set_exactly_once() {
        let db = db().await;
        let series = make_series(&db).await;

        assert!(db
            .set_initial_series_prompt(series.id, 11)
            .await
            .expect("first set"));
        assert!(!db
            .set_initial_series_prompt(series.id, 12)
            .await
            .expect("second set"));

        let refreshed = db.series(series.id).await.expect("get").expect("exists");
        assert_eq!(refreshed.active_prompt_id, Some(11));
    }

    #[tokio::test]
    async fn promote_flags_regeneration() {
        let db = db().await;
        let series = make_series(&db).await;
        db.set_initial_series_prompt(series.id, 11)
            .await
            .expect("set");
        db.promote_series_prompt(series.id, 12)
            .await
            .expect("promote");

        let pending = db
            .series_pending_regeneration("local")
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].active_prompt_id, Some(12));

        db.clear_regeneration_pending(series.id)
            .await
            .expect("clear");
        assert!(db
            .series_pending_regeneration("local")
            .await
            .expect("pending")
            .is_empty());
    }

    #[tokio::test]
    async fn behind_prompt_query_finds_outdated_members() {
        let db = db().await;
        let series = make_series(&db).await;
        for (id, prompt) in [("doc-1", Some(11)), ("doc-2", Some(12)), ("doc-3", None)] {
            db.register_document(id, "f", "/f", "local")
                .await
                .expect("register");
            sqlx::query(
                "UPDATE documents SET extracted_text = 'text', series_prompt_id = ?2 WHERE id = ?1",
            )
            .bind(id)
            .bind(prompt)
            .execute(db.pool())
            .await
            .expect("seed");
            db.assign_document_to_series(id, series.id)
                .await
                .expect("assign");
        }

        let behind = db
            .series_documents_behind_prompt(series.id, 12)
            .await
            .expect("query");
        let ids: Vec<&str> = behind.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-1", "doc-3"]);
    }

    #[tokio::test]
    async fn catalog_orders_by_size() {
        let db = db().await;
        let big = make_series(&db).await;
        let small = db
            .create_or_get_series(
                "Chase statement",
                "Chase",
                "chase",
                "monthly_statement",
                "monthly_statement",
                None,
                "{}",
                "local",
            )
            .await
            .expect("create");
        for id in ["doc-1", "doc-2"] {
            db.register_document(id, "f", "/f", "local")
                .await
                .expect("register");
            db.assign_document_to_series(id, big.id)
                .await
                .expect("assign");
        }

        let catalog = db.series_catalog("local", 10).await.expect("catalog");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].id, big.id);
        assert_eq!(catalog[1].id, small.id);
    }
}
