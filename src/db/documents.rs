//! Document rows and their optimistic status transitions.
//!
//! Every transition is a conditional `UPDATE … WHERE status IN (…)`;
//! zero rows affected means another worker advanced the row first, which
//! callers treat as benign. Successful transitions also append a
//! `lifecycle` event so the audit trail covers every state change.

use serde_json::json;

use crate::db::{now, Database, NewEvent};
use crate::types::{DocumentStatus, EventCategory};

/// Columns selected for a full document record.
const DOCUMENT_COLUMNS: &str = "id, filename, status, document_type, extracted_text, \
     structured_data, structured_data_generic, summary, series_prompt_id, \
     extraction_method, ocr_confidence, page_count, retry_count, error_message, \
     source_folder, user_id, created_at, updated_at";

/// A full row from the `documents` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRecord {
    /// Document UUID (string form).
    pub id: String,
    /// Original folder name from the inbox.
    pub filename: String,
    /// Raw status column; use [`DocumentRecord::status`].
    pub status: String,
    /// Type assigned by the classifier.
    pub document_type: Option<String>,
    /// OCR output text.
    pub extracted_text: Option<String>,
    /// Series-scoped extraction JSON.
    pub structured_data: Option<String>,
    /// Generic extraction JSON, written once per successful summarize.
    pub structured_data_generic: Option<String>,
    /// Short human summary from the generic extraction.
    pub summary: Option<String>,
    /// Prompt that produced `structured_data`.
    pub series_prompt_id: Option<i64>,
    /// Which extraction(s) populated structured data.
    pub extraction_method: Option<String>,
    /// Average OCR confidence.
    pub ocr_confidence: Option<f64>,
    /// Number of input files processed by OCR.
    pub page_count: Option<i64>,
    /// Retries consumed from the budget.
    pub retry_count: i64,
    /// Terminal failure reason, if any.
    pub error_message: Option<String>,
    /// Absolute path of the registered inbox folder.
    pub source_folder: String,
    /// Owning user.
    pub user_id: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

impl DocumentRecord {
    /// Parsed lifecycle status. An unknown column value parks the row as
    /// failed rather than re-running arbitrary steps over it.
    pub fn status(&self) -> DocumentStatus {
        DocumentStatus::parse(&self.status).unwrap_or(DocumentStatus::Failed)
    }
}

impl Database {
    /// Register a freshly scanned document in `pending`.
    ///
    /// Idempotent: returns `false` when the id is already registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn register_document(
        &self,
        id: &str,
        filename: &str,
        source_folder: &str,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let ts = now();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO documents (id, filename, status, source_folder, user_id, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
        )
        .bind(id)
        .bind(filename)
        .bind(source_folder)
        .bind(user_id)
        .bind(&ts)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch one document by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn document(&self, id: &str) -> anyhow::Result<Option<DocumentRecord>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
        let row = sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Documents currently in any of the given statuses, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn documents_by_status(
        &self,
        statuses: &[DocumentStatus],
        limit: i64,
    ) -> anyhow::Result<Vec<DocumentRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE status IN ({placeholders})
             ORDER BY created_at ASC
             LIMIT ?"
        );
        let mut query = sqlx::query_as::<_, DocumentRecord>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;
        Ok(rows)
    }

    /// Conditional status transition with lifecycle event logging.
    ///
    /// Returns `false` when the row was not in any of the expected
    /// states, the benign state-conflict case.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn transition_document(
        &self,
        id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE documents SET status = ?, updated_at = ? WHERE id = ? AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now()).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let moved = query.execute(self.pool()).await?.rows_affected() > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "transition".to_owned(),
                document_id: Some(id.to_owned()),
                details: json!({ "to": to.as_str() }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Persist OCR output and move `ocr_in_progress → ocr_completed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn complete_ocr(
        &self,
        id: &str,
        extracted_text: &str,
        avg_confidence: f64,
        page_count: i64,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let moved = sqlx::query(
            "UPDATE documents
             SET status = 'ocr_completed', extracted_text = ?2, ocr_confidence = ?3,
                 page_count = ?4, updated_at = ?5
             WHERE id = ?1 AND status = 'ocr_in_progress'",
        )
        .bind(id)
        .bind(extracted_text)
        .bind(avg_confidence)
        .bind(page_count)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "transition".to_owned(),
                document_id: Some(id.to_owned()),
                details: json!({ "to": "ocr_completed", "pages": page_count }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Record the classifier verdict and move `ocr_completed → classified`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn complete_classification(
        &self,
        id: &str,
        document_type: &str,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let moved = sqlx::query(
            "UPDATE documents
             SET status = 'classified', document_type = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'ocr_completed'",
        )
        .bind(id)
        .bind(document_type)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "transition".to_owned(),
                document_id: Some(id.to_owned()),
                details: json!({ "to": "classified", "document_type": document_type }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Persist the generic extraction and move to `summarized`.
    ///
    /// `structured_data_generic` is written exactly once: the guard on
    /// the predecessor states means a repeat call cannot overwrite it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn complete_summarize(
        &self,
        id: &str,
        structured_data_generic: &str,
        summary: &str,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let moved = sqlx::query(
            "UPDATE documents
             SET status = 'summarized', structured_data_generic = ?2, summary = ?3,
                 extraction_method = COALESCE(extraction_method, 'generic'), updated_at = ?4
             WHERE id = ?1 AND status IN ('classified', 'scored_classification')",
        )
        .bind(id)
        .bind(structured_data_generic)
        .bind(summary)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "transition".to_owned(),
                document_id: Some(id.to_owned()),
                details: json!({ "to": "summarized" }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Move `summarized`/`scored_summary` to `filed` once series
    /// detection and file assignment finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn complete_filing(&self, id: &str, user_id: &str) -> anyhow::Result<bool> {
        self.transition_document(
            id,
            &[DocumentStatus::Summarized, DocumentStatus::ScoredSummary],
            DocumentStatus::Filed,
            user_id,
        )
        .await
    }

    /// Persist the series extraction and move `series_summarizing →
    /// series_summarized`.
    ///
    /// `extraction_method` becomes `both` when a generic extraction is
    /// already present, `series` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn complete_series_summarize(
        &self,
        id: &str,
        structured_data: &str,
        series_prompt_id: i64,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let moved = sqlx::query(
            "UPDATE documents
             SET status = 'series_summarized', structured_data = ?2, series_prompt_id = ?3,
                 extraction_method = CASE
                     WHEN structured_data_generic IS NULL THEN 'series'
                     ELSE 'both'
                 END,
                 updated_at = ?4
             WHERE id = ?1 AND status = 'series_summarizing'",
        )
        .bind(id)
        .bind(structured_data)
        .bind(series_prompt_id)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "transition".to_owned(),
                document_id: Some(id.to_owned()),
                prompt_id: Some(series_prompt_id),
                details: json!({ "to": "series_summarized" }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Rewrite the series extraction outside the lifecycle (regeneration
    /// sweep): no status change, no scoring.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn update_series_extraction(
        &self,
        id: &str,
        structured_data: &str,
        series_prompt_id: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE documents
             SET structured_data = ?2, series_prompt_id = ?3,
                 extraction_method = CASE
                     WHEN structured_data_generic IS NULL THEN 'series'
                     ELSE 'both'
                 END,
                 updated_at = ?4
             WHERE id = ?1",
        )
        .bind(id)
        .bind(structured_data)
        .bind(series_prompt_id)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mark a document terminally failed with a reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn fail_document(
        &self,
        id: &str,
        error_message: &str,
        user_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE documents SET status = 'failed', error_message = ?2, updated_at = ?3
             WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(error_message)
        .bind(now())
        .execute(self.pool())
        .await?;

        self.log_event(&NewEvent {
            category: EventCategory::Error,
            event_type: "document_failed".to_owned(),
            document_id: Some(id.to_owned()),
            details: json!({ "error": error_message }),
            user_id: user_id.to_owned(),
            ..NewEvent::default()
        })
        .await?;
        Ok(())
    }

    /// Increment the retry counter and return the new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn bump_document_retry(&self, id: &str) -> anyhow::Result<i64> {
        sqlx::query(
            "UPDATE documents SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(now())
        .execute(self.pool())
        .await?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT retry_count FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(n,)| n).unwrap_or(0))
    }

    /// Documents stuck in an in-flight sub-state older than the cutoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn stale_in_flight_documents(
        &self,
        cutoff_rfc3339: &str,
    ) -> anyhow::Result<Vec<DocumentRecord>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE status IN ('ocr_in_progress', 'series_summarizing', 'series_scoring')
               AND updated_at < ?1
             ORDER BY updated_at ASC"
        );
        let rows = sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(cutoff_rfc3339)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Recovery reset: put the row back to `target` and charge one retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn reset_document_for_retry(
        &self,
        id: &str,
        target: DocumentStatus,
        user_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?2, retry_count = retry_count + 1, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(target.as_str())
        .bind(now())
        .execute(self.pool())
        .await?;

        self.log_event(&NewEvent {
            category: EventCategory::Recovery,
            event_type: "document_reset".to_owned(),
            document_id: Some(id.to_owned()),
            details: json!({ "reset_to": target.as_str() }),
            user_id: user_id.to_owned(),
            ..NewEvent::default()
        })
        .await?;
        Ok(())
    }

    /// Manual reprocess of a terminal `failed` document.
    ///
    /// Resets to the last state supported by already-persisted fields and
    /// clears the retry budget and error message. Returns the state the
    /// document was reset to, or `None` when it was not failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read or write fails.
    pub async fn reprocess_document(
        &self,
        id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<DocumentStatus>> {
        let Some(doc) = self.document(id).await? else {
            return Ok(None);
        };
        if doc.status() != DocumentStatus::Failed {
            return Ok(None);
        }

        let target = if doc.structured_data_generic.is_some() {
            DocumentStatus::Summarized
        } else if doc.document_type.is_some() {
            DocumentStatus::Classified
        } else if doc.extracted_text.is_some() {
            DocumentStatus::OcrCompleted
        } else {
            DocumentStatus::Pending
        };

        sqlx::query(
            "UPDATE documents
             SET status = ?2, retry_count = 0, error_message = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'failed'",
        )
        .bind(id)
        .bind(target.as_str())
        .bind(now())
        .execute(self.pool())
        .await?;

        self.log_event(&NewEvent {
            category: EventCategory::Recovery,
            event_type: "document_reprocessed".to_owned(),
            document_id: Some(id.to_owned()),
            details: json!({ "reset_to": target.as_str() }),
            user_id: user_id.to_owned(),
            ..NewEvent::default()
        })
        .await?;
        Ok(Some(target))
    }

    /// Full-text search over extracted text, best match first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails (including malformed
    /// FTS query syntax).
    pub async fn search_documents(
        &self,
        query: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<DocumentRecord>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE rowid IN (SELECT rowid FROM documents_fts WHERE documents_fts MATCH ?1)
             ORDER BY updated_at DESC
             LIMIT ?2"
        );
        let rows = sqlx::query_as::<_, DocumentRecord>(&sql)
            .bind(query)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }
}
