//! Files: tag-signature-defined aggregations across documents.
//!
//! Membership is computed by tag intersection (any matching tag), not by
//! explicit inserts alone; `refresh_file_membership` rebuilds the
//! junction from the current tag state before each summary generation.

use serde_json::json;

use crate::db::documents::DocumentRecord;
use crate::db::{now, Database, NewEvent};
use crate::normalize::{normalize_tag, tag_signature};
use crate::types::{EventCategory, FileStatus};

/// Columns selected for a full file record.
const FILE_COLUMNS: &str = "id, tags, tag_signature, document_count, first_document_date, \
     last_document_date, summary_text, summary_metadata, status, prompt_version, retry_count, \
     error_message, user_id, created_at, updated_at";

/// A row from the `files` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRecord {
    /// Auto-increment file id.
    pub id: i64,
    /// JSON array of the file's tags as given.
    pub tags: String,
    /// Sorted, lowercased, `:`-joined tag list; unique per user.
    pub tag_signature: String,
    /// Member count at last refresh.
    pub document_count: i64,
    /// Oldest member creation date.
    pub first_document_date: Option<String>,
    /// Newest member creation date.
    pub last_document_date: Option<String>,
    /// Generated summary text.
    pub summary_text: Option<String>,
    /// Generated summary metadata JSON.
    pub summary_metadata: Option<String>,
    /// Raw status column; use [`FileRecord::status`].
    pub status: String,
    /// Version of the file_summarizer prompt that produced the summary.
    pub prompt_version: Option<i64>,
    /// Retries consumed from the budget.
    pub retry_count: i64,
    /// Terminal failure reason, if any.
    pub error_message: Option<String>,
    /// Owning user.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl FileRecord {
    /// Parsed lifecycle status.
    pub fn status(&self) -> FileStatus {
        FileStatus::parse(&self.status).unwrap_or(FileStatus::Failed)
    }

    /// The tag list parsed from its JSON column.
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }
}

impl Database {
    /// Fetch one file by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn file(&self, id: i64) -> anyhow::Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1");
        let row = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Create a file for a tag list if its signature is new, then return
    /// the row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn create_or_get_file(
        &self,
        tags: &[String],
        user_id: &str,
    ) -> anyhow::Result<FileRecord> {
        let signature = tag_signature(tags);
        let tags_json = serde_json::to_string(tags)?;
        let ts = now();
        sqlx::query(
            "INSERT OR IGNORE INTO files (tags, tag_signature, status, user_id, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?4)",
        )
        .bind(&tags_json)
        .bind(&signature)
        .bind(user_id)
        .bind(&ts)
        .execute(self.pool())
        .await?;

        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE tag_signature = ?1 AND user_id = ?2"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(&signature)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| anyhow::anyhow!("file vanished after create: {signature}"))
    }

    /// Files currently in any of the given statuses, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn files_by_status(
        &self,
        statuses: &[FileStatus],
        limit: i64,
    ) -> anyhow::Result<Vec<FileRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE status IN ({placeholders})
             ORDER BY updated_at ASC
             LIMIT ?"
        );
        let mut query = sqlx::query_as::<_, FileRecord>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;
        Ok(rows)
    }

    /// Conditional file status transition with lifecycle event logging.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn transition_file(
        &self,
        id: i64,
        from: &[FileStatus],
        to: FileStatus,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE files SET status = ?, updated_at = ? WHERE id = ? AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now()).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let moved = query.execute(self.pool()).await?.rows_affected() > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "file_transition".to_owned(),
                file_id: Some(id),
                details: json!({ "to": to.as_str() }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Mark files containing any of the given normalized tags as
    /// outdated because membership changed.
    ///
    /// Only `generated` and `failed` files move; pending/outdated ones
    /// are already due for (re)generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn outdate_files_with_tag(&self, tag: &str, user_id: &str) -> anyhow::Result<u64> {
        let normalized = normalize_tag(tag);
        let candidates = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE user_id = ?1 AND status IN ('generated', 'failed')"
        ))
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        let mut outdated: u64 = 0;
        for file in candidates {
            let has_tag = file
                .tag_list()
                .iter()
                .any(|t| normalize_tag(t) == normalized);
            if has_tag
                && self
                    .transition_file(
                        file.id,
                        &[FileStatus::Generated, FileStatus::Failed],
                        FileStatus::Outdated,
                        user_id,
                    )
                    .await?
            {
                outdated = outdated.saturating_add(1);
            }
        }
        Ok(outdated)
    }

    /// Rebuild the file's membership from the current tag state.
    ///
    /// A document is a member when any of its tags matches any of the
    /// file's tags (normalized). Updates `document_count` and the
    /// first/last member dates; returns the member count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn refresh_file_membership(&self, file_id: i64) -> anyhow::Result<i64> {
        let Some(file) = self.file(file_id).await? else {
            anyhow::bail!("file not found: {file_id}");
        };
        let normalized: Vec<String> = file.tag_list().iter().map(|t| normalize_tag(t)).collect();

        sqlx::query("DELETE FROM file_documents WHERE file_id = ?1")
            .bind(file_id)
            .execute(self.pool())
            .await?;

        if !normalized.is_empty() {
            let placeholders = vec!["?"; normalized.len()].join(", ");
            let sql = format!(
                "INSERT OR IGNORE INTO file_documents (file_id, document_id, added_at)
                 SELECT DISTINCT ?, dt.document_id, ?
                 FROM document_tags dt
                 JOIN tags t ON t.id = dt.tag_id
                 WHERE t.tag_normalized IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(file_id).bind(now());
            for tag in &normalized {
                query = query.bind(tag);
            }
            query.execute(self.pool()).await?;
        }

        let stats: (i64, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(d.created_at), MAX(d.created_at)
             FROM file_documents fd
             JOIN documents d ON d.id = fd.document_id
             WHERE fd.file_id = ?1",
        )
        .bind(file_id)
        .fetch_one(self.pool())
        .await?;

        sqlx::query(
            "UPDATE files SET document_count = ?2, first_document_date = ?3,
                 last_document_date = ?4, updated_at = ?5
             WHERE id = ?1",
        )
        .bind(file_id)
        .bind(stats.0)
        .bind(&stats.1)
        .bind(&stats.2)
        .bind(now())
        .execute(self.pool())
        .await?;

        Ok(stats.0)
    }

    /// Member documents of a file, newest first, for summary aggregation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn file_member_documents(
        &self,
        file_id: i64,
    ) -> anyhow::Result<Vec<DocumentRecord>> {
        let rows = sqlx::query_as::<_, DocumentRecord>(
            "SELECT d.id, d.filename, d.status, d.document_type, d.extracted_text,
                    d.structured_data, d.structured_data_generic, d.summary, d.series_prompt_id,
                    d.extraction_method, d.ocr_confidence, d.page_count, d.retry_count,
                    d.error_message, d.source_folder, d.user_id, d.created_at, d.updated_at
             FROM documents d
             JOIN file_documents fd ON fd.document_id = d.id
             WHERE fd.file_id = ?1
             ORDER BY d.created_at DESC",
        )
        .bind(file_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Persist a generated summary and move to `generated`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn complete_file_summary(
        &self,
        id: i64,
        summary_text: &str,
        summary_metadata: &str,
        prompt_version: i64,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let moved = sqlx::query(
            "UPDATE files
             SET status = 'generated', summary_text = ?2, summary_metadata = ?3,
                 prompt_version = ?4, error_message = NULL, updated_at = ?5
             WHERE id = ?1 AND status IN ('generating', 'regenerating')",
        )
        .bind(id)
        .bind(summary_text)
        .bind(summary_metadata)
        .bind(prompt_version)
        .bind(now())
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if moved {
            self.log_event(&NewEvent {
                category: EventCategory::Lifecycle,
                event_type: "file_transition".to_owned(),
                file_id: Some(id),
                details: json!({ "to": "generated" }),
                user_id: user_id.to_owned(),
                ..NewEvent::default()
            })
            .await?;
        }
        Ok(moved)
    }

    /// Mark a file terminally failed with a reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn fail_file(&self, id: i64, error_message: &str, user_id: &str) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE files SET status = 'failed', error_message = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(error_message)
        .bind(now())
        .execute(self.pool())
        .await?;

        self.log_event(&NewEvent {
            category: EventCategory::Error,
            event_type: "file_failed".to_owned(),
            file_id: Some(id),
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
    pub async fn bump_file_retry(&self, id: i64) -> anyhow::Result<i64> {
        sqlx::query("UPDATE files SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now())
            .execute(self.pool())
            .await?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT retry_count FROM files WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(n,)| n).unwrap_or(0))
    }

    /// Files stuck in a generating state older than the cutoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn stale_in_flight_files(
        &self,
        cutoff_rfc3339: &str,
    ) -> anyhow::Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE status IN ('generating', 'regenerating') AND updated_at < ?1
             ORDER BY updated_at ASC"
        );
        let rows = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(cutoff_rfc3339)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Recovery reset: put the file back to `target` and charge one retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn reset_file_for_retry(
        &self,
        id: i64,
        target: FileStatus,
        user_id: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE files SET status = ?2, retry_count = retry_count + 1, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(target.as_str())
        .bind(now())
        .execute(self.pool())
        .await?;

        self.log_event(&NewEvent {
            category: EventCategory::Recovery,
            event_type: "file_reset".to_owned(),
            file_id: Some(id),
            details: json!({ "reset_to": target.as_str() }),
            user_id: user_id.to_owned(),
            ..NewEvent::default()
        })
        .await?;
        Ok(())
    }
}
