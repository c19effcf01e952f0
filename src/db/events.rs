//! Append-only event log.
//!
//! Every state transition, LLM call, lock operation, recovery action, and
//! error lands here. Rows are never updated or deleted; `view-events`
//! reads them back for audit and debugging.

use crate::db::{now, Database};
use crate::types::EventCategory;

/// Parameters for appending one event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Event category (the `view-events --category` filter key).
    pub category: EventCategory,
    /// Short machine-readable label within the category.
    pub event_type: String,
    /// Related document, if any.
    pub document_id: Option<String>,
    /// Related series, if any.
    pub series_id: Option<i64>,
    /// Related file, if any.
    pub file_id: Option<i64>,
    /// Related prompt, if any.
    pub prompt_id: Option<i64>,
    /// Model that served a related LLM call.
    pub model_id: Option<String>,
    /// Prompt-side token count of a related LLM call.
    pub request_tokens: Option<i64>,
    /// Completion-side token count of a related LLM call.
    pub response_tokens: Option<i64>,
    /// Latency of a related LLM call.
    pub latency_ms: Option<i64>,
    /// Free-form JSON payload.
    pub details: serde_json::Value,
    /// Owning user.
    pub user_id: String,
}

impl Default for NewEvent {
    fn default() -> Self {
        Self {
            category: EventCategory::Lifecycle,
            event_type: String::new(),
            document_id: None,
            series_id: None,
            file_id: None,
            prompt_id: None,
            model_id: None,
            request_tokens: None,
            response_tokens: None,
            latency_ms: None,
            details: serde_json::json!({}),
            user_id: "local".to_owned(),
        }
    }
}

/// A row read back from the `events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRecord {
    /// Auto-increment row id.
    pub id: i64,
    /// Event category.
    pub category: String,
    /// Short label within the category.
    pub event_type: String,
    /// Related document, if any.
    pub document_id: Option<String>,
    /// Related series, if any.
    pub series_id: Option<i64>,
    /// Related file, if any.
    pub file_id: Option<i64>,
    /// Related prompt, if any.
    pub prompt_id: Option<i64>,
    /// Model that served a related LLM call.
    pub model_id: Option<String>,
    /// Prompt-side token count.
    pub request_tokens: Option<i64>,
    /// Completion-side token count.
    pub response_tokens: Option<i64>,
    /// LLM call latency.
    pub latency_ms: Option<i64>,
    /// Free-form JSON payload.
    pub details: String,
    /// Owning user.
    pub user_id: String,
    /// Append timestamp (RFC 3339).
    pub created_at: String,
}

const EVENT_COLUMNS: &str = "id, category, event_type, document_id, series_id, file_id, \
     prompt_id, model_id, request_tokens, response_tokens, latency_ms, details, user_id, created_at";

impl Database {
    /// Append one event row; returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn log_event(&self, event: &NewEvent) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO events (category, event_type, document_id, series_id, file_id, prompt_id,
                                 model_id, request_tokens, response_tokens, latency_ms, details,
                                 user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(event.category.as_str())
        .bind(&event.event_type)
        .bind(&event.document_id)
        .bind(event.series_id)
        .bind(event.file_id)
        .bind(event.prompt_id)
        .bind(&event.model_id)
        .bind(event.request_tokens)
        .bind(event.response_tokens)
        .bind(event.latency_ms)
        .bind(event.details.to_string())
        .bind(&event.user_id)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Events for one document, oldest first, optionally filtered by
    /// category.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn events_for_document(
        &self,
        document_id: &str,
        category: Option<EventCategory>,
        limit: i64,
    ) -> anyhow::Result<Vec<EventRecord>> {
        let rows = match category {
            Some(cat) => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE document_id = ?1 AND category = ?2
                     ORDER BY id ASC LIMIT ?3"
                );
                sqlx::query_as::<_, EventRecord>(&sql)
                    .bind(document_id)
                    .bind(cat.as_str())
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE document_id = ?1
                     ORDER BY id ASC LIMIT ?2"
                );
                sqlx::query_as::<_, EventRecord>(&sql)
                    .bind(document_id)
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows)
    }

    /// Count events in one category (used by invariant checks in tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn count_events(&self, category: EventCategory) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE category = ?1")
            .bind(category.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn db() -> Database {
        Database::open_in_memory().await.expect("in-memory db")
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let db = db().await;
        let id = db
            .log_event(&NewEvent {
                category: EventCategory::LlmRequest,
                event_type: "classify".to_owned(),
                document_id: Some("doc-1".to_owned()),
                model_id: Some("claude-sonnet-4-20250514".to_owned()),
                request_tokens: Some(812),
                response_tokens: Some(64),
                latency_ms: Some(950),
                details: json!({ "prompt_version": 1 }),
                ..NewEvent::default()
            })
            .await
            .expect("log");
        assert!(id > 0);

        let events = db
            .events_for_document("doc-1", None, 10)
            .await
            .expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, "llm_request");
        assert_eq!(events[0].request_tokens, Some(812));
        assert_eq!(events[0].response_tokens, Some(64));
        assert!(events[0].details.contains("prompt_version"));
    }

    #[tokio::test]
    async fn category_filter_applies() {
        let db = db().await;
        for category in [EventCategory::LlmRequest, EventCategory::Lock] {
            db.log_event(&NewEvent {
                category,
                event_type: "x".to_owned(),
                document_id: Some("doc-1".to_owned()),
                ..NewEvent::default()
            })
            .await
            .expect("log");
        }

        let locks = db
            .events_for_document("doc-1", Some(EventCategory::Lock), 10)
            .await
            .expect("read");
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].category, "lock");

        assert_eq!(
            db.count_events(EventCategory::LlmRequest)
                .await
                .expect("count"),
            1
        );
    }
}
