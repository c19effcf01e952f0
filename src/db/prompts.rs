//! Versioned prompt families.
//!
//! A family is `(prompt_type, document_type, user_id)`; `version` is
//! monotonic within it and at most one row per family is active. For
//! `series_summarizer` rows the `document_type` column holds the series
//! id as a string, and `performance_metrics` carries the declared
//! `schema_definition`. Family mutations happen under the prompt-family
//! advisory lock; the unique `(type, document_type, version, user_id)`
//! constraint is the backstop.

use serde_json::json;

use crate::db::{now, Database};
use crate::types::PromptKind;

/// Columns selected for a full prompt record.
const PROMPT_COLUMNS: &str = "id, prompt_type, document_type, prompt_text, version, is_active, \
     performance_score, performance_metrics, can_evolve, score_ceiling, regenerates_on_update, \
     user_id, created_at, updated_at";

/// A row from the `prompts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PromptRecord {
    /// Auto-increment prompt id.
    pub id: i64,
    /// Prompt kind column.
    pub prompt_type: String,
    /// Family discriminator (document type, or series id as string).
    pub document_type: String,
    /// The instruction text sent to the LLM.
    pub prompt_text: String,
    /// Monotonic version within the family.
    pub version: i64,
    /// Whether this is the family's active row (0/1).
    pub is_active: i64,
    /// Running quality score in [0, 1].
    pub performance_score: Option<f64>,
    /// JSON metrics; holds `documents_processed` and, for series
    /// prompts, `schema_definition`.
    pub performance_metrics: String,
    /// Whether scoring may evolve this prompt (0/1).
    pub can_evolve: i64,
    /// Score at or above which evolution is suppressed.
    pub score_ceiling: Option<f64>,
    /// Whether evolution triggers regeneration of prior documents (0/1).
    pub regenerates_on_update: i64,
    /// Owning user.
    pub user_id: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl PromptRecord {
    /// Parsed prompt kind.
    pub fn kind(&self) -> Option<PromptKind> {
        PromptKind::parse(&self.prompt_type)
    }

    /// Whether this row is the family's active version.
    pub fn active(&self) -> bool {
        self.is_active != 0
    }

    /// Whether scoring may evolve this prompt.
    pub fn evolvable(&self) -> bool {
        self.can_evolve != 0
    }

    /// Whether evolution triggers regeneration of prior documents.
    pub fn regenerates(&self) -> bool {
        self.regenerates_on_update != 0
    }

    /// Parsed performance metrics.
    pub fn metrics(&self) -> serde_json::Value {
        serde_json::from_str(&self.performance_metrics).unwrap_or_else(|_| json!({}))
    }

    /// Documents scored against this prompt so far.
    pub fn documents_processed(&self) -> i64 {
        self.metrics()
            .get("documents_processed")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    }

    /// Declared extraction schema (series prompts only).
    pub fn schema_definition(&self) -> Option<serde_json::Value> {
        self.metrics().get("schema_definition").cloned()
    }
}

/// Parameters for inserting a prompt row.
#[derive(Debug, Clone)]
pub struct NewPrompt {
    /// Prompt kind.
    pub kind: PromptKind,
    /// Family discriminator (document type, or series id as string).
    pub document_type: String,
    /// The instruction text.
    pub prompt_text: String,
    /// Whether scoring may evolve this prompt.
    pub can_evolve: bool,
    /// Score at or above which evolution is suppressed.
    pub score_ceiling: Option<f64>,
    /// Whether evolution triggers regeneration.
    pub regenerates_on_update: bool,
    /// Initial metrics JSON.
    pub performance_metrics: serde_json::Value,
    /// Owning user.
    pub user_id: String,
}

impl Database {
    /// Fetch one prompt by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn prompt(&self, id: i64) -> anyhow::Result<Option<PromptRecord>> {
        let sql = format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = ?1");
        let row = sqlx::query_as::<_, PromptRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// The active prompt for a family, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn active_prompt(
        &self,
        kind: PromptKind,
        document_type: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<PromptRecord>> {
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts
             WHERE prompt_type = ?1 AND document_type = ?2 AND user_id = ?3 AND is_active = 1
             ORDER BY version DESC
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, PromptRecord>(&sql)
            .bind(kind.as_str())
            .bind(document_type)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Ensure a family has an active prompt, inserting version 1 with the
    /// given parameters when it does not.
    ///
    /// Returns the family's active row either way. `INSERT OR IGNORE` on
    /// `(type, document_type, 1, user)` keeps concurrent seeders from
    /// duplicating version 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn seed_prompt(&self, new: &NewPrompt) -> anyhow::Result<PromptRecord> {
        if let Some(active) = self
            .active_prompt(new.kind, &new.document_type, &new.user_id)
            .await?
        {
            return Ok(active);
        }

        let ts = now();
        sqlx::query(
            "INSERT OR IGNORE INTO prompts
                 (prompt_type, document_type, prompt_text, version, is_active,
                  performance_metrics, can_evolve, score_ceiling, regenerates_on_update,
                  user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        )
        .bind(new.kind.as_str())
        .bind(&new.document_type)
        .bind(&new.prompt_text)
        .bind(new.performance_metrics.to_string())
        .bind(i64::from(new.can_evolve))
        .bind(new.score_ceiling)
        .bind(i64::from(new.regenerates_on_update))
        .bind(&new.user_id)
        .bind(&ts)
        .execute(self.pool())
        .await?;

        self.active_prompt(new.kind, &new.document_type, &new.user_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "prompt family has no active row after seed: {}/{}",
                    new.kind,
                    new.document_type
                )
            })
    }

    /// Insert the next version of a family and make it the only active
    /// row. Caller must hold the family's advisory lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn insert_prompt_version(&self, new: &NewPrompt) -> anyhow::Result<PromptRecord> {
        let ts = now();

        sqlx::query(
            "UPDATE prompts SET is_active = 0, updated_at = ?4
             WHERE prompt_type = ?1 AND document_type = ?2 AND user_id = ?3 AND is_active = 1",
        )
        .bind(new.kind.as_str())
        .bind(&new.document_type)
        .bind(&new.user_id)
        .bind(&ts)
        .execute(self.pool())
        .await?;

        let next: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM prompts
             WHERE prompt_type = ?1 AND document_type = ?2 AND user_id = ?3",
        )
        .bind(new.kind.as_str())
        .bind(&new.document_type)
        .bind(&new.user_id)
        .fetch_one(self.pool())
        .await?;

        let result = sqlx::query(
            "INSERT INTO prompts
                 (prompt_type, document_type, prompt_text, version, is_active,
                  performance_metrics, can_evolve, score_ceiling, regenerates_on_update,
                  user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        )
        .bind(new.kind.as_str())
        .bind(&new.document_type)
        .bind(&new.prompt_text)
        .bind(next.0)
        .bind(new.performance_metrics.to_string())
        .bind(i64::from(new.can_evolve))
        .bind(new.score_ceiling)
        .bind(i64::from(new.regenerates_on_update))
        .bind(&new.user_id)
        .bind(&ts)
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        self.prompt(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("inserted prompt vanished: {id}"))
    }

    /// Fold one score into the prompt's running performance.
    ///
    /// Running mean over `documents_processed` samples; returns the
    /// updated record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database access fails.
    pub async fn record_prompt_score(
        &self,
        prompt_id: i64,
        score: f64,
    ) -> anyhow::Result<PromptRecord> {
        let Some(prompt) = self.prompt(prompt_id).await? else {
            anyhow::bail!("prompt not found: {prompt_id}");
        };

        let samples = prompt.documents_processed().saturating_add(1);
        let previous = prompt.performance_score.unwrap_or(score);
        let samples_f = u32::try_from(samples.min(i64::from(u32::MAX))).unwrap_or(u32::MAX);
        let running = previous + (score - previous) / f64::from(samples_f);

        let mut metrics = prompt.metrics();
        metrics["documents_processed"] = json!(samples);

        sqlx::query(
            "UPDATE prompts SET performance_score = ?2, performance_metrics = ?3, updated_at = ?4
             WHERE id = ?1",
        )
        .bind(prompt_id)
        .bind(running)
        .bind(metrics.to_string())
        .bind(now())
        .execute(self.pool())
        .await?;

        self.prompt(prompt_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("prompt vanished while scoring: {prompt_id}"))
    }

    /// Prompts for `view-prompts`: active rows by default, the full
    /// version history with `include_archived`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn list_prompts(
        &self,
        kind: Option<PromptKind>,
        include_archived: bool,
        user_id: &str,
    ) -> anyhow::Result<Vec<PromptRecord>> {
        let mut sql = format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE user_id = ?1");
        if !include_archived {
            sql.push_str(" AND is_active = 1");
        }
        if kind.is_some() {
            sql.push_str(" AND prompt_type = ?2");
        }
        sql.push_str(" ORDER BY prompt_type, document_type, version");

        let mut query = sqlx::query_as::<_, PromptRecord>(&sql).bind(user_id);
        if let Some(k) = kind {
            query = query.bind(k.as_str());
        }
        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Database {
        Database::open_in_memory().await.expect("in-memory db")
    }

    fn classifier_prompt() -> NewPrompt {
        NewPrompt {
            kind: PromptKind::Classifier,
            document_type: String::new(),
            prompt_text: "Classify the document.".to_owned(),
            can_evolve: true,
            score_ceiling: Some(0.95),
            regenerates_on_update: false,
            performance_metrics: json!({}),
            user_id: "local".to_owned(),
        }
    }

    #[tokio::test]
    async fn seed_inserts_once() {
        let db = db().await;
        let first = db.seed_prompt(&classifier_prompt()).await.expect("seed");
        assert_eq!(first.version, 1);
        assert!(first.active());

        let second = db.seed_prompt(&classifier_prompt()).await.expect("seed again");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn version_insert_keeps_one_active_row() {
        let db = db().await;
        db.seed_prompt(&classifier_prompt()).await.expect("seed");

        let mut evolved = classifier_prompt();
        evolved.prompt_text = "Classify the document, naming its issuer.".to_owned();
        let v2 = db.insert_prompt_version(&evolved).await.expect("insert v2");
        assert_eq!(v2.version, 2);
        assert!(v2.active());

        let all = db
            .list_prompts(Some(PromptKind::Classifier), true, "local")
            .await
            .expect("list");
        assert_eq!(all.len(), 2);
        let active: Vec<_> = all.iter().filter(|p| p.active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 2);
    }

    #[tokio::test]
    async fn score_recording_runs_a_mean() {
        let db = db().await;
        let prompt = db.seed_prompt(&classifier_prompt()).await.expect("seed");

        let after_first = db
            .record_prompt_score(prompt.id, 0.8)
            .await
            .expect("score");
        assert_eq!(after_first.documents_processed(), 1);
        assert!((after_first.performance_score.unwrap_or(0.0) - 0.8).abs() < 1e-9);

        let after_second = db
            .record_prompt_score(prompt.id, 0.6)
            .await
            .expect("score");
        assert_eq!(after_second.documents_processed(), 2);
        assert!((after_second.performance_score.unwrap_or(0.0) - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn series_prompt_carries_schema_definition() {
        let db = db().await;
        let new = NewPrompt {
            kind: PromptKind::SeriesSummarizer,
            document_type: "42".to_owned(),
            prompt_text: "Extract the utility bill fields.".to_owned(),
            can_evolve: true,
            score_ceiling: Some(0.95),
            regenerates_on_update: true,
            performance_metrics: json!({
                "schema_definition": {"total_due": "number", "due_date": "string"}
            }),
            user_id: "local".to_owned(),
        };
        let prompt = db.seed_prompt(&new).await.expect("seed");
        let schema = prompt.schema_definition().expect("schema");
        assert_eq!(schema["total_due"], "number");
        assert!(prompt.regenerates());
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_archival() {
        let db = db().await;
        db.seed_prompt(&classifier_prompt()).await.expect("seed");
        db.seed_prompt(&NewPrompt {
            kind: PromptKind::FileSummarizer,
            document_type: String::new(),
            prompt_text: "Summarize the file.".to_owned(),
            can_evolve: false,
            score_ceiling: None,
            regenerates_on_update: false,
            performance_metrics: json!({}),
            user_id: "local".to_owned(),
        })
        .await
        .expect("seed");
        db.insert_prompt_version(&classifier_prompt())
            .await
            .expect("v2");

        let active_classifiers = db
            .list_prompts(Some(PromptKind::Classifier), false, "local")
            .await
            .expect("list");
        assert_eq!(active_classifiers.len(), 1);
        assert_eq!(active_classifiers[0].version, 2);

        let everything = db.list_prompts(None, true, "local").await.expect("list");
        assert_eq!(everything.len(), 3);
    }
}
