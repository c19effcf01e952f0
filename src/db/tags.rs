//! Tags and the document/tag junction.
//!
//! Tags are upserted on first reference under their normalized form;
//! `usage_count` counts associations, not upserts. Cascade on document
//! delete keeps the junction free of orphans.

use std::collections::BTreeMap;

use crate::db::{now, Database};
use crate::normalize::normalize_tag;
use crate::types::TagOrigin;

/// A row from the `tags` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TagRecord {
    /// Auto-increment tag id.
    pub id: i64,
    /// Display form as first seen.
    pub tag_name: String,
    /// Unique lowercase form.
    pub tag_normalized: String,
    /// Who created the tag.
    pub created_by: String,
    /// Optional grouping category.
    pub category: Option<String>,
    /// Number of document associations made.
    pub usage_count: i64,
    /// Timestamp of the latest association.
    pub last_used: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

impl Database {
    /// Create the tag if its normalized form is new; returns the tag id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn upsert_tag(
        &self,
        tag_name: &str,
        created_by: TagOrigin,
        category: Option<&str>,
    ) -> anyhow::Result<i64> {
        let normalized = normalize_tag(tag_name);
        sqlx::query(
            "INSERT INTO tags (tag_name, tag_normalized, created_by, category, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tag_normalized) DO NOTHING",
        )
        .bind(tag_name)
        .bind(&normalized)
        .bind(created_by.as_str())
        .bind(category)
        .bind(now())
        .execute(self.pool())
        .await?;

        let row: (i64,) = sqlx::query_as("SELECT id FROM tags WHERE tag_normalized = ?1")
            .bind(&normalized)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }

    /// Associate a tag with a document, upserting the tag first.
    ///
    /// The association is unique; repeats are no-ops and do not inflate
    /// `usage_count`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn tag_document(
        &self,
        document_id: &str,
        tag_name: &str,
        created_by: TagOrigin,
    ) -> anyhow::Result<i64> {
        let tag_id = self.upsert_tag(tag_name, created_by, None).await?;
        let ts = now();
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO document_tags (document_id, tag_id, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(document_id)
        .bind(tag_id)
        .bind(&ts)
        .execute(self.pool())
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(
                "UPDATE tags SET usage_count = usage_count + 1, last_used = ?2 WHERE id = ?1",
            )
            .bind(tag_id)
            .bind(&ts)
            .execute(self.pool())
            .await?;
        }
        Ok(tag_id)
    }

    /// All tags associated with one document.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn document_tags(&self, document_id: &str) -> anyhow::Result<Vec<TagRecord>> {
        let rows = sqlx::query_as::<_, TagRecord>(
            "SELECT t.id, t.tag_name, t.tag_normalized, t.created_by, t.category,
                    t.usage_count, t.last_used, t.created_at
             FROM tags t
             JOIN document_tags dt ON dt.tag_id = t.id
             WHERE dt.document_id = ?1
             ORDER BY t.tag_normalized ASC",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// The most common existing tag combinations across documents,
    /// excluding `series:` canonical tags, most frequent first.
    ///
    /// Injected into the classifier prompt so new documents converge on
    /// established tag vocabularies.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn top_tag_combinations(&self, limit: usize) -> anyhow::Result<Vec<(String, i64)>> {
        let pairs: Vec<(String, String)> = sqlx::query_as(
            "SELECT dt.document_id, t.tag_normalized
             FROM document_tags dt
             JOIN tags t ON t.id = dt.tag_id
             WHERE t.tag_normalized NOT LIKE 'series:%'
             ORDER BY dt.document_id, t.tag_normalized",
        )
        .fetch_all(self.pool())
        .await?;

        let mut per_document: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (document_id, tag) in pairs {
            per_document.entry(document_id).or_default().push(tag);
        }

        let mut combos: BTreeMap<String, i64> = BTreeMap::new();
        for tags in per_document.values() {
            let combo = tags.join(", ");
            let count = combos.entry(combo).or_insert(0);
            *count = count.saturating_add(1);
        }

        let mut ranked: Vec<(String, i64)> = combos.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
