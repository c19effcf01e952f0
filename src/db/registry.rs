//! Dynamic document-type registry and suggestions.
//!
//! The registry feeds the classifier's "known types" context. When the
//! classifier returns a type outside the registry, the classification is
//! still recorded and a suggestion row is filed for review; the registry
//! itself only grows through that review (or seeding).

use crate::db::{now, Database};

impl Database {
    /// Seed registry entries that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn seed_document_types(&self, type_names: &[&str]) -> anyhow::Result<()> {
        for name in type_names {
            sqlx::query(
                "INSERT OR IGNORE INTO document_types (type_name, created_at) VALUES (?1, ?2)",
            )
            .bind(name)
            .bind(now())
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    /// All known document types, alphabetical.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn document_types(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT type_name FROM document_types ORDER BY type_name ASC")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Whether a type is in the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn document_type_known(&self, type_name: &str) -> anyhow::Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM document_types WHERE type_name = ?1")
                .bind(type_name)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.is_some())
    }

    /// File a suggestion for a type the classifier invented.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn suggest_document_type(
        &self,
        type_name: &str,
        document_id: &str,
        reasoning: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO document_type_suggestions (type_name, document_id, reasoning, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(type_name)
        .bind(document_id)
        .bind(reasoning)
        .bind(now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeding_is_idempotent_and_sorted() {
        let db = Database::open_in_memory().await.expect("db");
        db.seed_document_types(&["receipt", "bill"])
            .await
            .expect("seed");
        db.seed_document_types(&["bill", "invoice"])
            .await
            .expect("seed again");

        let types = db.document_types().await.expect("list");
        assert_eq!(types, vec!["bill", "invoice", "receipt"]);
        assert!(db.document_type_known("bill").await.expect("known"));
        assert!(!db.document_type_known("menu").await.expect("known"));
    }

    #[tokio::test]
    async fn suggestions_are_recorded() {
        let db = Database::open_in_memory().await.expect("db");
        db.suggest_document_type("vehicle_registration", "doc-1", Some("looks like a DMV form"))
            .await
            .expect("suggest");

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM document_type_suggestions WHERE type_name = 'vehicle_registration'")
                .fetch_one(db.pool())
                .await
                .expect("count");
        assert_eq!(count.0, 1);
    }
}
