//! Inbox scanner.
//!
//! The inbox is a directory of per-document folders, each carrying a
//! `meta.json` with the document id, capture time, ordered input files,
//! and source metadata. One sweep runs per orchestrator tick: valid new
//! folders become `pending` document rows (plus their user tags and a
//! metadata artifact copy); invalid folders are skipped with an event
//! and no row. A `.registered` marker makes repeat sweeps cheap, but the
//! DB unique id is what actually guarantees at-most-once registration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::db::{Database, NewEvent};
use crate::types::{EventCategory, TagOrigin};

/// Marker file dropped into a folder after successful registration.
const REGISTERED_MARKER: &str = ".registered";

/// `meta.json` as deposited by the capture side.
#[derive(Debug, Clone, Deserialize)]
pub struct InboxMeta {
    /// Document UUID.
    pub id: Uuid,
    /// Capture time (RFC 3339).
    pub created_at: String,
    /// Ordered input files.
    #[serde(default)]
    pub documents: Vec<InboxFile>,
    /// Source metadata.
    #[serde(default)]
    pub metadata: InboxMetadata,
}

/// One input file entry in `meta.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboxFile {
    /// File name within the folder.
    pub file: String,
    /// Capture type hint (e.g. "image", "text").
    #[serde(rename = "type", default)]
    pub file_type: String,
    /// Position within the document.
    #[serde(default)]
    pub order: i64,
}

/// The `metadata` object in `meta.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboxMetadata {
    /// Where the capture came from.
    #[serde(default)]
    pub source: String,
    /// User-supplied tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Scans the inbox directory and registers new documents.
#[derive(Debug, Clone)]
pub struct InboxScanner {
    db: Database,
    artifacts: ArtifactStore,
    inbox_dir: PathBuf,
    user_id: String,
}

impl InboxScanner {
    /// Create a scanner over `inbox_dir`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the inbox directory cannot be created.
    pub fn new(
        db: Database,
        artifacts: ArtifactStore,
        inbox_dir: &Path,
        user_id: &str,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(inbox_dir)
            .with_context(|| format!("failed to create inbox dir {}", inbox_dir.display()))?;
        Ok(Self {
            db,
            artifacts,
            inbox_dir: inbox_dir.to_path_buf(),
            user_id: user_id.to_owned(),
        })
    }

    /// One sweep over the inbox; returns how many documents were newly
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error only on database failure; malformed folders are
    /// logged and skipped.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let mut registered: usize = 0;

        let entries = std::fs::read_dir(&self.inbox_dir).with_context(|| {
            format!("failed to read inbox dir {}", self.inbox_dir.display())
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable inbox entry");
                    continue;
                }
            };
            let folder = entry.path();
            if !folder.is_dir() {
                continue;
            }
            if folder.join(REGISTERED_MARKER).exists() {
                continue;
            }

            if self.register_folder(&folder).await? {
                registered = registered.saturating_add(1);
            }
        }

        if registered > 0 {
            info!(count = registered, "registered new inbox documents");
        }
        Ok(registered)
    }

    /// Validate and register one folder. Returns whether a new document
    /// row was created.
    async fn register_folder(&self, folder: &Path) -> anyhow::Result<bool> {
        let folder_name = folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| folder.display().to_string());

        let meta = match self.read_meta(folder).await {
            Ok(meta) => meta,
            Err(reason) => {
                warn!(folder = %folder_name, %reason, "skipping invalid inbox folder");
                self.db
                    .log_event(&NewEvent {
                        category: EventCategory::Inbox,
                        event_type: "invalid_folder".to_owned(),
                        details: json!({ "folder": folder_name, "reason": reason.to_string() }),
                        user_id: self.user_id.clone(),
                        ..NewEvent::default()
                    })
                    .await?;
                return Ok(false);
            }
        };

        let doc_id = meta.id.to_string();
        let inserted = self
            .db
            .register_document(
                &doc_id,
                &folder_name,
                &folder.display().to_string(),
                &self.user_id,
            )
            .await?;

        if inserted {
            for tag in &meta.metadata.tags {
                self.db
                    .tag_document(&doc_id, tag, TagOrigin::User)
                    .await?;
            }

            if let Ok(raw) = tokio::fs::read_to_string(folder.join("meta.json")).await {
                if let Err(e) = self.artifacts.write_meta(&doc_id, &raw).await {
                    warn!(document_id = %doc_id, error = %e, "failed to copy inbox metadata artifact");
                }
            }

            self.db
                .log_event(&NewEvent {
                    category: EventCategory::Inbox,
                    event_type: "document_registered".to_owned(),
                    document_id: Some(doc_id.clone()),
                    details: json!({
                        "folder": folder_name,
                        "source": meta.metadata.source,
                        "tags": meta.metadata.tags,
                        "files": meta.documents.len(),
                    }),
                    user_id: self.user_id.clone(),
                    ..NewEvent::default()
                })
                .await?;
        }

        // Marker is written even for an already-known id so the next
        // sweep skips the folder without a DB round trip.
        if let Err(e) = std::fs::write(folder.join(REGISTERED_MARKER), doc_id.as_bytes()) {
            warn!(folder = %folder_name, error = %e, "failed to write registration marker");
        }

        Ok(inserted)
    }

    /// Parse and validate `meta.json` for a folder.
    async fn read_meta(&self, folder: &Path) -> anyhow::Result<InboxMeta> {
        let meta_path = folder.join("meta.json");
        let raw = tokio::fs::read_to_string(&meta_path)
            .await
            .map_err(|e| anyhow::anyhow!("missing or unreadable meta.json: {e}"))?;

        let meta: InboxMeta =
            serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("malformed meta.json: {e}"))?;

        chrono::DateTime::parse_from_rfc3339(&meta.created_at)
            .map_err(|e| anyhow::anyhow!("invalid created_at: {e}"))?;

        for doc in &meta.documents {
            let path = folder.join(&doc.file);
            if !path.is_file() {
                anyhow::bail!("listed file missing: {}", doc.file);
            }
        }

        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentStatus;

    async fn scanner(dir: &Path) -> (InboxScanner, Database) {
        let db = Database::open_in_memory().await.expect("db");
        let artifacts =
            ArtifactStore::new(&dir.join("artifacts")).expect("artifact store");
        let scanner = InboxScanner::new(db.clone(), artifacts, &dir.join("inbox"), "local")
            .expect("scanner");
        (scanner, db)
    }

    fn write_folder(inbox: &Path, name: &str, id: &str, tags: &[&str], files: &[(&str, &str)]) {
        let folder = inbox.join(name);
        std::fs::create_dir_all(&folder).expect("folder");
        for (file, content) in files {
            std::fs::write(folder.join(file), content).expect("file");
        }
        let file_entries: Vec<serde_json::Value> = files
            .iter()
            .enumerate()
            .map(|(i, (file, _))| json!({ "file": file, "type": "text", "order": i }))
            .collect();
        let meta = json!({
            "id": id,
            "created_at": "2026-07-01T10:00:00+00:00",
            "documents": file_entries,
            "metadata": { "source": "scanner", "tags": tags },
        });
        std::fs::write(folder.join("meta.json"), meta.to_string()).expect("meta");
    }

    #[tokio::test]
    async fn registers_valid_folder_with_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scanner, db) = scanner(dir.path()).await;
        write_folder(
            &dir.path().join("inbox"),
            "bill_x",
            "00000000-0000-0000-0000-000000000001",
            &["bill", "utilities"],
            &[("bill.txt", "Total due: $42")],
        );

        let registered = scanner.sweep().await.expect("sweep");
        assert_eq!(registered, 1);

        let doc = db
            .document("00000000-0000-0000-0000-000000000001")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(doc.status(), DocumentStatus::Pending);
        assert_eq!(doc.filename, "bill_x");

        let tags = db
            .document_tags("00000000-0000-0000-0000-000000000001")
            .await
            .expect("tags");
        let names: Vec<&str> = tags.iter().map(|t| t.tag_normalized.as_str()).collect();
        assert_eq!(names, vec!["bill", "utilities"]);
    }

    #[tokio::test]
    async fn repeat_sweep_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scanner, _db) = scanner(dir.path()).await;
        write_folder(
            &dir.path().join("inbox"),
            "bill_x",
            "00000000-0000-0000-0000-000000000002",
            &[],
            &[("bill.txt", "x")],
        );

        assert_eq!(scanner.sweep().await.expect("sweep"), 1);
        assert_eq!(scanner.sweep().await.expect("second sweep"), 0);
        assert!(dir
            .path()
            .join("inbox/bill_x")
            .join(REGISTERED_MARKER)
            .exists());
    }

    #[tokio::test]
    async fn invalid_folder_is_skipped_with_event_and_no_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scanner, db) = scanner(dir.path()).await;
        let inbox = dir.path().join("inbox");
        std::fs::create_dir_all(inbox.join("no_meta")).expect("folder");
        std::fs::write(inbox.join("no_meta/scan.txt"), "text").expect("file");

        assert_eq!(scanner.sweep().await.expect("sweep"), 0);

        let docs: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(docs.0, 0);
        assert_eq!(
            db.count_events(EventCategory::Inbox).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn listed_but_missing_file_invalidates_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scanner, db) = scanner(dir.path()).await;
        let inbox = dir.path().join("inbox");
        let folder = inbox.join("partial");
        std::fs::create_dir_all(&folder).expect("folder");
        let meta = json!({
            "id": "00000000-0000-0000-0000-000000000003",
            "created_at": "2026-07-01T10:00:00+00:00",
            "documents": [{ "file": "page1.txt", "type": "text", "order": 0 }],
            "metadata": { "source": "scanner", "tags": [] },
        });
        std::fs::write(folder.join("meta.json"), meta.to_string()).expect("meta");

        assert_eq!(scanner.sweep().await.expect("sweep"), 0);
        assert!(db
            .document("00000000-0000-0000-0000-000000000003")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn metadata_artifact_is_copied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (scanner, _db) = scanner(dir.path()).await;
        write_folder(
            &dir.path().join("inbox"),
            "bill_y",
            "00000000-0000-0000-0000-000000000004",
            &["bill"],
            &[("bill.txt", "x")],
        );

        scanner.sweep().await.expect("sweep");
        assert!(dir
            .path()
            .join("artifacts/00000000-0000-0000-0000-000000000004_meta.json")
            .exists());
    }
}
