//! Stale-work recovery.
//!
//! Runs at startup and on a fixed period. Any document or file stuck in
//! an in-flight sub-state longer than `stale_timeout` was orphaned by a
//! crash or a hung adapter call: with retry budget left it is reset to
//! the prior state and charged one retry, otherwise it is failed with
//! "max retries exceeded".

use chrono::Utc;
use tracing::{info, warn};

use crate::db::Database;
use crate::types::{DocumentStatus, FileStatus};

/// Summary of one recovery sweep.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Documents reset for another attempt.
    pub documents_reset: Vec<String>,
    /// Documents failed with the budget exhausted.
    pub documents_failed: Vec<String>,
    /// Files reset for another attempt.
    pub files_reset: Vec<i64>,
    /// Files failed with the budget exhausted.
    pub files_failed: Vec<i64>,
}

impl RecoveryReport {
    /// Whether the sweep found nothing to do.
    pub fn is_clean(&self) -> bool {
        self.documents_reset.is_empty()
            && self.documents_failed.is_empty()
            && self.files_reset.is_empty()
            && self.files_failed.is_empty()
    }
}

/// Run one recovery sweep.
///
/// # Errors
///
/// Returns an error if the database access fails.
pub async fn recover(
    db: &Database,
    stale_timeout: std::time::Duration,
    max_retries: i64,
    user_id: &str,
) -> anyhow::Result<RecoveryReport> {
    let now = Utc::now();
    let cutoff = now
        .checked_sub_signed(chrono::Duration::seconds(
            i64::try_from(stale_timeout.as_secs()).unwrap_or(i64::MAX),
        ))
        .unwrap_or(now)
        .to_rfc3339();

    let mut report = RecoveryReport::default();

    for doc in db.stale_in_flight_documents(&cutoff).await? {
        let target = doc
            .status()
            .recovery_target()
            .unwrap_or(DocumentStatus::Pending);
        if doc.retry_count < max_retries {
            info!(document_id = %doc.id, from = %doc.status, to = %target, "recovering stale document");
            db.reset_document_for_retry(&doc.id, target, user_id)
                .await?;
            report.documents_reset.push(doc.id);
        } else {
            warn!(document_id = %doc.id, retries = doc.retry_count, "stale document out of retries");
            db.fail_document(&doc.id, "max retries exceeded", user_id)
                .await?;
            report.documents_failed.push(doc.id);
        }
    }

    for file in db.stale_in_flight_files(&cutoff).await? {
        let target = file.status().recovery_target().unwrap_or(FileStatus::Pending);
        if file.retry_count < max_retries {
            info!(file_id = file.id, from = %file.status, to = %target, "recovering stale file");
            db.reset_file_for_retry(file.id, target, user_id).await?;
            report.files_reset.push(file.id);
        } else {
            warn!(file_id = file.id, retries = file.retry_count, "stale file out of retries");
            db.fail_file(file.id, "max retries exceeded", user_id)
                .await?;
            report.files_failed.push(file.id);
        }
    }

    if !report.is_clean() {
        info!(
            documents_reset = report.documents_reset.len(),
            documents_failed = report.documents_failed.len(),
            files_reset = report.files_reset.len(),
            files_failed = report.files_failed.len(),
            "recovery sweep acted"
        );
    }
    Ok(report)
}
