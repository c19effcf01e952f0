//! Finalize step: `series_summarized → completed`.
//!
//! The completion gate re-checks everything a `completed` document
//! promises: non-empty text, an assigned type, a generic extraction,
//! and, when the document belongs to a series with an active prompt,
//! a series extraction produced by exactly that prompt. A document whose
//! series prompt evolved mid-flight simply waits here until the
//! regeneration sweep catches it up.

use tracing::{debug, info};

use crate::db::DocumentRecord;
use crate::pipeline::{PipelineContext, StepError};
use crate::types::DocumentStatus;

/// Run the finalize step for one document.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, doc: &DocumentRecord) -> Result<(), StepError> {
    if doc
        .extracted_text
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .is_empty()
    {
        return Err(StepError::Fatal("completion without extracted text".to_owned()));
    }
    if doc.document_type.is_none() {
        return Err(StepError::Fatal("completion without document type".to_owned()));
    }
    if doc.structured_data_generic.is_none() {
        return Err(StepError::Fatal("completion without generic extraction".to_owned()));
    }

    if let Some(series) = ctx.db.series_for_document(&doc.id).await? {
        if let Some(active) = series.active_prompt_id {
            let current = doc.series_prompt_id == Some(active)
                && doc
                    .structured_data
                    .as_deref()
                    .map(|d| !d.trim().is_empty())
                    .unwrap_or(false);
            if !current {
                debug!(
                    document_id = %doc.id,
                    series_id = series.id,
                    "series extraction behind active prompt, deferring completion"
                );
                return Err(StepError::Transient(
                    "series extraction behind active prompt".to_owned(),
                ));
            }
        }
    }

    if ctx.cancelled() {
        return Err(StepError::Cancelled);
    }

    let moved = ctx
        .db
        .transition_document(
            &doc.id,
            &[DocumentStatus::SeriesSummarized],
            DocumentStatus::Completed,
            &ctx.user_id,
        )
        .await?;
    if !moved {
        return Err(StepError::StateConflict);
    }

    info!(document_id = %doc.id, "completed");
    Ok(())
}
