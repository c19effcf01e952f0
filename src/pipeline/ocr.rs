//! OCR step: `pending → ocr_in_progress → ocr_completed`.
//!
//! Runs the OCR adapter under the textract semaphore and per-call
//! timeout, persists the text and block artifacts, and refuses to
//! complete on an empty result. On transient failure the row is put
//! back to `pending` so the net transition is zero.

use std::path::Path;

use tokio::time::timeout;
use tracing::info;

use crate::db::DocumentRecord;
use crate::pipeline::{PipelineContext, StepError};
use crate::types::DocumentStatus;

/// Run the OCR step for one document.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, doc: &DocumentRecord) -> Result<(), StepError> {
    let claimed = ctx
        .db
        .transition_document(
            &doc.id,
            &[DocumentStatus::Pending],
            DocumentStatus::OcrInProgress,
            &ctx.user_id,
        )
        .await?;
    if !claimed {
        return Err(StepError::StateConflict);
    }

    let outcome = {
        let permit = ctx
            .textract_slots
            .acquire()
            .await
            .map_err(|_| StepError::Cancelled)?;
        let result = timeout(
            ctx.orchestrator.ocr_timeout(),
            ctx.ocr.extract(Path::new(&doc.source_folder)),
        )
        .await;
        drop(permit);

        match result {
            Err(_) => {
                release(ctx, &doc.id).await;
                return Err(StepError::Transient(format!(
                    "OCR timed out after {:?}",
                    ctx.orchestrator.ocr_timeout()
                )));
            }
            Ok(Err(e)) => {
                // Retryable or fatal, the row goes back to pending; the
                // orchestrator decides whether a retry is charged.
                release(ctx, &doc.id).await;
                return Err(e.into());
            }
            Ok(Ok(outcome)) => outcome,
        }
    };

    if ctx.cancelled() {
        return Err(StepError::Cancelled);
    }

    if outcome.full_text.trim().is_empty() {
        release(ctx, &doc.id).await;
        return Err(StepError::Fatal("OCR produced no text".to_owned()));
    }

    ctx.artifacts.write_text(&doc.id, &outcome.full_text).await?;
    ctx.artifacts.write_blocks(&doc.id, &outcome).await?;

    let page_count = i64::try_from(outcome.document_count).unwrap_or(i64::MAX);
    let moved = ctx
        .db
        .complete_ocr(
            &doc.id,
            &outcome.full_text,
            outcome.avg_confidence,
            page_count,
            &ctx.user_id,
        )
        .await?;
    if !moved {
        return Err(StepError::StateConflict);
    }

    info!(document_id = %doc.id, pages = page_count, "OCR completed");
    Ok(())
}

/// Put a claimed row back to `pending`; recovery handles the rest if
/// this write also fails.
async fn release(ctx: &PipelineContext, doc_id: &str) {
    if let Err(e) = ctx
        .db
        .transition_document(
            doc_id,
            &[DocumentStatus::OcrInProgress],
            DocumentStatus::Pending,
            &ctx.user_id,
        )
        .await
    {
        tracing::warn!(document_id = %doc_id, error = %e, "failed to release OCR claim");
    }
}
