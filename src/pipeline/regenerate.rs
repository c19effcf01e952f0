//! Series regeneration worker.
//!
//! When a series prompt evolves, every member document extracted with an
//! older version is re-extracted with the new active prompt. Scoring is
//! deliberately NOT invoked here: scoring regenerated output could
//! trigger another evolution and recurse. The pending flag clears only
//! once every member is current.

use serde_json::json;
use tracing::{info, warn};

use crate::db::{NewEvent, SeriesRecord};
use crate::pipeline::{series_summarize, PipelineContext, StepError};
use crate::types::EventCategory;

/// Run one regeneration sweep over every flagged series; returns how
/// many documents were realigned.
///
/// # Errors
///
/// Returns an error only on database failure; per-document extraction
/// failures leave the flag set for the next sweep.
pub async fn run_sweep(ctx: &PipelineContext) -> anyhow::Result<usize> {
    let mut total: usize = 0;
    let pending = ctx.db.series_pending_regeneration(&ctx.user_id).await?;
    for series in pending {
        if ctx.cancelled() {
            break;
        }
        match regenerate_series(ctx, &series).await {
            Ok(n) => total = total.saturating_add(n),
            Err(e) => {
                warn!(series_id = series.id, error = %e, "regeneration sweep incomplete");
            }
        }
    }
    Ok(total)
}

/// Bring every member of one series up to its active prompt; returns
/// how many documents were realigned.
async fn regenerate_series(
    ctx: &PipelineContext,
    series: &SeriesRecord,
) -> anyhow::Result<usize> {
    let Some(prompt_id) = series.active_prompt_id else {
        // Flag without a prompt is unsatisfiable; clear it.
        ctx.db.clear_regeneration_pending(series.id).await?;
        return Ok(0);
    };
    let Some(prompt) = ctx.db.prompt(prompt_id).await? else {
        anyhow::bail!("active prompt missing: {prompt_id}");
    };

    let behind = ctx
        .db
        .series_documents_behind_prompt(series.id, prompt_id)
        .await?;
    let total = behind.len();
    let mut regenerated: usize = 0;

    for doc in &behind {
        if ctx.cancelled() {
            break;
        }
        match series_summarize::extract(ctx, doc, series, &prompt).await {
            Ok(extraction) => {
                ctx.db
                    .update_series_extraction(&doc.id, &extraction.to_string(), prompt_id)
                    .await?;
                regenerated = regenerated.saturating_add(1);
            }
            Err(StepError::Cancelled) => break,
            Err(e) => {
                warn!(document_id = %doc.id, error = %e, "regeneration extraction failed");
            }
        }
    }

    let remaining = ctx
        .db
        .series_documents_behind_prompt(series.id, prompt_id)
        .await?;
    let done = remaining.is_empty();
    if done {
        ctx.db.clear_regeneration_pending(series.id).await?;
    }

    ctx.db
        .log_event(&NewEvent {
            category: EventCategory::Regeneration,
            event_type: if done {
                "series_regenerated".to_owned()
            } else {
                "series_regeneration_partial".to_owned()
            },
            series_id: Some(series.id),
            prompt_id: Some(prompt_id),
            details: json!({
                "documents": total,
                "regenerated": regenerated,
                "remaining": remaining.len(),
            }),
            user_id: ctx.user_id.clone(),
            ..NewEvent::default()
        })
        .await?;

    info!(
        series_id = series.id,
        regenerated,
        remaining = remaining.len(),
        "regeneration sweep"
    );
    Ok(regenerated)
}
