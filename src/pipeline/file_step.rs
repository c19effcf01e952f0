//! File step: `summarized → filed`.
//!
//! Detects which recurring series (if any) the document belongs to,
//! creating the series under an advisory lock so concurrent detections
//! of the same new entity collapse onto one row. Assigns the canonical
//! `series:<slug>` tag and keeps the corresponding tag-signature file
//! up to date.
//!
//! Duplicate-series prevention is two-layered: the detector sees the
//! full existing catalog so it reuses canonical entity names, and the
//! normalized identity is resolved under the lock with a unique
//! constraint backstop.

use serde_json::Value;
use tracing::info;

use crate::db::{locks, DocumentRecord};
use crate::normalize::{normalize_entity, series_tag};
use crate::pipeline::{LlmCall, PipelineContext, StepError};
use crate::types::{PromptKind, TagOrigin};

/// How many catalog entries are shown to the detector.
const CATALOG_CONTEXT: i64 = 25;

/// How much extracted text is sent for detection.
const TEXT_SAMPLE_CHARS: usize = 4000;

/// The detector's parsed verdict.
#[derive(Debug, Clone)]
pub struct SeriesDetection {
    /// Canonical issuer, `None` for one-off documents.
    pub entity: Option<String>,
    /// Recurring pattern name.
    pub series_type: Option<String>,
    /// Cadence hint.
    pub frequency: Option<String>,
    /// Extra detector output.
    pub metadata: Value,
}

/// Parse the detector's JSON reply.
pub fn parse_detection(value: &Value) -> SeriesDetection {
    let as_clean_string = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "null")
            .map(ToOwned::to_owned)
    };
    SeriesDetection {
        entity: as_clean_string("entity"),
        series_type: as_clean_string("series_type"),
        frequency: as_clean_string("frequency"),
        metadata: value.get("metadata").cloned().unwrap_or(Value::Null),
    }
}

/// Run the file step for one document.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, doc: &DocumentRecord) -> Result<(), StepError> {
    let prompt = ctx
        .db
        .active_prompt(PromptKind::SeriesDetector, "", &ctx.user_id)
        .await?
        .ok_or_else(|| StepError::Transient("no active series_detector prompt".to_owned()))?;

    let catalog = ctx.db.series_catalog(&ctx.user_id, CATALOG_CONTEXT).await?;
    let mut user_text = String::from("Existing series (largest first):\n");
    if catalog.is_empty() {
        user_text.push_str("(none yet)\n");
    }
    for series in &catalog {
        user_text.push_str(&format!(
            "- entity: \"{}\", series_type: {}, frequency: {}, tag: {}, documents: {}\n",
            series.entity,
            series.series_type,
            series.frequency.as_deref().unwrap_or("unknown"),
            series_tag(&series.entity),
            series.document_count,
        ));
    }

    user_text.push_str("\nDocument type: ");
    user_text.push_str(doc.document_type.as_deref().unwrap_or("unknown"));
    if let Some(summary) = doc.summary.as_deref() {
        user_text.push_str("\nSummary: ");
        user_text.push_str(summary);
    }
    if let Some(data) = doc.structured_data_generic.as_deref() {
        user_text.push_str("\nExtracted data: ");
        user_text.push_str(data);
    }
    user_text.push_str("\n\nDocument text:\n");
    if let Some(text) = doc.extracted_text.as_deref() {
        user_text.extend(text.chars().take(TEXT_SAMPLE_CHARS));
    }

    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: &prompt.prompt_text,
            user_text: &user_text,
            purpose: "detect_series",
            prompt_id: Some(prompt.id),
            document_id: Some(&doc.id),
            ..LlmCall::default()
        })
        .await?;
    let detection = parse_detection(&reply.parsed_json()?);

    let (Some(entity), Some(series_type)) = (&detection.entity, &detection.series_type) else {
        // One-off document: filed without a series.
        if ctx.cancelled() {
            return Err(StepError::Cancelled);
        }
        if !ctx.db.complete_filing(&doc.id, &ctx.user_id).await? {
            return Err(StepError::StateConflict);
        }
        info!(document_id = %doc.id, "filed without series");
        return Ok(());
    };

    let entity_norm = normalize_entity(entity);
    let type_norm = normalize_entity(series_type);
    let lock_key = locks::series_create_lock_key(&entity_norm, &type_norm, &ctx.user_id);

    ctx.lock(&lock_key, &doc.id).await?;
    let created = async {
        let title = format!("{entity} {series_type}");
        ctx.db
            .create_or_get_series(
                &title,
                entity,
                &entity_norm,
                series_type,
                &type_norm,
                detection.frequency.as_deref(),
                &detection.metadata.to_string(),
                &ctx.user_id,
            )
            .await
    }
    .await;
    ctx.unlock(&lock_key, &doc.id).await;
    let series = created?;

    if ctx.cancelled() {
        return Err(StepError::Cancelled);
    }

    ctx.db.assign_document_to_series(&doc.id, series.id).await?;

    let canonical = series_tag(&series.entity);
    ctx.db
        .tag_document(&doc.id, &canonical, TagOrigin::System)
        .await?;

    // Keep the series's aggregation file in step with its membership.
    let file = ctx
        .db
        .create_or_get_file(&[canonical.clone()], &ctx.user_id)
        .await?;
    ctx.db
        .outdate_files_with_tag(&canonical, &ctx.user_id)
        .await?;

    if !ctx.db.complete_filing(&doc.id, &ctx.user_id).await? {
        return Err(StepError::StateConflict);
    }

    info!(
        document_id = %doc.id,
        series_id = series.id,
        file_id = file.id,
        entity = %series.entity,
        "filed into series"
    );
    Ok(())
}
