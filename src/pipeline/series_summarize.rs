//! Series summarize step: `filed → series_summarizing → series_summarized`.
//!
//! Every document in a series is extracted with the series's single
//! active prompt so field names never drift. The first document through
//! creates that prompt: under the per-series advisory lock, the LLM
//! infers a strict schema from the generic extraction, and the resulting
//! `series_summarizer` row (version 1, schema in `performance_metrics`)
//! becomes the series's active prompt exactly once.
//!
//! A schema mismatch in the re-extraction is a warning, not a lifecycle
//! failure: the extraction is persisted and the scorer is left to demand
//! improvement.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::{locks, DocumentRecord, NewEvent, NewPrompt, PromptRecord, SeriesRecord};
use crate::pipeline::{seed, LlmCall, PipelineContext, ScoreJob, ScorePurpose, StepError};
use crate::types::{DocumentStatus, EventCategory, PromptKind};

/// How much extracted text is sent for series extraction.
const TEXT_SAMPLE_CHARS: usize = 12000;

/// Run the series summarize step for one document.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, doc: &DocumentRecord) -> Result<(), StepError> {
    let Some(series) = ctx.db.series_for_document(&doc.id).await? else {
        // One-off document: nothing to extract against.
        let moved = ctx
            .db
            .transition_document(
                &doc.id,
                &[DocumentStatus::Filed],
                DocumentStatus::SeriesSummarized,
                &ctx.user_id,
            )
            .await?;
        return if moved { Ok(()) } else { Err(StepError::StateConflict) };
    };

    let claimed = ctx
        .db
        .transition_document(
            &doc.id,
            &[DocumentStatus::Filed],
            DocumentStatus::SeriesSummarizing,
            &ctx.user_id,
        )
        .await?;
    if !claimed {
        return Err(StepError::StateConflict);
    }

    let result = execute(ctx, doc, &series).await;
    if result.is_err() {
        // Net-zero transition on failure; the row stays dispatchable.
        if let Err(e) = ctx
            .db
            .transition_document(
                &doc.id,
                &[DocumentStatus::SeriesSummarizing],
                DocumentStatus::Filed,
                &ctx.user_id,
            )
            .await
        {
            warn!(document_id = %doc.id, error = %e, "failed to release series claim");
        }
    }
    result
}

async fn execute(
    ctx: &PipelineContext,
    doc: &DocumentRecord,
    series: &SeriesRecord,
) -> Result<(), StepError> {
    let prompt = match series.active_prompt_id {
        Some(id) => ctx
            .db
            .prompt(id)
            .await?
            .ok_or_else(|| StepError::Transient(format!("series prompt missing: {id}")))?,
        None => create_series_prompt(ctx, doc, series).await?,
    };

    let extraction = extract(ctx, doc, series, &prompt).await?;

    if ctx.cancelled() {
        return Err(StepError::Cancelled);
    }

    let moved = ctx
        .db
        .complete_series_summarize(&doc.id, &extraction.to_string(), prompt.id, &ctx.user_id)
        .await?;
    if !moved {
        return Err(StepError::StateConflict);
    }

    ctx.submit_score(ScoreJob {
        purpose: ScorePurpose::Series,
        document_id: doc.id.clone(),
        prompt_id: prompt.id,
        series_id: Some(series.id),
        output_json: extraction.to_string(),
    });

    info!(document_id = %doc.id, series_id = series.id, prompt_id = prompt.id, "series summarized");
    Ok(())
}

/// Run the series extraction for one document with the given prompt,
/// logging (but not failing on) schema mismatches.
///
/// Shared with the regeneration sweep, which must not score.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the caller's accounting.
pub(crate) async fn extract(
    ctx: &PipelineContext,
    doc: &DocumentRecord,
    series: &SeriesRecord,
    prompt: &PromptRecord,
) -> Result<Value, StepError> {
    let Some(text) = doc.extracted_text.as_deref() else {
        return Err(StepError::Fatal("series extraction without extracted text".to_owned()));
    };

    let schema = prompt.schema_definition();
    let mut user_text = String::new();
    if let Some(schema) = &schema {
        user_text.push_str("Required fields (reply with exactly these keys):\n");
        user_text.push_str(&schema.to_string());
        user_text.push_str("\n\n");
    }
    user_text.push_str("Document text:\n");
    user_text.extend(text.chars().take(TEXT_SAMPLE_CHARS));

    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: &prompt.prompt_text,
            user_text: &user_text,
            purpose: "series_extract",
            prompt_id: Some(prompt.id),
            document_id: Some(&doc.id),
            series_id: Some(series.id),
            ..LlmCall::default()
        })
        .await?;
    let extraction = reply.parsed_json()?;

    if let Some(schema) = &schema {
        let issues = schema_issues(&extraction, schema);
        if !issues.is_empty() {
            warn!(document_id = %doc.id, ?issues, "series extraction deviates from schema");
            ctx.db
                .log_event(&NewEvent {
                    category: EventCategory::Error,
                    event_type: "schema_mismatch".to_owned(),
                    document_id: Some(doc.id.clone()),
                    series_id: Some(series.id),
                    prompt_id: Some(prompt.id),
                    details: json!({ "issues": issues }),
                    user_id: ctx.user_id.clone(),
                    ..NewEvent::default()
                })
                .await?;
        }
    }

    Ok(extraction)
}

/// Create the series prompt under the per-series advisory lock.
async fn create_series_prompt(
    ctx: &PipelineContext,
    doc: &DocumentRecord,
    series: &SeriesRecord,
) -> Result<PromptRecord, StepError> {
    let key = locks::series_prompt_lock_key(series.id);
    ctx.lock(&key, &doc.id).await?;
    let result = create_series_prompt_locked(ctx, doc, series).await;
    ctx.unlock(&key, &doc.id).await;
    result
}

async fn create_series_prompt_locked(
    ctx: &PipelineContext,
    doc: &DocumentRecord,
    series: &SeriesRecord,
) -> Result<PromptRecord, StepError> {
    // Re-read inside the lock: a racer may have created the prompt
    // between our status check and acquisition.
    let fresh = ctx
        .db
        .series(series.id)
        .await?
        .ok_or_else(|| StepError::Transient(format!("series missing: {}", series.id)))?;
    if let Some(id) = fresh.active_prompt_id {
        return ctx
            .db
            .prompt(id)
            .await?
            .ok_or_else(|| StepError::Transient(format!("series prompt missing: {id}")));
    }

    let mut user_text = format!(
        "Series: {} / {} ({})\n\nGeneric extraction of one member:\n",
        series.entity,
        series.series_type,
        series.frequency.as_deref().unwrap_or("unknown cadence"),
    );
    user_text.push_str(doc.structured_data_generic.as_deref().unwrap_or("{}"));
    user_text.push_str("\n\nText sample:\n");
    if let Some(text) = doc.extracted_text.as_deref() {
        user_text.extend(text.chars().take(TEXT_SAMPLE_CHARS));
    }

    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: seed::SERIES_PROMPT_CREATOR,
            user_text: &user_text,
            purpose: "create_series_prompt",
            document_id: Some(&doc.id),
            series_id: Some(series.id),
            ..LlmCall::default()
        })
        .await?;
    let parsed = reply.parsed_json()?;

    let schema = parsed
        .get("schema_definition")
        .cloned()
        .filter(Value::is_object)
        .ok_or_else(|| StepError::Fatal("prompt creator reply missing schema_definition".to_owned()))?;
    let prompt_text = parsed
        .get("prompt_text")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| StepError::Fatal("prompt creator reply missing prompt_text".to_owned()))?;

    let prompt = ctx
        .db
        .seed_prompt(&NewPrompt {
            kind: PromptKind::SeriesSummarizer,
            document_type: series.id.to_string(),
            prompt_text: prompt_text.to_owned(),
            can_evolve: true,
            score_ceiling: Some(ctx.scoring.score_ceiling_default),
            regenerates_on_update: true,
            performance_metrics: json!({ "schema_definition": schema }),
            user_id: ctx.user_id.clone(),
        })
        .await?;

    ctx.db.set_initial_series_prompt(series.id, prompt.id).await?;

    ctx.db
        .log_event(&NewEvent {
            category: EventCategory::Evolution,
            event_type: "series_prompt_created".to_owned(),
            document_id: Some(doc.id.clone()),
            series_id: Some(series.id),
            prompt_id: Some(prompt.id),
            details: json!({ "version": prompt.version }),
            user_id: ctx.user_id.clone(),
            ..NewEvent::default()
        })
        .await?;

    info!(series_id = series.id, prompt_id = prompt.id, "series prompt created");
    Ok(prompt)
}

/// Compare an extraction against the declared schema.
///
/// Reports missing fields, wrong primitive types, and unknown keys
/// (which are preserved in the stored extraction, just flagged).
pub fn schema_issues(extraction: &Value, schema: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    let (Some(extraction), Some(schema)) = (extraction.as_object(), schema.as_object()) else {
        return vec!["extraction is not a JSON object".to_owned()];
    };

    for (field, declared) in schema {
        let declared_type = declared.as_str().unwrap_or("string");
        match extraction.get(field) {
            None => issues.push(format!("missing field: {field}")),
            Some(Value::Null) => {}
            Some(value) => {
                let matches = match declared_type {
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    _ => value.is_string(),
                };
                if !matches {
                    issues.push(format!("field {field} is not a {declared_type}"));
                }
            }
        }
    }
    for key in extraction.keys() {
        if !schema.contains_key(key) {
            issues.push(format!("unknown field: {key}"));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::testing::{context, FixedOcr, ScriptedLlm};

    const CREATOR_REPLY: &str = r#"{
        "schema_definition": {"total_due": "number", "due_date": "string", "kwh_used": "number"},
        "prompt_text": "Extract total_due, due_date, and kwh_used from this utility bill as JSON."
    }"#;
    const EXTRACT_REPLY: &str =
        r#"{"total_due": 42.0, "due_date": "2026-07-15", "kwh_used": 310}"#;

    async fn filed_doc_in_series(ctx: &PipelineContext, id: &str) -> (DocumentRecord, SeriesRecord) {
        ctx.db
            .register_document(id, "bill_x", "/f", "local")
            .await
            .expect("register");
        sqlx::query(
            "UPDATE documents SET status = 'filed', document_type = 'bill',
             extracted_text = 'PG&E statement, total $42',
             structured_data_generic = '{\"total_due\": 42}' WHERE id = ?1",
        )
        .bind(id)
        .execute(ctx.db.pool())
        .await
        .expect("seed fields");

        let series = ctx
            .db
            .create_or_get_series(
                "PG&E monthly bill",
                "Pacific Gas & Electric",
                "pacific gas & electric",
                "monthly_utility_bill",
                "monthly_utility_bill",
                Some("monthly"),
                "{}",
                "local",
            )
            .await
            .expect("series");
        ctx.db
            .assign_document_to_series(id, series.id)
            .await
            .expect("assign");
        let doc = ctx.db.document(id).await.expect("get").expect("exists");
        (doc, series)
    }

    #[tokio::test]
    async fn first_document_creates_prompt_then_extracts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(CREATOR_REPLY.to_owned()),
            Ok(EXTRACT_REPLY.to_owned()),
        ]));
        let (ctx, mut score_rx) =
            context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let (doc, series) = filed_doc_in_series(&ctx, "doc-1").await;

        run(&ctx, &doc).await.expect("series summarize");

        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::SeriesSummarized);

        let refreshed = ctx.db.series(series.id).await.expect("get").expect("exists");
        let prompt_id = refreshed.active_prompt_id.expect("prompt set");
        assert_eq!(after.series_prompt_id, Some(prompt_id));

        let prompt = ctx.db.prompt(prompt_id).await.expect("get").expect("exists");
        assert_eq!(prompt.kind(), Some(PromptKind::SeriesSummarizer));
        assert_eq!(prompt.document_type, series.id.to_string());
        assert_eq!(prompt.version, 1);
        assert!(prompt.regenerates());
        assert!(prompt.schema_definition().is_some());

        let extraction: Value =
            serde_json::from_str(after.structured_data.as_deref().expect("data")).expect("parse");
        assert_eq!(extraction["total_due"], 42.0);

        let job = score_rx.try_recv().expect("score job");
        assert_eq!(job.purpose, ScorePurpose::Series);
        assert_eq!(job.series_id, Some(series.id));
    }

    #[tokio::test]
    async fn second_document_reuses_the_prompt() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(CREATOR_REPLY.to_owned()),
            Ok(EXTRACT_REPLY.to_owned()),
            Ok(EXTRACT_REPLY.to_owned()),
        ]));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm.clone()).await;

        let (first, series) = filed_doc_in_series(&ctx, "doc-1").await;
        run(&ctx, &first).await.expect("first");

        // Second member of the same series.
        ctx.db
            .register_document("doc-2", "bill_y", "/f", "local")
            .await
            .expect("register");
        sqlx::query(
            "UPDATE documents SET status = 'filed', extracted_text = 'PG&E statement, total $55',
             structured_data_generic = '{}' WHERE id = 'doc-2'",
        )
        .execute(ctx.db.pool())
        .await
        .expect("seed");
        ctx.db
            .assign_document_to_series("doc-2", series.id)
            .await
            .expect("assign");
        let second = ctx.db.document("doc-2").await.expect("get").expect("exists");

        run(&ctx, &second).await.expect("second");

        // Only one creator call happened (3 scripted replies, 3 calls:
        // create + extract + extract).
        assert_eq!(llm.calls.lock().expect("calls").len(), 3);

        let a = ctx.db.document("doc-1").await.expect("get").expect("exists");
        let b = ctx.db.document("doc-2").await.expect("get").expect("exists");
        assert_eq!(a.series_prompt_id, b.series_prompt_id);
    }

    #[tokio::test]
    async fn schema_mismatch_persists_with_warning_event() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(CREATOR_REPLY.to_owned()),
            // total_due is a string and kwh_used is missing.
            Ok(r#"{"total_due": "42 dollars", "due_date": "2026-07-15", "surprise": 1}"#.to_owned()),
        ]));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let (doc, _series) = filed_doc_in_series(&ctx, "doc-1").await;

        run(&ctx, &doc).await.expect("mismatch is not fatal");

        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::SeriesSummarized);
        assert!(after
            .structured_data
            .as_deref()
            .expect("persisted anyway")
            .contains("surprise"));

        let events = ctx
            .db
            .events_for_document("doc-1", Some(EventCategory::Error), 10)
            .await
            .expect("events");
        assert!(events.iter().any(|e| e.event_type == "schema_mismatch"));
    }

    #[tokio::test]
    async fn document_without_series_skips_straight_through() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        ctx.db
            .register_document("doc-1", "f", "/f", "local")
            .await
            .expect("register");
        sqlx::query("UPDATE documents SET status = 'filed' WHERE id = 'doc-1'")
            .execute(ctx.db.pool())
            .await
            .expect("seed");
        let doc = ctx.db.document("doc-1").await.expect("get").expect("exists");

        run(&ctx, &doc).await.expect("skip");
        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::SeriesSummarized);
        assert!(after.structured_data.is_none());
    }

    #[test]
    fn schema_issue_reporting() {
        let schema = serde_json::json!({"total_due": "number", "due_date": "string"});
        let good = serde_json::json!({"total_due": 42.0, "due_date": "2026-07-15"});
        assert!(schema_issues(&good, &schema).is_empty());

        let bad = serde_json::json!({"total_due": "a lot", "extra": true});
        let issues = schema_issues(&bad, &schema);
        assert!(issues.iter().any(|i| i.contains("total_due")));
        assert!(issues.iter().any(|i| i.contains("missing field: due_date")));
        assert!(issues.iter().any(|i| i.contains("unknown field: extra")));

        // Nulls are tolerated: absence of a value, not a type error.
        let with_null = serde_json::json!({"total_due": null, "due_date": "x"});
        assert!(schema_issues(&with_null, &schema).is_empty());
    }
}
