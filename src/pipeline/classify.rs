//! Classify step: `ocr_completed → classified`.
//!
//! Calls the active classifier prompt with two injected contexts: the
//! known document types and the most common existing tag combinations
//! (minus `series:` canonical tags). Applies the auto-tag rule (the
//! assigned type becomes a system tag) and records LLM-suggested tags.
//! An unknown type still classifies the document; it just also files a
//! suggestion row for review.

use serde_json::Value;
use tracing::info;

use crate::db::DocumentRecord;
use crate::pipeline::{LlmCall, PipelineContext, ScoreJob, ScorePurpose, StepError};
use crate::types::{PromptKind, TagOrigin};

/// How many tag combinations are shown to the classifier.
const TAG_COMBO_CONTEXT: usize = 15;

/// How much extracted text is sent for classification.
const TEXT_SAMPLE_CHARS: usize = 6000;

/// The classifier's parsed verdict.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Assigned (possibly new) document type.
    pub document_type: String,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
    /// One-sentence justification.
    pub reasoning: String,
    /// Suggested tags.
    pub tags: Vec<String>,
}

/// Parse the classifier's JSON reply.
///
/// # Errors
///
/// Returns [`StepError::Fatal`] when the reply has no usable
/// `document_type`; the same input will not parse better on retry.
pub fn parse_classification(value: &Value) -> Result<Classification, StepError> {
    let document_type = value
        .get("document_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StepError::Fatal("classifier reply missing document_type".to_owned()))?;

    let tags = value
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default();

    Ok(Classification {
        document_type: document_type.to_owned(),
        confidence: value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        tags,
    })
}

/// Run the classify step for one document.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, doc: &DocumentRecord) -> Result<(), StepError> {
    let Some(text) = doc.extracted_text.as_deref() else {
        return Err(StepError::Fatal("classify reached without extracted text".to_owned()));
    };

    let prompt = ctx
        .db
        .active_prompt(PromptKind::Classifier, "", &ctx.user_id)
        .await?
        .ok_or_else(|| StepError::Transient("no active classifier prompt".to_owned()))?;

    let known_types = ctx.db.document_types().await?;
    let combos = ctx.db.top_tag_combinations(TAG_COMBO_CONTEXT).await?;

    let mut user_text = String::new();
    user_text.push_str("Known document types:\n");
    for t in &known_types {
        user_text.push_str("- ");
        user_text.push_str(t);
        user_text.push('\n');
    }
    user_text.push_str("\nCommon tag combinations (count):\n");
    for (combo, count) in &combos {
        user_text.push_str(&format!("- [{combo}] ({count})\n"));
    }
    user_text.push_str("\nDocument text:\n");
    user_text.extend(text.chars().take(TEXT_SAMPLE_CHARS));

    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: &prompt.prompt_text,
            user_text: &user_text,
            purpose: "classify",
            prompt_id: Some(prompt.id),
            document_id: Some(&doc.id),
            ..LlmCall::default()
        })
        .await?;

    let verdict = parse_classification(&reply.parsed_json()?)?;

    if !ctx.db.document_type_known(&verdict.document_type).await? {
        ctx.db
            .suggest_document_type(&verdict.document_type, &doc.id, Some(&verdict.reasoning))
            .await?;
    }

    let moved = ctx
        .db
        .complete_classification(&doc.id, &verdict.document_type, &ctx.user_id)
        .await?;
    if !moved {
        return Err(StepError::StateConflict);
    }

    // Auto-tag rule: the assigned type is always a tag.
    let type_tag = verdict.document_type.to_lowercase();
    ctx.db
        .tag_document(&doc.id, &type_tag, TagOrigin::System)
        .await?;
    ctx.db.outdate_files_with_tag(&type_tag, &ctx.user_id).await?;

    for tag in &verdict.tags {
        ctx.db.tag_document(&doc.id, tag, TagOrigin::Llm).await?;
        ctx.db.outdate_files_with_tag(tag, &ctx.user_id).await?;
    }

    ctx.submit_score(ScoreJob {
        purpose: ScorePurpose::Classification,
        document_id: doc.id.clone(),
        prompt_id: prompt.id,
        series_id: None,
        output_json: reply.text,
    });

    info!(
        document_id = %doc.id,
        document_type = %verdict.document_type,
        confidence = verdict.confidence,
        "classified"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::seed;
    use crate::pipeline::testing::{context, FixedOcr, ScriptedLlm};
    use crate::types::DocumentStatus;

    async fn classified_ready_doc(ctx: &PipelineContext, id: &str) -> DocumentRecord {
        ctx.db
            .register_document(id, "bill_x", "/f", "local")
            .await
            .expect("register");
        sqlx::query(
            "UPDATE documents SET status = 'ocr_completed', extracted_text = 'PG&E bill, total due $42' WHERE id = ?1",
        )
        .bind(id)
        .execute(ctx.db.pool())
        .await
        .expect("seed text");
        ctx.db.document(id).await.expect("get").expect("exists")
    }

    #[tokio::test]
    async fn classifies_and_applies_auto_tag_rule() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(
            r#"{"document_type": "bill", "confidence": 0.92, "reasoning": "utility charges", "tags": ["utilities", "pge"]}"#,
        ));
        let (ctx, mut score_rx) =
            context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        seed::seed_baseline(&ctx.db, &ctx.scoring, "local")
            .await
            .expect("seed");
        let doc = classified_ready_doc(&ctx, "doc-1").await;

        run(&ctx, &doc).await.expect("classify");

        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::Classified);
        assert_eq!(after.document_type.as_deref(), Some("bill"));

        let tags = ctx.db.document_tags("doc-1").await.expect("tags");
        let names: Vec<&str> = tags.iter().map(|t| t.tag_normalized.as_str()).collect();
        assert_eq!(names, vec!["bill", "pge", "utilities"]);

        let job = score_rx.try_recv().expect("score job submitted");
        assert_eq!(job.purpose, ScorePurpose::Classification);
    }

    #[tokio::test]
    async fn unknown_type_files_a_suggestion_but_still_classifies() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(
            r#"{"document_type": "vehicle_registration", "confidence": 0.8, "reasoning": "DMV form", "tags": []}"#,
        ));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        seed::seed_baseline(&ctx.db, &ctx.scoring, "local")
            .await
            .expect("seed");
        let doc = classified_ready_doc(&ctx, "doc-1").await;

        run(&ctx, &doc).await.expect("classify");

        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.document_type.as_deref(), Some("vehicle_registration"));

        let suggestions: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM document_type_suggestions")
                .fetch_one(ctx.db.pool())
                .await
                .expect("count");
        assert_eq!(suggestions.0, 1);
    }

    #[tokio::test]
    async fn classifier_context_includes_types_and_combos() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(
            r#"{"document_type": "bill", "confidence": 1.0, "reasoning": "", "tags": []}"#,
        ));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm.clone()).await;
        seed::seed_baseline(&ctx.db, &ctx.scoring, "local")
            .await
            .expect("seed");

        // An existing tagged document shapes the combo context.
        ctx.db
            .register_document("prior", "f", "/f", "local")
            .await
            .expect("register");
        ctx.db
            .tag_document("prior", "bill", TagOrigin::User)
            .await
            .expect("tag");
        ctx.db
            .tag_document("prior", "series:pge", TagOrigin::System)
            .await
            .expect("tag");

        let doc = classified_ready_doc(&ctx, "doc-1").await;
        run(&ctx, &doc).await.expect("classify");

        let calls = llm.calls.lock().expect("calls");
        let (_, user_text) = &calls[0];
        assert!(user_text.contains("- bill\n"), "known types listed");
        assert!(user_text.contains("[bill]"), "combo listed");
        assert!(!user_text.contains("series:pge"), "series tags excluded");
    }

    #[tokio::test]
    async fn garbage_reply_is_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply("I cannot classify this."));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        seed::seed_baseline(&ctx.db, &ctx.scoring, "local")
            .await
            .expect("seed");
        let doc = classified_ready_doc(&ctx, "doc-1").await;

        let err = run(&ctx, &doc).await.expect_err("unparseable reply");
        assert!(matches!(err, StepError::Fatal(_)));

        // No transition happened; the row stays re-dispatchable.
        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::OcrCompleted);
    }
}
