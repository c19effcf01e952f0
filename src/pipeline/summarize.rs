//! Generic summarize step: `classified → summarized`.
//!
//! Runs the evolving per-type summarizer to produce the document's
//! `structured_data_generic` and short summary. The summarizer for a
//! type is created lazily on first use.

use serde_json::Value;
use tracing::info;

use crate::db::DocumentRecord;
use crate::pipeline::{seed, LlmCall, PipelineContext, ScoreJob, ScorePurpose, StepError};

/// How much extracted text is sent for extraction.
const TEXT_SAMPLE_CHARS: usize = 12000;

/// Run the summarize step for one document.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, doc: &DocumentRecord) -> Result<(), StepError> {
    let Some(text) = doc.extracted_text.as_deref() else {
        return Err(StepError::Fatal("summarize reached without extracted text".to_owned()));
    };
    let Some(document_type) = doc.document_type.as_deref() else {
        return Err(StepError::Fatal("summarize reached without document type".to_owned()));
    };

    let prompt =
        seed::summarizer_for_type(&ctx.db, &ctx.scoring, document_type, &ctx.user_id).await?;

    let user_text: String = text.chars().take(TEXT_SAMPLE_CHARS).collect();
    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: &prompt.prompt_text,
            user_text: &user_text,
            purpose: "summarize",
            prompt_id: Some(prompt.id),
            document_id: Some(&doc.id),
            ..LlmCall::default()
        })
        .await?;

    let parsed = reply.parsed_json()?;
    let summary = parsed
        .get("summary")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let data = parsed
        .get("data")
        .cloned()
        .ok_or_else(|| StepError::Fatal("summarizer reply missing data object".to_owned()))?;

    let moved = ctx
        .db
        .complete_summarize(&doc.id, &data.to_string(), &summary, &ctx.user_id)
        .await?;
    if !moved {
        return Err(StepError::StateConflict);
    }

    ctx.submit_score(ScoreJob {
        purpose: ScorePurpose::Summary,
        document_id: doc.id.clone(),
        prompt_id: prompt.id,
        series_id: None,
        output_json: data.to_string(),
    });

    info!(document_id = %doc.id, document_type, "summarized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::testing::{context, FixedOcr, ScriptedLlm};
    use crate::types::{DocumentStatus, ExtractionMethod, PromptKind};

    async fn summarize_ready_doc(ctx: &PipelineContext, id: &str) -> DocumentRecord {
        ctx.db
            .register_document(id, "bill_x", "/f", "local")
            .await
            .expect("register");
        sqlx::query(
            "UPDATE documents SET status = 'classified', document_type = 'bill',
             extracted_text = 'PG&E bill, total due $42, due July 15' WHERE id = ?1",
        )
        .bind(id)
        .execute(ctx.db.pool())
        .await
        .expect("seed fields");
        ctx.db.document(id).await.expect("get").expect("exists")
    }

    #[tokio::test]
    async fn writes_generic_extraction_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(
            r#"{"summary": "A $42 utility bill due July 15.", "data": {"total_due": 42.0, "due_date": "2026-07-15"}}"#,
        ));
        let (ctx, mut score_rx) =
            context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let doc = summarize_ready_doc(&ctx, "doc-1").await;

        run(&ctx, &doc).await.expect("summarize");

        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::Summarized);
        assert_eq!(
            after.extraction_method.as_deref(),
            Some(ExtractionMethod::Generic.as_str())
        );
        let data: serde_json::Value =
            serde_json::from_str(after.structured_data_generic.as_deref().expect("data"))
                .expect("parse");
        assert_eq!(data["total_due"], 42.0);
        assert!(after.summary.as_deref().unwrap_or("").contains("$42"));

        // The per-type summarizer now exists.
        let prompt = ctx
            .db
            .active_prompt(PromptKind::Summarizer, "bill", "local")
            .await
            .expect("get")
            .expect("lazily created");
        assert!(prompt.evolvable());

        let job = score_rx.try_recv().expect("score job");
        assert_eq!(job.purpose, ScorePurpose::Summary);
        assert_eq!(job.prompt_id, prompt.id);
    }

    #[tokio::test]
    async fn missing_data_object_is_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(r#"{"summary": "just words"}"#));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let doc = summarize_ready_doc(&ctx, "doc-1").await;

        let err = run(&ctx, &doc).await.expect_err("no data object");
        assert!(matches!(err, StepError::Fatal(_)));
        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::Classified);
    }

    #[tokio::test]
    async fn advances_from_scored_classification_too() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(
            r#"{"summary": "s", "data": {"k": 1}}"#,
        ));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let doc = summarize_ready_doc(&ctx, "doc-1").await;
        sqlx::query("UPDATE documents SET status = 'scored_classification' WHERE id = 'doc-1'")
            .execute(ctx.db.pool())
            .await
            .expect("force status");

        run(&ctx, &doc).await.expect("summarize");
        let after = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(after.status(), DocumentStatus::Summarized);
    }
}
