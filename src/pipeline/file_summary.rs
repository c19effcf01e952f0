//! File summary step: `pending|outdated → generating|regenerating →
//! generated|failed`.
//!
//! Rebuilds the file's membership from tag intersection, aggregates the
//! member documents newest first, and summarizes the corpus with the
//! static `file_summarizer` prompt. An empty file is completed without
//! an LLM call.

use serde_json::Value;
use tracing::info;

use crate::db::{DocumentRecord, FileRecord};
use crate::pipeline::{LlmCall, PipelineContext, StepError};
use crate::types::{FileStatus, PromptKind};

/// How much of each member document goes into the aggregate corpus.
const PER_DOCUMENT_CHARS: usize = 1500;

/// Run the file summary step for one file.
///
/// # Errors
///
/// Returns a [`StepError`] kind for the orchestrator's retry accounting.
pub async fn run(ctx: &PipelineContext, file: &FileRecord) -> Result<(), StepError> {
    let (from, working) = match file.status() {
        FileStatus::Pending => (FileStatus::Pending, FileStatus::Generating),
        FileStatus::Outdated => (FileStatus::Outdated, FileStatus::Regenerating),
        _ => return Err(StepError::StateConflict),
    };

    let claimed = ctx
        .db
        .transition_file(file.id, &[from], working, &ctx.user_id)
        .await?;
    if !claimed {
        return Err(StepError::StateConflict);
    }

    let result = execute(ctx, file).await;
    if result.is_err() {
        if let Err(e) = ctx
            .db
            .transition_file(file.id, &[working], from, &ctx.user_id)
            .await
        {
            tracing::warn!(file_id = file.id, error = %e, "failed to release file claim");
        }
    }
    result
}

async fn execute(ctx: &PipelineContext, file: &FileRecord) -> Result<(), StepError> {
    let member_count = ctx.db.refresh_file_membership(file.id).await?;
    let members = ctx.db.file_member_documents(file.id).await?;

    if members.is_empty() {
        let moved = ctx
            .db
            .complete_file_summary(
                file.id,
                "No documents in this file yet.",
                &serde_json::json!({ "document_count": 0 }).to_string(),
                0,
                &ctx.user_id,
            )
            .await?;
        return if moved { Ok(()) } else { Err(StepError::StateConflict) };
    }

    let prompt = ctx
        .db
        .active_prompt(PromptKind::FileSummarizer, "", &ctx.user_id)
        .await?
        .ok_or_else(|| StepError::Transient("no active file_summarizer prompt".to_owned()))?;

    let mut user_text = format!(
        "File tags: {}\nDocuments ({member_count}, newest first):\n\n",
        file.tag_list().join(", ")
    );
    for doc in &members {
        user_text.push_str(&member_entry(doc));
    }

    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: &prompt.prompt_text,
            user_text: &user_text,
            purpose: "file_summary",
            prompt_id: Some(prompt.id),
            file_id: Some(file.id),
            ..LlmCall::default()
        })
        .await?;
    let parsed = reply.parsed_json()?;

    let summary = parsed
        .get("summary")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| StepError::Fatal("file summarizer reply missing summary".to_owned()))?;
    let metadata = parsed
        .get("metadata")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    if ctx.cancelled() {
        return Err(StepError::Cancelled);
    }

    let moved = ctx
        .db
        .complete_file_summary(
            file.id,
            summary,
            &metadata.to_string(),
            prompt.version,
            &ctx.user_id,
        )
        .await?;
    if !moved {
        return Err(StepError::StateConflict);
    }

    info!(file_id = file.id, documents = member_count, "file summary generated");
    Ok(())
}

/// One member document's contribution to the aggregate corpus.
fn member_entry(doc: &DocumentRecord) -> String {
    let mut entry = format!(
        "--- {} ({}, {})\n",
        doc.filename,
        doc.document_type.as_deref().unwrap_or("untyped"),
        doc.created_at,
    );
    if let Some(summary) = doc.summary.as_deref() {
        entry.push_str(summary);
        entry.push('\n');
    }
    if let Some(data) = doc.structured_data.as_deref().or(doc.structured_data_generic.as_deref()) {
        entry.push_str(data);
        entry.push('\n');
    } else if let Some(text) = doc.extracted_text.as_deref() {
        entry.extend(text.chars().take(PER_DOCUMENT_CHARS));
        entry.push('\n');
    }
    entry.push('\n');
    entry
}
