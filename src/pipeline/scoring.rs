//! Background quality scoring and prompt evolution.
//!
//! Scoring is fire-and-forget: steps submit a [`ScoreJob`] and move on.
//! A worker drains the queue, asks the LLM to grade the extraction
//! against the prompt that produced it, folds the score into the
//! prompt's running performance, and once the evolution gate opens it
//! inserts the next prompt version under the family lock. Scoring
//! failures are logged and swallowed; they never touch the lifecycle.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::{locks, NewEvent, NewPrompt, PromptRecord};
use crate::pipeline::{seed, LlmCall, PipelineContext, StepError};
use crate::types::{DocumentStatus, EventCategory, PromptKind};

/// Which extraction a score job grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorePurpose {
    /// Classifier output.
    Classification,
    /// Generic summarizer output.
    Summary,
    /// Series extraction output.
    Series,
}

impl ScorePurpose {
    fn event_label(self) -> &'static str {
        match self {
            Self::Classification => "score_classification",
            Self::Summary => "score_summary",
            Self::Series => "score_series",
        }
    }
}

/// One queued scoring task.
#[derive(Debug, Clone)]
pub struct ScoreJob {
    /// Which extraction is being graded.
    pub purpose: ScorePurpose,
    /// Document the output came from.
    pub document_id: String,
    /// Prompt that produced the output.
    pub prompt_id: i64,
    /// Series, for series extractions.
    pub series_id: Option<i64>,
    /// The output being graded (JSON text).
    pub output_json: String,
}

/// The scorer's parsed verdict.
#[derive(Debug, Clone)]
struct ScoreVerdict {
    score: f64,
    reasoning: String,
    improved_prompt: Option<String>,
}

fn parse_verdict(value: &Value) -> Option<ScoreVerdict> {
    let score = value.get("score").and_then(Value::as_f64)?;
    Some(ScoreVerdict {
        score: score.clamp(0.0, 1.0),
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        improved_prompt: value
            .get("improved_prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToOwned::to_owned),
    })
}

/// Drain the scoring queue until every sender is dropped.
///
/// Runs as one background task; the orchestrator joins it (with a
/// timeout) at shutdown so in-flight scores drain.
pub async fn run_worker(ctx: PipelineContext, mut rx: mpsc::Receiver<ScoreJob>) {
    while let Some(job) = rx.recv().await {
        if ctx.cancelled() {
            // Drain without side effects; shutdown wants the queue empty.
            ctx.score_backlog.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            continue;
        }
        if let Err(e) = handle_job(&ctx, &job).await {
            warn!(document_id = %job.document_id, prompt_id = job.prompt_id, error = %e, "scoring failed");
            let _ = ctx
                .db
                .log_event(&NewEvent {
                    category: EventCategory::Error,
                    event_type: "scoring_failed".to_owned(),
                    document_id: Some(job.document_id.clone()),
                    prompt_id: Some(job.prompt_id),
                    series_id: job.series_id,
                    details: json!({ "error": e.to_string() }),
                    user_id: ctx.user_id.clone(),
                    ..NewEvent::default()
                })
                .await;
        }
        ctx.score_backlog.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Score one job and evolve the prompt when the gate opens.
///
/// # Errors
///
/// Returns a [`StepError`]; the worker logs and swallows it.
pub async fn handle_job(ctx: &PipelineContext, job: &ScoreJob) -> Result<(), StepError> {
    let prompt = ctx
        .db
        .prompt(job.prompt_id)
        .await?
        .ok_or_else(|| StepError::Transient(format!("scored prompt missing: {}", job.prompt_id)))?;

    // Series scoring holds the document in its in-flight sub-state while
    // the LLM runs; a failed claim means the row moved on, which is fine.
    let claimed_series_state = job.purpose == ScorePurpose::Series
        && ctx
            .db
            .transition_document(
                &job.document_id,
                &[DocumentStatus::SeriesSummarized],
                DocumentStatus::SeriesScoring,
                &ctx.user_id,
            )
            .await?;

    let result = score_and_maybe_evolve(ctx, job, &prompt).await;

    if claimed_series_state {
        let _ = ctx
            .db
            .transition_document(
                &job.document_id,
                &[DocumentStatus::SeriesScoring],
                DocumentStatus::SeriesSummarized,
                &ctx.user_id,
            )
            .await;
    }
    result
}

async fn score_and_maybe_evolve(
    ctx: &PipelineContext,
    job: &ScoreJob,
    prompt: &PromptRecord,
) -> Result<(), StepError> {
    let mut user_text = String::from("Prompt under evaluation:\n");
    user_text.push_str(&prompt.prompt_text);
    user_text.push_str("\n\nOutput it produced:\n");
    user_text.push_str(&job.output_json);

    let reply = ctx
        .invoke_llm(LlmCall {
            prompt_text: seed::SCORER_PROMPT,
            user_text: &user_text,
            purpose: job.purpose.event_label(),
            prompt_id: Some(prompt.id),
            document_id: Some(&job.document_id),
            series_id: job.series_id,
            ..LlmCall::default()
        })
        .await?;
    let verdict = parse_verdict(&reply.parsed_json()?)
        .ok_or_else(|| StepError::Fatal("scorer reply missing score".to_owned()))?;

    let previous_score = prompt.performance_score;
    let updated = ctx.db.record_prompt_score(prompt.id, verdict.score).await?;

    ctx.db
        .log_event(&NewEvent {
            category: EventCategory::Scoring,
            event_type: job.purpose.event_label().to_owned(),
            document_id: Some(job.document_id.clone()),
            prompt_id: Some(prompt.id),
            series_id: job.series_id,
            details: json!({
                "score": verdict.score,
                "running_score": updated.performance_score,
                "documents_processed": updated.documents_processed(),
                "reasoning": verdict.reasoning,
            }),
            user_id: ctx.user_id.clone(),
            ..NewEvent::default()
        })
        .await?;

    // Mark the scored sub-state on the document (best effort; the row
    // may already have advanced).
    match job.purpose {
        ScorePurpose::Classification => {
            let _ = ctx
                .db
                .transition_document(
                    &job.document_id,
                    &[DocumentStatus::Classified],
                    DocumentStatus::ScoredClassification,
                    &ctx.user_id,
                )
                .await;
        }
        ScorePurpose::Summary => {
            let _ = ctx
                .db
                .transition_document(
                    &job.document_id,
                    &[DocumentStatus::Summarized],
                    DocumentStatus::ScoredSummary,
                    &ctx.user_id,
                )
                .await;
        }
        ScorePurpose::Series => {}
    }

    if should_evolve(ctx, &updated, previous_score, verdict.score) {
        if let Some(improved) = &verdict.improved_prompt {
            evolve(ctx, &updated, improved, job).await?;
        }
    }
    Ok(())
}

/// The evolution gate.
///
/// All four conditions must hold: the prompt is evolvable, its running
/// score sits below the ceiling, the new score clears the improvement
/// threshold over the prior running score, and enough documents have
/// been scored.
pub fn should_evolve(
    ctx: &PipelineContext,
    prompt: &PromptRecord,
    previous_score: Option<f64>,
    new_score: f64,
) -> bool {
    if !prompt.evolvable() || !prompt.active() {
        return false;
    }
    let Some(previous) = previous_score else {
        // First sample only establishes the baseline.
        return false;
    };
    if let Some(ceiling) = prompt.score_ceiling {
        if previous >= ceiling {
            return false;
        }
    }
    if new_score <= previous + ctx.scoring.prompt_update_threshold {
        return false;
    }
    prompt.documents_processed() >= ctx.scoring.min_documents_for_scoring
}

/// Insert the next prompt version under the family lock.
async fn evolve(
    ctx: &PipelineContext,
    prompt: &PromptRecord,
    improved_text: &str,
    job: &ScoreJob,
) -> Result<(), StepError> {
    let Some(kind) = prompt.kind() else {
        return Err(StepError::Fatal(format!("unknown prompt type: {}", prompt.prompt_type)));
    };

    let key = locks::prompt_family_lock_key(&prompt.prompt_type, &prompt.document_type);
    let holder = format!("scorer:{}", job.document_id);
    ctx.lock(&key, &holder).await?;
    let result = evolve_locked(ctx, prompt, kind, improved_text, job).await;
    ctx.unlock(&key, &holder).await;
    result
}

async fn evolve_locked(
    ctx: &PipelineContext,
    prompt: &PromptRecord,
    kind: PromptKind,
    improved_text: &str,
    job: &ScoreJob,
) -> Result<(), StepError> {
    // Re-check inside the lock: a racing scorer may have evolved the
    // family already, making our baseline stale.
    let current = ctx
        .db
        .active_prompt(kind, &prompt.document_type, &ctx.user_id)
        .await?;
    if current.map(|p| p.id) != Some(prompt.id) {
        return Ok(());
    }

    let evolved = ctx
        .db
        .insert_prompt_version(&NewPrompt {
            kind,
            document_type: prompt.document_type.clone(),
            prompt_text: improved_text.to_owned(),
            can_evolve: prompt.evolvable(),
            score_ceiling: prompt.score_ceiling,
            regenerates_on_update: prompt.regenerates(),
            performance_metrics: prompt.metrics(),
            user_id: ctx.user_id.clone(),
        })
        .await?;

    if kind == PromptKind::SeriesSummarizer {
        let series_id = prompt
            .document_type
            .parse::<i64>()
            .map_err(|_| StepError::Fatal(format!("series prompt with non-numeric series id: {}", prompt.document_type)))?;
        ctx.db.promote_series_prompt(series_id, evolved.id).await?;
    }

    ctx.db
        .log_event(&NewEvent {
            category: EventCategory::Evolution,
            event_type: "prompt_evolved".to_owned(),
            document_id: Some(job.document_id.clone()),
            prompt_id: Some(evolved.id),
            series_id: job.series_id,
            details: json!({
                "from_version": prompt.version,
                "to_version": evolved.version,
                "prompt_type": prompt.prompt_type,
            }),
            user_id: ctx.user_id.clone(),
            ..NewEvent::default()
        })
        .await?;

    info!(
        prompt_type = %prompt.prompt_type,
        document_type = %prompt.document_type,
        from = prompt.version,
        to = evolved.version,
        "prompt evolved"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::testing::{context, FixedOcr, ScriptedLlm};

    fn scorer_reply(score: f64, improved: Option<&str>) -> String {
        match improved {
            Some(text) => format!(
                r#"{{"score": {score}, "reasoning": "r", "improved_prompt": "{text}"}}"#
            ),
            None => format!(r#"{{"score": {score}, "reasoning": "r", "improved_prompt": null}}"#),
        }
    }

    async fn seeded_summarizer(ctx: &PipelineContext) -> PromptRecord {
        seed::summarizer_for_type(&ctx.db, &ctx.scoring, "bill", "local")
            .await
            .expect("summarizer")
    }

    async fn doc_in_status(ctx: &PipelineContext, id: &str, status: &str) {
        ctx.db
            .register_document(id, "f", "/f", "local")
            .await
            .expect("register");
        sqlx::query("UPDATE documents SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status)
            .execute(ctx.db.pool())
            .await
            .expect("status");
    }

    #[tokio::test]
    async fn scoring_updates_running_score_and_marks_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(&scorer_reply(0.8, None)));
        let (ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let prompt = seeded_summarizer(&ctx).await;
        doc_in_status(&ctx, "doc-1", "summarized").await;

        handle_job(
            &ctx,
            &ScoreJob {
                purpose: ScorePurpose::Summary,
                document_id: "doc-1".to_owned(),
                prompt_id: prompt.id,
                series_id: None,
                output_json: r#"{"total_due": 42}"#.to_owned(),
            },
        )
        .await
        .expect("score");

        let updated = ctx.db.prompt(prompt.id).await.expect("get").expect("exists");
        assert_eq!(updated.documents_processed(), 1);
        assert!((updated.performance_score.unwrap_or(0.0) - 0.8).abs() < 1e-9);

        let doc = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(doc.status(), DocumentStatus::ScoredSummary);

        assert_eq!(
            ctx.db.count_events(EventCategory::Scoring).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn evolution_gate_requires_all_conditions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut ctx, _rx) = context(
            tmp.path(),
            Arc::new(FixedOcr::with_text("x")),
            Arc::new(ScriptedLlm::new(vec![])),
        )
        .await;
        ctx.scoring.prompt_update_threshold = 0.05;
        ctx.scoring.min_documents_for_scoring = 5;
        let prompt = seeded_summarizer(&ctx).await;

        // Baseline 0.6 with enough samples.
        let mut seasoned = ctx.db.record_prompt_score(prompt.id, 0.6).await.expect("score");
        for _ in 0..5 {
            seasoned = ctx.db.record_prompt_score(prompt.id, 0.6).await.expect("score");
        }

        // Improvement clears the threshold.
        assert!(should_evolve(&ctx, &seasoned, Some(0.6), 0.75));
        // Too small an improvement.
        assert!(!should_evolve(&ctx, &seasoned, Some(0.6), 0.64));
        // No baseline yet.
        assert!(!should_evolve(&ctx, &seasoned, None, 0.99));
        // At the ceiling.
        assert!(!should_evolve(&ctx, &seasoned, Some(0.96), 0.99));

        // Not evolvable.
        let static_prompt = ctx
            .db
            .seed_prompt(&NewPrompt {
                kind: PromptKind::FileSummarizer,
                document_type: String::new(),
                prompt_text: "static".to_owned(),
                can_evolve: false,
                score_ceiling: None,
                regenerates_on_update: false,
                performance_metrics: json!({"documents_processed": 10}),
                user_id: "local".to_owned(),
            })
            .await
            .expect("seed");
        assert!(!should_evolve(&ctx, &static_prompt, Some(0.5), 0.9));

        // Too few samples.
        let fresh = ctx.db.prompt(prompt.id).await.expect("get").expect("exists");
        let mut few = fresh.clone();
        few.performance_metrics = json!({"documents_processed": 2}).to_string();
        assert!(!should_evolve(&ctx, &few, Some(0.5), 0.9));
    }

    #[tokio::test]
    async fn evolution_inserts_new_version_and_flags_series() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(&scorer_reply(
            0.9,
            Some("Extract the fields more carefully."),
        )));
        let (mut ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        ctx.scoring.prompt_update_threshold = 0.05;
        ctx.scoring.min_documents_for_scoring = 1;

        let series = ctx
            .db
            .create_or_get_series("t", "PG&E", "pg&e", "bill", "bill", None, "{}", "local")
            .await
            .expect("series");
        let prompt = ctx
            .db
            .seed_prompt(&NewPrompt {
                kind: PromptKind::SeriesSummarizer,
                document_type: series.id.to_string(),
                prompt_text: "v1".to_owned(),
                can_evolve: true,
                score_ceiling: Some(0.95),
                regenerates_on_update: true,
                performance_metrics: json!({"schema_definition": {"total_due": "number"}}),
                user_id: "local".to_owned(),
            })
            .await
            .expect("seed");
        ctx.db
            .set_initial_series_prompt(series.id, prompt.id)
            .await
            .expect("set");
        // Establish a low baseline the 0.9 score will clear.
        ctx.db.record_prompt_score(prompt.id, 0.5).await.expect("baseline");
        doc_in_status(&ctx, "doc-1", "series_summarized").await;

        handle_job(
            &ctx,
            &ScoreJob {
                purpose: ScorePurpose::Series,
                document_id: "doc-1".to_owned(),
                prompt_id: prompt.id,
                series_id: Some(series.id),
                output_json: "{}".to_owned(),
            },
        )
        .await
        .expect("score + evolve");

        let refreshed = ctx.db.series(series.id).await.expect("get").expect("exists");
        assert!(refreshed.needs_regeneration());
        let new_active = ctx
            .db
            .prompt(refreshed.active_prompt_id.expect("active"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(new_active.version, 2);
        assert_eq!(new_active.prompt_text, "Extract the fields more carefully.");
        // Schema definition rides along to the new version.
        assert!(new_active.schema_definition().is_some());

        // Old version is archived, exactly one active row in the family.
        let family = ctx
            .db
            .list_prompts(Some(PromptKind::SeriesSummarizer), true, "local")
            .await
            .expect("list");
        assert_eq!(family.iter().filter(|p| p.active()).count(), 1);

        // Document returned to series_summarized after the scoring hold.
        let doc = ctx.db.document("doc-1").await.expect("get").expect("exists");
        assert_eq!(doc.status(), DocumentStatus::SeriesSummarized);
    }

    #[tokio::test]
    async fn no_evolution_without_improved_prompt_text() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply(&scorer_reply(0.95, None)));
        let (mut ctx, _rx) = context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        ctx.scoring.prompt_update_threshold = 0.01;
        ctx.scoring.min_documents_for_scoring = 1;
        let prompt = seeded_summarizer(&ctx).await;
        ctx.db.record_prompt_score(prompt.id, 0.5).await.expect("baseline");
        doc_in_status(&ctx, "doc-1", "summarized").await;

        handle_job(
            &ctx,
            &ScoreJob {
                purpose: ScorePurpose::Summary,
                document_id: "doc-1".to_owned(),
                prompt_id: prompt.id,
                series_id: None,
                output_json: "{}".to_owned(),
            },
        )
        .await
        .expect("score");

        let family = ctx
            .db
            .list_prompts(Some(PromptKind::Summarizer), true, "local")
            .await
            .expect("list");
        assert_eq!(family.len(), 1, "no new version without improved text");
    }

    #[tokio::test]
    async fn worker_swallows_scoring_failures() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let llm = Arc::new(ScriptedLlm::with_reply("not json"));
        let (ctx, _unused_rx) =
            context(tmp.path(), Arc::new(FixedOcr::with_text("x")), llm).await;
        let prompt = seeded_summarizer(&ctx).await;
        doc_in_status(&ctx, "doc-1", "summarized").await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(ScoreJob {
            purpose: ScorePurpose::Summary,
            document_id: "doc-1".to_owned(),
            prompt_id: prompt.id,
            series_id: None,
            output_json: "{}".to_owned(),
        })
        .await
        .expect("send");
        drop(tx);

        // Must return (queue drained) rather than propagate the failure.
        run_worker(ctx.clone(), rx).await;

        let errors = ctx.db.count_events(EventCategory::Error).await.expect("count");
        assert_eq!(errors, 1);
    }
}
