//! Step functions and the machinery they share.
//!
//! Each lifecycle step takes a document (or file) row, performs exactly
//! one transition, and reports failure as a [`StepError`] kind that the
//! orchestrator maps onto retry accounting. Steps never loop or retry
//! internally.
//!
//! Submodules:
//! - [`ocr`]: `pending → ocr_in_progress → ocr_completed`
//! - [`classify`]: `ocr_completed → classified`
//! - [`summarize`]: `classified → summarized` (generic extraction)
//! - [`file_step`]: `summarized → filed` (series detection, tagging)
//! - [`series_summarize`]: `filed → series_summarizing → series_summarized`
//! - [`finalize`]: `series_summarized → completed` (invariant gate)
//! - [`scoring`]: background quality scoring and prompt evolution
//! - [`regenerate`]: series regeneration sweeps
//! - [`file_summary`]: file aggregation summaries
//! - [`seed`]: baseline prompt texts and the document-type registry

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;

use crate::adapters::{AdapterError, LlmAdapter, LlmOptions, LlmReply, OcrAdapter};
use crate::artifacts::ArtifactStore;
use crate::config::{OrchestratorConfig, ScoringConfig};
use crate::db::{Database, NewEvent};
use crate::types::EventCategory;

pub mod classify;
pub mod file_step;
pub mod file_summary;
pub mod finalize;
pub mod ocr;
pub mod regenerate;
pub mod scoring;
pub mod seed;
pub mod series_summarize;
pub mod summarize;

pub use scoring::{ScoreJob, ScorePurpose};

// ── Errors ──────────────────────────────────────────────────────

/// How a step failed, which decides the orchestrator's response.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Transient failure (network, throttle, timeout, DB hiccup). The
    /// row is left re-dispatchable; no retry is charged.
    #[error("transient: {0}")]
    Transient(String),
    /// Permanent failure for this attempt. One retry is charged; the
    /// budget decides between another attempt and `failed`.
    #[error("fatal: {0}")]
    Fatal(String),
    /// An advisory lock could not be acquired in time; try next tick.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// Another worker advanced the row first; nothing to do.
    #[error("state conflict")]
    StateConflict,
    /// Shutdown was requested before the result write.
    #[error("cancelled")]
    Cancelled,
}

impl From<AdapterError> for StepError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Retryable(msg) => StepError::Transient(msg),
            AdapterError::Fatal(msg) => StepError::Fatal(msg),
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        // Data-layer failures are worth another tick, not a retry charge.
        StepError::Transient(e.to_string())
    }
}

// ── Shared context ──────────────────────────────────────────────

/// Everything a step function needs, cheaply cloneable per task.
#[derive(Clone)]
pub struct PipelineContext {
    /// Data access layer.
    pub db: Database,
    /// OCR adapter.
    pub ocr: Arc<dyn OcrAdapter>,
    /// LLM adapter.
    pub llm: Arc<dyn LlmAdapter>,
    /// Artifact writer.
    pub artifacts: ArtifactStore,
    /// Cap on concurrent OCR adapter calls.
    pub textract_slots: Arc<Semaphore>,
    /// Cap on concurrent LLM adapter calls.
    pub bedrock_slots: Arc<Semaphore>,
    /// Orchestrator knobs (timeouts, retry budget).
    pub orchestrator: OrchestratorConfig,
    /// Scoring and evolution knobs.
    pub scoring: ScoringConfig,
    /// Owner of every row this process writes.
    pub user_id: String,
    /// Shutdown flag; `true` once shutdown was requested.
    pub shutdown: watch::Receiver<bool>,
    /// Queue feeding the background scoring workers.
    pub score_tx: mpsc::Sender<ScoreJob>,
    /// Scoring jobs submitted but not yet finished; lets `--once` wait
    /// for background scoring before declaring the pipeline quiescent.
    pub score_backlog: Arc<AtomicI64>,
}

/// One LLM invocation with the references the event log wants.
#[derive(Debug, Clone, Default)]
pub struct LlmCall<'a> {
    /// System instruction.
    pub prompt_text: &'a str,
    /// User content.
    pub user_text: &'a str,
    /// Event label, e.g. `classify`, `series_extract`, `score_summary`.
    pub purpose: &'a str,
    /// Prompt row that produced `prompt_text`, if any.
    pub prompt_id: Option<i64>,
    /// Related document.
    pub document_id: Option<&'a str>,
    /// Related series.
    pub series_id: Option<i64>,
    /// Related file.
    pub file_id: Option<i64>,
}

impl PipelineContext {
    /// Whether shutdown has been requested.
    pub fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run one LLM call under the bedrock semaphore and per-call
    /// timeout, logging exactly one `llm_request` event on success.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Cancelled`] when shutdown was requested
    /// before the result could be used, [`StepError::Transient`] on
    /// timeout or retryable adapter failure, and [`StepError::Fatal`]
    /// on permanent adapter failure.
    pub async fn invoke_llm(&self, call: LlmCall<'_>) -> Result<LlmReply, StepError> {
        if self.cancelled() {
            return Err(StepError::Cancelled);
        }

        let permit = self
            .bedrock_slots
            .acquire()
            .await
            .map_err(|_| StepError::Cancelled)?;

        let options = LlmOptions {
            max_tokens: 4096,
            expect_json: true,
        };
        let result = timeout(
            self.orchestrator.llm_timeout(),
            self.llm.invoke(call.prompt_text, call.user_text, &options),
        )
        .await;
        drop(permit);

        let reply = match result {
            Err(_) => {
                return Err(StepError::Transient(format!(
                    "LLM call timed out after {:?}",
                    self.orchestrator.llm_timeout()
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(reply)) => reply,
        };

        self.db
            .log_event(&NewEvent {
                category: EventCategory::LlmRequest,
                event_type: call.purpose.to_owned(),
                document_id: call.document_id.map(ToOwned::to_owned),
                series_id: call.series_id,
                file_id: call.file_id,
                prompt_id: call.prompt_id,
                model_id: Some(reply.model_id.clone()),
                request_tokens: Some(reply.request_tokens),
                response_tokens: Some(reply.response_tokens),
                latency_ms: Some(reply.latency_ms),
                details: json!({}),
                user_id: self.user_id.clone(),
            })
            .await?;

        if self.cancelled() {
            return Err(StepError::Cancelled);
        }
        Ok(reply)
    }

    /// Submit a scoring job to the background worker set.
    ///
    /// Best effort: a full queue drops the job with a warning rather
    /// than blocking the lifecycle.
    pub fn submit_score(&self, job: ScoreJob) {
        match self.score_tx.try_send(job) {
            Ok(()) => {
                self.score_backlog.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!(error = %e, "scoring queue full, dropping score job");
            }
        }
    }

    /// Scoring jobs still queued or in flight.
    pub fn score_backlog(&self) -> i64 {
        self.score_backlog.load(Ordering::SeqCst)
    }

    /// Acquire an advisory lock with the configured wait budget.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::LockTimeout`] when the wait budget runs out.
    pub async fn lock(&self, key: &str, holder: &str) -> Result<(), StepError> {
        let acquired = self
            .db
            .acquire_lock(key, holder, self.lock_wait(), &self.user_id)
            .await?;
        if acquired {
            Ok(())
        } else {
            Err(StepError::LockTimeout(key.to_owned()))
        }
    }

    /// Release an advisory lock, logging on failure.
    pub async fn unlock(&self, key: &str, holder: &str) {
        if let Err(e) = self.db.release_lock(key, holder, &self.user_id).await {
            tracing::warn!(key, error = %e, "failed to release advisory lock");
        }
    }

    fn lock_wait(&self) -> Duration {
        self.orchestrator.lock_wait_timeout()
    }
}
