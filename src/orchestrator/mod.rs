//! The orchestrator loop.
//!
//! Single-process cooperative scheduling: each tick sweeps the inbox,
//! dispatches eligible documents and files under the flow semaphores,
//! runs the regeneration sweep, and periodically recovers stale
//! in-flight rows. Steps suspend only at I/O, adapter calls, and DB
//! waits; adapter-specific semaphores are held around the adapter call
//! only, so DB work overlaps adapter-bound work.
//!
//! `run_once` drives the loop until the pipeline is quiescent (no step
//! made progress), which is what `start-processor --once` and the
//! idempotence guarantee rely on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapters::{LlmAdapter, OcrAdapter};
use crate::artifacts::ArtifactStore;
use crate::config::PipelineConfig;
use crate::db::{Database, DocumentRecord, FileRecord};
use crate::inbox::InboxScanner;
use crate::pipeline::{
    classify, file_step, file_summary, finalize, ocr, regenerate, scoring, seed,
    series_summarize, summarize, PipelineContext, ScoreJob, StepError,
};
use crate::types::{DocumentStatus, FileStatus};

pub mod recovery;

/// Queue depth for the background scoring worker.
const SCORE_QUEUE_DEPTH: usize = 128;

/// How long shutdown waits for queued scoring work to drain.
const SCORE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-status fetch headroom over the flow cap, so a tick can refill
/// slots as early tasks finish.
const FETCH_FACTOR: i64 = 4;

/// Owns the pipeline context, the flow semaphores, and the scoring
/// worker; drives ticks until shutdown or quiescence.
pub struct Orchestrator {
    ctx: PipelineContext,
    scanner: InboxScanner,
    document_flows: Arc<Semaphore>,
    file_flows: Arc<Semaphore>,
    file_generation: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    score_rx: Option<mpsc::Receiver<ScoreJob>>,
}

impl Orchestrator {
    /// Wire up the orchestrator from config, database, and adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact or inbox directories cannot be
    /// created.
    pub fn new(
        config: &PipelineConfig,
        db: Database,
        ocr_adapter: Arc<dyn OcrAdapter>,
        llm_adapter: Arc<dyn LlmAdapter>,
    ) -> anyhow::Result<Self> {
        let artifacts = ArtifactStore::new(&config.paths.artifacts_dir())
            .context("failed to prepare artifacts directory")?;
        let scanner = InboxScanner::new(
            db.clone(),
            artifacts.clone(),
            &config.paths.inbox_dir(),
            &config.user_id.0,
        )
        .context("failed to prepare inbox directory")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (score_tx, score_rx) = mpsc::channel(SCORE_QUEUE_DEPTH);

        let ctx = PipelineContext {
            db,
            ocr: ocr_adapter,
            llm: llm_adapter,
            artifacts,
            textract_slots: Arc::new(Semaphore::new(config.orchestrator.textract_workers)),
            bedrock_slots: Arc::new(Semaphore::new(config.orchestrator.bedrock_workers)),
            orchestrator: config.orchestrator.clone(),
            scoring: config.scoring.clone(),
            user_id: config.user_id.0.clone(),
            shutdown: shutdown_rx,
            score_tx,
            score_backlog: Arc::new(std::sync::atomic::AtomicI64::new(0)),
        };

        Ok(Self {
            ctx,
            scanner,
            document_flows: Arc::new(Semaphore::new(config.orchestrator.max_document_flows)),
            file_flows: Arc::new(Semaphore::new(config.orchestrator.max_file_flows)),
            file_generation: Arc::new(Semaphore::new(
                config.orchestrator.file_generation_workers,
            )),
            shutdown_tx,
            score_rx: Some(score_rx),
        })
    }

    /// A handle for requesting shutdown from another task.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run the orchestrator until shutdown (or, with `run_once`, until
    /// the pipeline is quiescent).
    ///
    /// `doc_filter` restricts document dispatch to one id.
    ///
    /// # Errors
    ///
    /// Returns an error on unrecoverable setup or database failure.
    pub async fn run(mut self, run_once: bool, doc_filter: Option<String>) -> anyhow::Result<()> {
        seed::seed_baseline(&self.ctx.db, &self.ctx.scoring, &self.ctx.user_id).await?;

        let score_worker = {
            let rx = self
                .score_rx
                .take()
                .ok_or_else(|| anyhow::anyhow!("orchestrator already ran"))?;
            // The worker's context must not hold a live queue sender, or
            // the queue never closes and shutdown cannot drain it.
            let mut worker_ctx = self.ctx.clone();
            let (detached_tx, _) = mpsc::channel(1);
            worker_ctx.score_tx = detached_tx;
            tokio::spawn(scoring::run_worker(worker_ctx, rx))
        };

        // Startup recovery, then periodic sweeps.
        if let Err(e) = recovery::recover(
            &self.ctx.db,
            Duration::from_secs(self.ctx.orchestrator.stale_timeout_seconds),
            self.ctx.orchestrator.max_retries,
            &self.ctx.user_id,
        )
        .await
        {
            warn!(error = %e, "startup recovery failed");
        }
        let mut last_recovery = tokio::time::Instant::now();

        info!(once = run_once, "processor started");

        loop {
            if self.ctx.cancelled() {
                break;
            }

            let mut progressed = false;

            match self.scanner.sweep().await {
                Ok(n) => progressed |= n > 0,
                Err(e) => warn!(error = %e, "inbox sweep failed"),
            }

            if last_recovery.elapsed() >= self.ctx.orchestrator.recovery_interval() {
                last_recovery = tokio::time::Instant::now();
                if let Err(e) = recovery::recover(
                    &self.ctx.db,
                    Duration::from_secs(self.ctx.orchestrator.stale_timeout_seconds),
                    self.ctx.orchestrator.max_retries,
                    &self.ctx.user_id,
                )
                .await
                {
                    warn!(error = %e, "recovery sweep failed");
                }
            }

            progressed |= self.dispatch_documents(doc_filter.as_deref()).await? > 0;

            if doc_filter.is_none() {
                match regenerate::run_sweep(&self.ctx).await {
                    Ok(n) => progressed |= n > 0,
                    Err(e) => warn!(error = %e, "regeneration sweep failed"),
                }
                progressed |= self.dispatch_files().await? > 0;
            }

            if run_once {
                if progressed {
                    continue;
                }
                // Background scoring may still flip documents through
                // their scored sub-states; quiescence waits it out.
                if self.ctx.score_backlog() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.orchestrator.poll_interval()) => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("shutdown requested");
                        let _ = self.shutdown_tx.send(true);
                        break;
                    }
                }
            }
        }

        // Close the scoring queue and drain it with a bounded wait.
        drop(self.ctx);
        drop(self.scanner);
        if timeout(SCORE_DRAIN_TIMEOUT, score_worker).await.is_err() {
            warn!("scoring queue did not drain before shutdown timeout");
        }

        info!("processor stopped");
        Ok(())
    }

    /// Dispatch every eligible document to its step, bounded by the
    /// document-flow semaphore. Returns how many steps made progress.
    async fn dispatch_documents(&self, doc_filter: Option<&str>) -> anyhow::Result<usize> {
        let fetch_limit =
            i64::try_from(self.ctx.orchestrator.max_document_flows).unwrap_or(i64::MAX)
                .saturating_mul(FETCH_FACTOR);

        let eligible: &[&[DocumentStatus]] = &[
            &[DocumentStatus::Pending],
            &[DocumentStatus::OcrCompleted],
            &[
                DocumentStatus::Classified,
                DocumentStatus::ScoredClassification,
            ],
            &[DocumentStatus::Summarized, DocumentStatus::ScoredSummary],
            &[DocumentStatus::Filed],
            &[DocumentStatus::SeriesSummarized],
        ];

        let mut batch: Vec<DocumentRecord> = Vec::new();
        for statuses in eligible {
            batch.extend(self.ctx.db.documents_by_status(statuses, fetch_limit).await?);
        }
        if let Some(filter) = doc_filter {
            batch.retain(|d| d.id == filter);
        }

        let mut tasks = JoinSet::new();
        for doc in batch {
            let Ok(permit) = self.document_flows.clone().acquire_owned().await else {
                break;
            };
            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let result = run_document_step(&ctx, &doc).await;
                drop(permit);
                (doc, result)
            });
        }

        let mut progressed: usize = 0;
        while let Some(joined) = tasks.join_next().await {
            let Ok((doc, result)) = joined else {
                warn!("document step task panicked");
                continue;
            };
            if self.settle_document(&doc, result).await? {
                progressed = progressed.saturating_add(1);
            }
        }
        Ok(progressed)
    }

    /// Apply retry accounting to one finished document step. Returns
    /// whether the step made progress.
    async fn settle_document(
        &self,
        doc: &DocumentRecord,
        result: Result<(), StepError>,
    ) -> anyhow::Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(StepError::StateConflict) => {
                debug!(document_id = %doc.id, "step lost the row to another worker");
                Ok(false)
            }
            Err(StepError::Transient(msg)) => {
                debug!(document_id = %doc.id, %msg, "transient step failure, retrying next tick");
                Ok(false)
            }
            Err(StepError::LockTimeout(key)) => {
                warn!(document_id = %doc.id, %key, "lock wait timed out, deferring");
                Ok(false)
            }
            Err(StepError::Cancelled) => {
                self.ctx
                    .db
                    .fail_document(&doc.id, "cancelled", &self.ctx.user_id)
                    .await?;
                Ok(false)
            }
            Err(StepError::Fatal(msg)) => {
                let attempts = self.ctx.db.bump_document_retry(&doc.id).await?;
                if attempts > self.ctx.orchestrator.max_retries {
                    warn!(document_id = %doc.id, attempts, %msg, "retry budget exhausted");
                    self.ctx.db.fail_document(&doc.id, &msg, &self.ctx.user_id).await?;
                } else {
                    warn!(document_id = %doc.id, attempts, %msg, "fatal step failure, will retry");
                }
                Ok(false)
            }
        }
    }

    /// Dispatch every file due for (re)generation. Returns how many
    /// generations made progress.
    async fn dispatch_files(&self) -> anyhow::Result<usize> {
        let fetch_limit = i64::try_from(self.ctx.orchestrator.max_file_flows)
            .unwrap_or(i64::MAX)
            .saturating_mul(FETCH_FACTOR);
        let batch = self
            .ctx
            .db
            .files_by_status(&[FileStatus::Pending, FileStatus::Outdated], fetch_limit)
            .await?;

        let mut tasks = JoinSet::new();
        for file in batch {
            let Ok(flow_permit) = self.file_flows.clone().acquire_owned().await else {
                break;
            };
            let generation = self.file_generation.clone();
            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let result = match generation.acquire_owned().await {
                    Ok(_permit) => file_summary::run(&ctx, &file).await,
                    Err(_) => Err(StepError::Cancelled),
                };
                drop(flow_permit);
                (file, result)
            });
        }

        let mut progressed: usize = 0;
        while let Some(joined) = tasks.join_next().await {
            let Ok((file, result)) = joined else {
                warn!("file step task panicked");
                continue;
            };
            if self.settle_file(&file, result).await? {
                progressed = progressed.saturating_add(1);
            }
        }
        Ok(progressed)
    }

    /// Apply retry accounting to one finished file generation.
    async fn settle_file(
        &self,
        file: &FileRecord,
        result: Result<(), StepError>,
    ) -> anyhow::Result<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(StepError::StateConflict) => Ok(false),
            Err(StepError::Transient(msg)) => {
                debug!(file_id = file.id, %msg, "transient file failure, retrying next tick");
                Ok(false)
            }
            Err(StepError::LockTimeout(key)) => {
                warn!(file_id = file.id, %key, "lock wait timed out, deferring");
                Ok(false)
            }
            Err(StepError::Cancelled) => {
                self.ctx
                    .db
                    .fail_file(file.id, "cancelled", &self.ctx.user_id)
                    .await?;
                Ok(false)
            }
            Err(StepError::Fatal(msg)) => {
                let attempts = self.ctx.db.bump_file_retry(file.id).await?;
                if attempts > self.ctx.orchestrator.max_retries {
                    warn!(file_id = file.id, attempts, %msg, "file retry budget exhausted");
                    self.ctx.db.fail_file(file.id, &msg, &self.ctx.user_id).await?;
                } else {
                    warn!(file_id = file.id, attempts, %msg, "fatal file failure, will retry");
                }
                Ok(false)
            }
        }
    }
}

/// Route a document to the step its status calls for.
async fn run_document_step(
    ctx: &PipelineContext,
    doc: &DocumentRecord,
) -> Result<(), StepError> {
    match doc.status() {
        DocumentStatus::Pending => ocr::run(ctx, doc).await,
        DocumentStatus::OcrCompleted => classify::run(ctx, doc).await,
        DocumentStatus::Classified | DocumentStatus::ScoredClassification => {
            summarize::run(ctx, doc).await
        }
        DocumentStatus::Summarized | DocumentStatus::ScoredSummary => {
            file_step::run(ctx, doc).await
        }
        DocumentStatus::Filed => series_summarize::run(ctx, doc).await,
        DocumentStatus::SeriesSummarized => finalize::run(ctx, doc).await,
        _ => Err(StepError::StateConflict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{context, FixedOcr, ScriptedLlm};

    #[tokio::test]
    async fn document_router_matches_statuses() {
        // A terminal document routes nowhere.
        let tmp = tempfile::tempdir().expect("tempdir");
        let (ctx, _rx) = context(
            tmp.path(),
            Arc::new(FixedOcr::with_text("x")),
            Arc::new(ScriptedLlm::new(vec![])),
        )
        .await;
        ctx.db
            .register_document("doc-1", "f", "/f", "local")
            .await
            .expect("register");
        sqlx::query("UPDATE documents SET status = 'completed' WHERE id = 'doc-1'")
            .execute(ctx.db.pool())
            .await
            .expect("status");
        let doc = ctx.db.document("doc-1").await.expect("get").expect("exists");

        let result = run_document_step(&ctx, &doc).await;
        assert!(matches!(result, Err(StepError::StateConflict)));
    }
}
