#![allow(missing_docs)]

//! Shoebox: personal document-processing pipeline.
//!
//! Single binary: the `start-processor` subcommand runs the
//! orchestrator loop; the remaining subcommands are one-shot queries
//! and maintenance operations over the same database.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use shoebox::adapters::anthropic::AnthropicAdapter;
use shoebox::adapters::text_ocr::TextFolderOcr;
use shoebox::config::PipelineConfig;
use shoebox::db::Database;
use shoebox::logging;
use shoebox::orchestrator::Orchestrator;
use shoebox::types::{EventCategory, PromptKind};

#[derive(Parser)]
#[command(name = "shoebox", version, about = "Personal document-processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loop.
    StartProcessor {
        /// Process until quiescent, then exit.
        #[arg(long)]
        once: bool,
        /// Only dispatch this document.
        #[arg(long)]
        doc_id: Option<Uuid>,
    },
    /// Show the event log for one document.
    ViewEvents {
        /// Document UUID.
        uuid: Uuid,
        /// Filter to one category (e.g. llm_request, lock, lifecycle).
        #[arg(long)]
        category: Option<String>,
        /// Include the full details JSON per event.
        #[arg(long)]
        full: bool,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// List prompt versions.
    ViewPrompts {
        /// Filter to one prompt type.
        #[arg(long = "type")]
        prompt_type: Option<String>,
        /// Include archived (inactive) versions.
        #[arg(long)]
        archived: bool,
    },
    /// Reset a failed document for another run.
    Reprocess {
        /// Document UUID.
        uuid: Uuid,
    },
    /// Full-text search over extracted document text.
    Search {
        /// FTS query.
        query: String,
        /// Max results.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = PipelineConfig::load()?;

    match cli.command {
        Command::StartProcessor { once, doc_id } => {
            let _guard = logging::init_processor(&config.paths.logs_dir())?;
            start_processor(&config, once, doc_id).await
        }
        Command::ViewEvents {
            uuid,
            category,
            full,
            json,
        } => {
            logging::init_cli();
            view_events(&config, uuid, category.as_deref(), full, json).await
        }
        Command::ViewPrompts {
            prompt_type,
            archived,
        } => {
            logging::init_cli();
            view_prompts(&config, prompt_type.as_deref(), archived).await
        }
        Command::Reprocess { uuid } => {
            logging::init_cli();
            reprocess(&config, uuid).await
        }
        Command::Search { query, limit } => {
            logging::init_cli();
            search(&config, &query, limit).await
        }
    }
}

async fn start_processor(
    config: &PipelineConfig,
    once: bool,
    doc_id: Option<Uuid>,
) -> Result<()> {
    let Some(api_key) = config.llm.api_key.clone() else {
        bail!(
            "no LLM API key configured; set SHOEBOX_ANTHROPIC_API_KEY or [llm] api_key in config.toml"
        );
    };

    let db = Database::open(&config.paths.db_path()).await?;
    let llm = Arc::new(AnthropicAdapter::new(
        config.llm.base_url.clone(),
        config.llm.model.clone(),
        api_key,
    ));
    let ocr = Arc::new(TextFolderOcr::new());

    let orchestrator =
        Orchestrator::new(config, db, ocr, llm).context("failed to build orchestrator")?;
    orchestrator
        .run(once, doc_id.map(|id| id.to_string()))
        .await
}

async fn view_events(
    config: &PipelineConfig,
    uuid: Uuid,
    category: Option<&str>,
    full: bool,
    json: bool,
) -> Result<()> {
    let category = match category {
        Some(raw) => Some(
            EventCategory::parse(raw)
                .ok_or_else(|| anyhow::anyhow!("unknown event category: {raw}"))?,
        ),
        None => None,
    };

    let db = Database::open(&config.paths.db_path()).await?;
    let events = db
        .events_for_document(&uuid.to_string(), category, 1000)
        .await?;

    if json {
        let rendered: Vec<serde_json::Value> = events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "created_at": e.created_at,
                    "category": e.category,
                    "event_type": e.event_type,
                    "series_id": e.series_id,
                    "file_id": e.file_id,
                    "prompt_id": e.prompt_id,
                    "model_id": e.model_id,
                    "request_tokens": e.request_tokens,
                    "response_tokens": e.response_tokens,
                    "latency_ms": e.latency_ms,
                    "details": serde_json::from_str::<serde_json::Value>(&e.details)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("no events for {uuid}");
        return Ok(());
    }
    for event in &events {
        let mut line = format!(
            "{}  {:<12} {}",
            event.created_at, event.category, event.event_type
        );
        if let Some(tokens) = event.request_tokens {
            line.push_str(&format!(
                "  [{} -> {} tokens, {} ms]",
                tokens,
                event.response_tokens.unwrap_or(0),
                event.latency_ms.unwrap_or(0)
            ));
        }
        println!("{line}");
        if full && event.details != "{}" {
            println!("    {}", event.details);
        }
    }
    Ok(())
}

async fn view_prompts(
    config: &PipelineConfig,
    prompt_type: Option<&str>,
    archived: bool,
) -> Result<()> {
    let kind = match prompt_type {
        Some(raw) => Some(
            PromptKind::parse(raw).ok_or_else(|| anyhow::anyhow!("unknown prompt type: {raw}"))?,
        ),
        None => None,
    };

    let db = Database::open(&config.paths.db_path()).await?;
    let prompts = db.list_prompts(kind, archived, &config.user_id.0).await?;

    if prompts.is_empty() {
        println!("no prompts");
        return Ok(());
    }
    for prompt in &prompts {
        let family = if prompt.document_type.is_empty() {
            "-".to_owned()
        } else {
            prompt.document_type.clone()
        };
        println!(
            "#{:<4} {:<18} {:<24} v{:<3} {} score={} docs={}",
            prompt.id,
            prompt.prompt_type,
            family,
            prompt.version,
            if prompt.active() { "active  " } else { "archived" },
            prompt
                .performance_score
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "-".to_owned()),
            prompt.documents_processed(),
        );
    }
    Ok(())
}

async fn reprocess(config: &PipelineConfig, uuid: Uuid) -> Result<()> {
    let db = Database::open(&config.paths.db_path()).await?;
    match db
        .reprocess_document(&uuid.to_string(), &config.user_id.0)
        .await?
    {
        Some(target) => {
            println!("{uuid} reset to {target}; run start-processor to pick it up");
            Ok(())
        }
        None => bail!("{uuid} is not a failed document"),
    }
}

async fn search(config: &PipelineConfig, query: &str, limit: i64) -> Result<()> {
    let db = Database::open(&config.paths.db_path()).await?;
    let hits = db.search_documents(query, limit).await?;
    if hits.is_empty() {
        println!("no matches");
        return Ok(());
    }
    for doc in &hits {
        println!(
            "{}  {:<10} {:<16} {}",
            doc.id,
            doc.status,
            doc.document_type.as_deref().unwrap_or("-"),
            doc.filename
        );
    }
    Ok(())
}
