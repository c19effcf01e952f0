//! Baseline prompt texts and first-run seeding.
//!
//! The pipeline must be operable from an empty database, so startup
//! seeds version-1 active prompts for the type-independent families
//! (classifier, series detector, file summarizer) plus a starter
//! document-type registry. Per-type summarizers are created lazily on
//! first use; series prompts are created by the series-summarize step
//! under its lock.

use serde_json::json;

use crate::config::ScoringConfig;
use crate::db::{Database, NewPrompt};
use crate::types::PromptKind;

/// Starter document types for the classifier context.
pub const BASELINE_DOCUMENT_TYPES: &[&str] = &[
    "bill",
    "receipt",
    "invoice",
    "statement",
    "letter",
    "contract",
    "tax_document",
    "medical_record",
    "insurance",
    "other",
];

/// Classifier system prompt (version 1).
pub const CLASSIFIER_PROMPT: &str = "\
You classify personal documents from their extracted text.

Reply with one JSON object:
{
  \"document_type\": \"<snake_case type>\",
  \"confidence\": <0.0-1.0>,
  \"reasoning\": \"<one sentence>\",
  \"tags\": [\"<short lowercase tag>\", ...]
}

Prefer a type from the known-types list. Only invent a new type when
nothing listed fits; keep it snake_case and generic. Prefer tags from
the common combinations shown; add at most two new tags.";

/// Series detector system prompt (version 1).
pub const SERIES_DETECTOR_PROMPT: &str = "\
You decide whether a document belongs to a recurring series (same
issuer, same repeating pattern, e.g. a monthly utility bill).

Reply with one JSON object:
{
  \"entity\": \"<canonical issuer name>\" or null,
  \"series_type\": \"<snake_case pattern>\" or null,
  \"frequency\": \"monthly\" | \"quarterly\" | \"annual\" | \"irregular\" | null,
  \"metadata\": { ... }
}

Use null entity for one-off documents. When the existing-series catalog
lists this issuer, reuse its entity name EXACTLY so the document lands
in the same series.";

/// File summarizer system prompt (version 1, static).
pub const FILE_SUMMARIZER_PROMPT: &str = "\
You summarize a collection of related personal documents (newest
first) into one coherent overview.

Reply with one JSON object:
{
  \"summary\": \"<a few sentences covering totals, trends, and notable items>\",
  \"metadata\": { \"document_count\": <n>, ... }
}";

/// System prompt used when inferring a new series schema and prompt.
pub const SERIES_PROMPT_CREATOR: &str = "\
You design an extraction prompt for a recurring document series. Given
one member document's generic extraction and a text sample, infer the
fields every member of the series shares.

Reply with one JSON object:
{
  \"schema_definition\": { \"<field>\": \"<string|number|boolean>\", ... },
  \"prompt_text\": \"<instructions that extract exactly those fields as JSON>\"
}

Keep field names snake_case and stable: they must apply to every future
document in the series.";

/// System prompt for the background quality scorers.
pub const SCORER_PROMPT: &str = "\
You grade how well an extraction prompt performed on a document.

Reply with one JSON object:
{
  \"score\": <0.0-1.0>,
  \"reasoning\": \"<one sentence>\",
  \"improved_prompt\": \"<a better prompt text>\" or null
}

Only propose improved_prompt when a concrete wording change would fix a
real defect you can name.";

/// Default generic summarizer text for one document type.
pub fn summarizer_prompt_text(document_type: &str) -> String {
    format!(
        "You extract structured data from a document of type \"{document_type}\".\n\n\
         Reply with one JSON object:\n\
         {{\n  \"summary\": \"<one or two sentences>\",\n  \"data\": {{ <every useful field you can extract, snake_case keys> }}\n}}\n\n\
         Dates as ISO 8601 strings, amounts as numbers without currency symbols."
    )
}

/// Seed the type-independent prompt families and the type registry.
///
/// Safe to call on every startup; existing rows win.
///
/// # Errors
///
/// Returns an error if the database access fails.
pub async fn seed_baseline(
    db: &Database,
    scoring: &ScoringConfig,
    user_id: &str,
) -> anyhow::Result<()> {
    db.seed_document_types(BASELINE_DOCUMENT_TYPES).await?;

    db.seed_prompt(&NewPrompt {
        kind: PromptKind::Classifier,
        document_type: String::new(),
        prompt_text: CLASSIFIER_PROMPT.to_owned(),
        can_evolve: true,
        score_ceiling: Some(scoring.score_ceiling_default),
        regenerates_on_update: false,
        performance_metrics: json!({}),
        user_id: user_id.to_owned(),
    })
    .await?;

    db.seed_prompt(&NewPrompt {
        kind: PromptKind::SeriesDetector,
        document_type: String::new(),
        prompt_text: SERIES_DETECTOR_PROMPT.to_owned(),
        can_evolve: false,
        score_ceiling: None,
        regenerates_on_update: false,
        performance_metrics: json!({}),
        user_id: user_id.to_owned(),
    })
    .await?;

    db.seed_prompt(&NewPrompt {
        kind: PromptKind::FileSummarizer,
        document_type: String::new(),
        prompt_text: FILE_SUMMARIZER_PROMPT.to_owned(),
        can_evolve: false,
        score_ceiling: None,
        regenerates_on_update: false,
        performance_metrics: json!({}),
        user_id: user_id.to_owned(),
    })
    .await?;

    Ok(())
}

/// Get or lazily create the summarizer for one document type.
///
/// # Errors
///
/// Returns an error if the database access fails.
pub async fn summarizer_for_type(
    db: &Database,
    scoring: &ScoringConfig,
    document_type: &str,
    user_id: &str,
) -> anyhow::Result<crate::db::PromptRecord> {
    db.seed_prompt(&NewPrompt {
        kind: PromptKind::Summarizer,
        document_type: document_type.to_owned(),
        prompt_text: summarizer_prompt_text(document_type),
        can_evolve: true,
        score_ceiling: Some(scoring.score_ceiling_default),
        regenerates_on_update: false,
        performance_metrics: json!({}),
        user_id: user_id.to_owned(),
    })
    .await
}
