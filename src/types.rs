//! Core lifecycle and classification enums shared across the data layer,
//! the step functions, and the orchestrator.
//!
//! Every enum here is stored in SQLite as its snake_case string form, so
//! each carries an `as_str`/`parse` pair instead of relying on serde for
//! column round-trips.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Document lifecycle ──────────────────────────────────────────

/// Lifecycle state of a document row.
///
/// Happy path:
/// `pending → ocr_completed → classified → scored_classification →
/// summarized → scored_summary → filed → series_summarized → completed`.
///
/// The `*_in_progress`/`*_summarizing`/`*_scoring` variants are in-flight
/// sub-states that double as locks against concurrent steps. Any state may
/// move to `failed` once the retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Registered by the inbox scanner, no work done yet.
    Pending,
    /// OCR adapter call in flight.
    OcrInProgress,
    /// Extracted text persisted.
    OcrCompleted,
    /// Document type and tags assigned.
    Classified,
    /// Background classification scoring finished.
    ScoredClassification,
    /// Generic structured extraction persisted.
    Summarized,
    /// Background summary scoring finished.
    ScoredSummary,
    /// Series detection and file assignment done.
    Filed,
    /// Series extraction in flight.
    SeriesSummarizing,
    /// Series-scoped structured extraction persisted.
    SeriesSummarized,
    /// Background series scoring in flight.
    SeriesScoring,
    /// Terminal: all required fields populated.
    Completed,
    /// Terminal: retries exhausted or fatal error.
    Failed,
}

impl DocumentStatus {
    /// Column value for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OcrInProgress => "ocr_in_progress",
            Self::OcrCompleted => "ocr_completed",
            Self::Classified => "classified",
            Self::ScoredClassification => "scored_classification",
            Self::Summarized => "summarized",
            Self::ScoredSummary => "scored_summary",
            Self::Filed => "filed",
            Self::SeriesSummarizing => "series_summarizing",
            Self::SeriesSummarized => "series_summarized",
            Self::SeriesScoring => "series_scoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a column value back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "ocr_in_progress" => Self::OcrInProgress,
            "ocr_completed" => Self::OcrCompleted,
            "classified" => Self::Classified,
            "scored_classification" => Self::ScoredClassification,
            "summarized" => Self::Summarized,
            "scored_summary" => Self::ScoredSummary,
            "filed" => Self::Filed,
            "series_summarizing" => Self::SeriesSummarizing,
            "series_summarized" => Self::SeriesSummarized,
            "series_scoring" => Self::SeriesScoring,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    /// Whether the document can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether this is an in-flight sub-state eligible for stale recovery.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::OcrInProgress | Self::SeriesSummarizing | Self::SeriesScoring
        )
    }

    /// The state a stale in-flight row is reset to during recovery.
    pub fn recovery_target(self) -> Option<Self> {
        match self {
            Self::OcrInProgress => Some(Self::Pending),
            Self::SeriesSummarizing => Some(Self::Filed),
            Self::SeriesScoring => Some(Self::SeriesSummarized),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── File lifecycle ──────────────────────────────────────────────

/// Lifecycle state of a file (tag-signature aggregation) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Created, summary never generated.
    Pending,
    /// First summary generation in flight.
    Generating,
    /// Summary current with membership.
    Generated,
    /// Membership changed since the last summary.
    Outdated,
    /// Re-summary in flight.
    Regenerating,
    /// Generation failed after retries.
    Failed,
}

impl FileStatus {
    /// Column value for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Generated => "generated",
            Self::Outdated => "outdated",
            Self::Regenerating => "regenerating",
            Self::Failed => "failed",
        }
    }

    /// Parse a column value back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "generating" => Self::Generating,
            "generated" => Self::Generated,
            "outdated" => Self::Outdated,
            "regenerating" => Self::Regenerating,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    /// Whether this is an in-flight state eligible for stale recovery.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Generating | Self::Regenerating)
    }

    /// The state a stale in-flight row is reset to during recovery.
    pub fn recovery_target(self) -> Option<Self> {
        match self {
            Self::Generating => Some(Self::Pending),
            Self::Regenerating => Some(Self::Outdated),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Prompts ─────────────────────────────────────────────────────

/// The role a versioned prompt plays in the pipeline.
///
/// For `SeriesSummarizer` rows the `document_type` column holds the series
/// id as a string; for every other kind it holds a document type (or the
/// empty string for type-independent prompts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Assigns a document type and tags.
    Classifier,
    /// Generic structured extraction per document type.
    Summarizer,
    /// Series-scoped extraction pinned to one series.
    SeriesSummarizer,
    /// Aggregated file summary (static, never evolves).
    FileSummarizer,
    /// Detects which series a document belongs to.
    SeriesDetector,
}

impl PromptKind {
    /// Column value for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classifier => "classifier",
            Self::Summarizer => "summarizer",
            Self::SeriesSummarizer => "series_summarizer",
            Self::FileSummarizer => "file_summarizer",
            Self::SeriesDetector => "series_detector",
        }
    }

    /// Parse a column value back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "classifier" => Self::Classifier,
            "summarizer" => Self::Summarizer,
            "series_summarizer" => Self::SeriesSummarizer,
            "file_summarizer" => Self::FileSummarizer,
            "series_detector" => Self::SeriesDetector,
            _ => return None,
        })
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Extraction method ───────────────────────────────────────────

/// Which extraction(s) populated a document's structured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Only the generic summarizer ran.
    Generic,
    /// Only the series prompt ran.
    Series,
    /// Both extractions are present.
    Both,
}

impl ExtractionMethod {
    /// Column value for this method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Series => "series",
            Self::Both => "both",
        }
    }

    /// Parse a column value back into a method.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "generic" => Self::Generic,
            "series" => Self::Series,
            "both" => Self::Both,
            _ => return None,
        })
    }
}

// ── Tags ────────────────────────────────────────────────────────

/// Who created a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagOrigin {
    /// Supplied by the user in inbox metadata.
    User,
    /// Suggested by the classifier LLM.
    Llm,
    /// Derived by a pipeline rule (auto-tag, series canonical tag).
    System,
}

impl TagOrigin {
    /// Column value for this origin.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Llm => "llm",
            Self::System => "system",
        }
    }
}

// ── Event log ───────────────────────────────────────────────────

/// Category of an append-only event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Document or file status transitions.
    Lifecycle,
    /// One row per LLM adapter call, with token counts and latency.
    LlmRequest,
    /// Advisory lock operations.
    Lock,
    /// Inbox scanning and registration.
    Inbox,
    /// Stale-work recovery actions.
    Recovery,
    /// Background quality scoring.
    Scoring,
    /// Prompt version evolution.
    Evolution,
    /// Series regeneration sweeps.
    Regeneration,
    /// Errors from any step.
    Error,
}

impl EventCategory {
    /// Column value for this category.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::LlmRequest => "llm_request",
            Self::Lock => "lock",
            Self::Inbox => "inbox",
            Self::Recovery => "recovery",
            Self::Scoring => "scoring",
            Self::Evolution => "evolution",
            Self::Regeneration => "regeneration",
            Self::Error => "error",
        }
    }

    /// Parse a column value back into a category.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "lifecycle" => Self::Lifecycle,
            "llm_request" => Self::LlmRequest,
            "lock" => Self::Lock,
            "inbox" => Self::Inbox,
            "recovery" => Self::Recovery,
            "scoring" => Self::Scoring,
            "evolution" => Self::Evolution,
            "regeneration" => Self::Regeneration,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
