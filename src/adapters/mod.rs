//! OCR and LLM adapter abstraction layer.
//!
//! The pipeline core consumes two external capabilities through these
//! traits: text extraction from a document folder ([`OcrAdapter`]) and
//! prompt completion ([`LlmAdapter`]). Both surface a retryable/fatal
//! error distinction so the orchestrator's retry accounting can decide
//! whether a failure is worth another attempt.
//!
//! Two concrete implementations ship with the crate:
//! - [`anthropic::AnthropicAdapter`]: Anthropic `/v1/messages` API
//! - [`text_ocr::TextFolderOcr`]: local adapter for plain-text inputs
//!
//! Production OCR backends (e.g. a Textract bridge) plug in behind
//! [`OcrAdapter`] without the core changing.

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod text_ocr;

// ── Errors ──────────────────────────────────────────────────────

/// Errors surfaced by OCR and LLM adapters.
///
/// The variant decides retry policy: `Retryable` failures (network,
/// throttling, 5xx, timeouts) leave the document untouched for the next
/// tick; `Fatal` failures (auth, malformed request, unsupported input)
/// burn a retry from the document's budget.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Transient failure; safe to retry without side effects.
    #[error("retryable adapter error: {0}")]
    Retryable(String),
    /// Permanent failure; retrying the same input cannot succeed.
    #[error("fatal adapter error: {0}")]
    Fatal(String),
}

impl AdapterError {
    /// Whether the orchestrator should retry without charging the budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        // Transport-level failures are always worth another attempt.
        AdapterError::Retryable(e.to_string())
    }
}

/// Check an HTTP response status and return the body text or a
/// classified error: 429/5xx → retryable, other non-2xx → fatal.
///
/// # Errors
///
/// Returns [`AdapterError::Retryable`] on transport failure or a
/// throttle/server status, [`AdapterError::Fatal`] on any other non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, AdapterError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let summary = format!(
        "status {}: {}",
        status.as_u16(),
        sanitize_error_body(&body)
    );
    if status.as_u16() == 429 || status.is_server_error() {
        Err(AdapterError::Retryable(summary))
    } else {
        Err(AdapterError::Fatal(summary))
    }
}

/// Collapse, redact API keys from, and truncate an error body before it
/// reaches logs or the events table.
fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [r"sk-ant-[A-Za-z0-9_\-]{10,}", r"sk-[A-Za-z0-9]{32,}"] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }
    truncate(&sanitized, 256)
}

fn truncate(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() > max_chars {
        let shortened: String = raw.chars().take(max_chars).collect();
        format!("{shortened}...[truncated]")
    } else {
        raw.to_owned()
    }
}

// ── OCR types ───────────────────────────────────────────────────

/// Geometry of a detected block, normalized to the page (0.0–1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Distance from the left edge.
    pub left: f64,
    /// Distance from the top edge.
    pub top: f64,
    /// Block width.
    pub width: f64,
    /// Block height.
    pub height: f64,
}

/// Granularity of a detected OCR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OcrBlockKind {
    /// A whole page.
    Page,
    /// A line of text.
    Line,
    /// A single word.
    Word,
}

/// One detected block with its text, confidence, and geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrBlock {
    /// Block granularity.
    pub kind: OcrBlockKind,
    /// Detected text (empty for PAGE blocks).
    pub text: String,
    /// Detection confidence in 0.0–100.0.
    pub confidence: f64,
    /// Normalized geometry.
    pub bounding_box: BoundingBox,
}

/// Blocks detected for one file in the document folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    /// File name within the document folder.
    pub file: String,
    /// Detected blocks, reading order.
    pub blocks: Vec<OcrBlock>,
}

/// Total result of extracting a document folder.
///
/// Persisted verbatim as the `{doc_id}_llm.json` artifact, so the shape
/// is stable and serde-serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutcome {
    /// Concatenated text of every file, in `meta.json` order.
    pub full_text: String,
    /// Per-file block detail.
    pub pages: Vec<OcrPage>,
    /// Number of files processed.
    pub document_count: usize,
    /// Mean confidence across all LINE blocks, 0.0–100.0.
    pub avg_confidence: f64,
}

/// Text extraction from an immutable document folder.
///
/// Implementations must be idempotent: extracting the same folder twice
/// yields the same result, since the outcome is persisted as an artifact
/// keyed by document id.
#[async_trait]
pub trait OcrAdapter: Send + Sync {
    /// Extract text and block structure from every file in `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Retryable`] for transient backend
    /// failures and [`AdapterError::Fatal`] for unsupported file types.
    async fn extract(&self, folder: &Path) -> Result<OcrOutcome, AdapterError>;
}

// ── LLM types ───────────────────────────────────────────────────

/// Per-call options for an LLM invocation.
#[derive(Debug, Clone)]
pub struct LlmOptions {
    /// Maximum tokens in the completion.
    pub max_tokens: u32,
    /// Hint that the reply must be a single JSON object.
    pub expect_json: bool,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            expect_json: true,
        }
    }
}

/// The reply from one LLM invocation, with the trace fields the event
/// log requires.
#[derive(Debug, Clone)]
pub struct LlmReply {
    /// Raw completion text.
    pub text: String,
    /// Tokens consumed by the request.
    pub request_tokens: i64,
    /// Tokens generated in the response.
    pub response_tokens: i64,
    /// Wall-clock latency of the call.
    pub latency_ms: i64,
    /// Model that served the completion.
    pub model_id: String,
}

impl LlmReply {
    /// Parse the completion as a JSON object, tolerating code fences and
    /// surrounding prose.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Fatal`] when no JSON object can be found;
    /// a malformed reply will not improve on retry of the same input.
    pub fn parsed_json(&self) -> Result<serde_json::Value, AdapterError> {
        extract_json(&self.text)
            .ok_or_else(|| AdapterError::Fatal(format!("no JSON object in LLM reply: {}", truncate(&self.text, 120))))
    }
}

/// Locate and parse the first JSON object embedded in LLM output.
///
/// Handles bare JSON, fenced blocks, and prose-wrapped objects by
/// scanning from each `{` for a balanced object.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let bytes = trimmed.as_bytes();
    let mut start = None;
    let mut depth: u32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth = depth.saturating_add(1);
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start {
                        if let Some(candidate) = trimmed.get(s..=i) {
                            if let Ok(value) = serde_json::from_str(candidate) {
                                return Some(value);
                            }
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Prompt completion against an LLM backend.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Run `prompt_text` as the system instruction over `user_text`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Retryable`] on throttle/5xx/transport
    /// failures and [`AdapterError::Fatal`] on 4xx or schema violations.
    async fn invoke(
        &self,
        prompt_text: &str,
        user_text: &str,
        options: &LlmOptions,
    ) -> Result<LlmReply, AdapterError>;

    /// The model identifier this adapter is instantiated for.
    fn model_id(&self) -> &str;
}
