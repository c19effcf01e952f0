//! Local OCR adapter for plain-text document folders.
//!
//! Reads text files directly instead of calling an OCR backend, which
//! keeps the pipeline fully operable for text inputs and local
//! development. Image inputs are a fatal error here; they need a real
//! OCR backend behind the same trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{
    AdapterError, BoundingBox, OcrAdapter, OcrBlock, OcrBlockKind, OcrOutcome, OcrPage,
};

/// File extensions this adapter can read directly.
const TEXT_EXTENSIONS: &[&str] = &["txt", "text", "md"];

/// Synthetic confidence for text read straight from disk.
const TEXT_CONFIDENCE: f64 = 99.0;

/// OCR adapter that handles folders of plain-text files.
#[derive(Debug, Clone, Default)]
pub struct TextFolderOcr;

impl TextFolderOcr {
    /// Create a new adapter instance.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OcrAdapter for TextFolderOcr {
    async fn extract(&self, folder: &Path) -> Result<OcrOutcome, AdapterError> {
        let files = list_input_files(folder)?;

        let mut full_text = String::new();
        let mut pages = Vec::with_capacity(files.len());
        let mut line_count: usize = 0;

        for path in &files {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
                return Err(AdapterError::Fatal(format!(
                    "unsupported file type '{}' in {}: image inputs need an external OCR backend",
                    extension,
                    folder.display()
                )));
            }

            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                AdapterError::Retryable(format!("failed to read {}: {e}", path.display()))
            })?;

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
                .to_owned();

            let blocks = blocks_for(&content);
            line_count = line_count
                .saturating_add(blocks.iter().filter(|b| b.kind == OcrBlockKind::Line).count());

            if !full_text.is_empty() {
                full_text.push('\n');
            }
            full_text.push_str(content.trim_end());

            pages.push(OcrPage {
                file: file_name,
                blocks,
            });
        }

        let avg_confidence = if line_count == 0 { 0.0 } else { TEXT_CONFIDENCE };

        Ok(OcrOutcome {
            full_text,
            document_count: pages.len(),
            pages,
            avg_confidence,
        })
    }
}

/// Input files in the folder, sorted by name, skipping `meta.json` and
/// hidden/marker files.
fn list_input_files(folder: &Path) -> Result<Vec<PathBuf>, AdapterError> {
    let entries = std::fs::read_dir(folder).map_err(|e| {
        AdapterError::Retryable(format!("failed to read folder {}: {e}", folder.display()))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| AdapterError::Retryable(e.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "meta.json" || name.starts_with('.') {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Build PAGE/LINE/WORD blocks for one file's content.
///
/// Geometry is synthetic: lines stack top to bottom, words split a line
/// left to right. Enough structure for downstream consumers that expect
/// the full block shape.
fn blocks_for(content: &str) -> Vec<OcrBlock> {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut blocks = Vec::with_capacity(lines.len().saturating_add(1));

    blocks.push(OcrBlock {
        kind: OcrBlockKind::Page,
        text: String::new(),
        confidence: TEXT_CONFIDENCE,
        bounding_box: BoundingBox {
            left: 0.0,
            top: 0.0,
            width: 1.0,
            height: 1.0,
        },
    });

    let line_total = lines.len().max(1);
    for (row, line) in lines.iter().enumerate() {
        let row_f = u32::try_from(row).unwrap_or(u32::MAX);
        let total_f = u32::try_from(line_total).unwrap_or(u32::MAX);
        let top = f64::from(row_f) / f64::from(total_f);
        let height = 1.0 / f64::from(total_f);

        blocks.push(OcrBlock {
            kind: OcrBlockKind::Line,
            text: (*line).to_owned(),
            confidence: TEXT_CONFIDENCE,
            bounding_box: BoundingBox {
                left: 0.0,
                top,
                width: 1.0,
                height,
            },
        });

        let words: Vec<&str> = line.split_whitespace().collect();
        let word_total = words.len().max(1);
        for (col, word) in words.iter().enumerate() {
            let col_f = u32::try_from(col).unwrap_or(u32::MAX);
            let word_total_f = u32::try_from(word_total).unwrap_or(u32::MAX);
            blocks.push(OcrBlock {
                kind: OcrBlockKind::Word,
                text: (*word).to_owned(),
                confidence: TEXT_CONFIDENCE,
                bounding_box: BoundingBox {
                    left: f64::from(col_f) / f64::from(word_total_f),
                    top,
                    width: 1.0 / f64::from(word_total_f),
                    height,
                },
            });
        }
    }

    blocks
}
