//! On-disk artifacts written alongside the database.
//!
//! Per document: `{doc_id}.txt` (full extracted text),
//! `{doc_id}_llm.json` (the complete OCR block structure), and
//! `{doc_id}_meta.json` (a copy of the inbox metadata). All writes are
//! whole-file replacements, so re-running a step overwrites cleanly.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::adapters::OcrOutcome;

/// Writer for per-document artifacts under one root directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create artifacts dir {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path of the full-text artifact for a document.
    pub fn text_path(&self, doc_id: &str) -> PathBuf {
        self.root.join(format!("{doc_id}.txt"))
    }

    /// Path of the OCR blocks artifact for a document.
    pub fn blocks_path(&self, doc_id: &str) -> PathBuf {
        self.root.join(format!("{doc_id}_llm.json"))
    }

    /// Path of the inbox metadata copy for a document.
    pub fn meta_path(&self, doc_id: &str) -> PathBuf {
        self.root.join(format!("{doc_id}_meta.json"))
    }

    /// Write the full extracted text.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_text(&self, doc_id: &str, text: &str) -> anyhow::Result<()> {
        let path = self.text_path(doc_id);
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Write the complete OCR outcome as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn write_blocks(&self, doc_id: &str, outcome: &OcrOutcome) -> anyhow::Result<()> {
        let path = self.blocks_path(doc_id);
        let json = serde_json::to_vec_pretty(outcome).context("failed to serialize OCR outcome")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Copy the inbox metadata JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn write_meta(&self, doc_id: &str, meta_json: &str) -> anyhow::Result<()> {
        let path = self.meta_path(doc_id);
        tokio::fs::write(&path, meta_json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
