#![allow(missing_docs)] // TODO: enforce once the schema row types settle

//! Shoebox: a personal document-processing pipeline.
//!
//! Documents dropped into an inbox are driven through a multi-stage,
//! LLM-assisted state machine: OCR, classification, generic
//! summarization, filing into a recurring series, and series-scoped
//! re-extraction with self-improving prompts. The orchestrator polls
//! the database, dispatches work under per-resource concurrency caps,
//! and recovers stale in-flight rows after a crash.

pub mod adapters;
pub mod artifacts;
pub mod config;
pub mod db;
pub mod inbox;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod types;
