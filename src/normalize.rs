//! Normalization helpers for entities, tags, and file signatures.
//!
//! Series identity is `(entity_normalized, series_type_normalized, user_id)`
//! and the LLM is free with casing and whitespace, so everything funnels
//! through these functions before any lookup or unique insert.

/// Normalize an entity or series-type name for identity comparison.
///
/// Conservative by choice: lowercase, collapse internal whitespace,
/// trim. Punctuation is preserved so "PG&E" and "PGE" stay distinct;
/// canonical naming is the series detector's job (it sees the existing
/// catalog).
pub fn normalize_entity(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Normalize a tag for the unique `tag_normalized` column.
///
/// Lowercase and trimmed; internal whitespace becomes a single hyphen so
/// tags are single tokens.
pub fn normalize_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_sep {
                out.push('-');
                last_was_sep = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_sep = false;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Slug for the canonical `series:<slug>` tag of a series entity.
///
/// Lowercase ASCII alphanumerics with single hyphens between runs;
/// everything else is dropped.
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_hyphen = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Canonical tag for a series entity, e.g. `series:pacific-gas-electric`.
pub fn series_tag(entity: &str) -> String {
    format!("series:{}", slug(entity))
}

/// Compute the canonical signature for a file's tag list.
///
/// Tags are normalized, deduplicated, sorted, and joined with `:`. The
/// result is what the unique `(tag_signature, user_id)` constraint sees.
pub fn tag_signature(tags: &[String]) -> String {
    let mut normalized: Vec<String> = tags.iter().map(|t| normalize_tag(t)).collect();
    normalized.sort();
    normalized.dedup();
    normalized.join(":")
}
