//! Mapping signatures and the content-addressed attack cache.
//!
//! A signature is a deterministic fingerprint of everything that could
//! change an attack's output: every validated mapping plus the identity
//! of the typeset source. Equality implies "nothing to redo" — an engine
//! whose stored metadata carries an equal signature returns its cached
//! result and performs no filesystem or subprocess work at all.
//!
//! Entries are sorted for order-independence (reordering mappings in the
//! document must not bust the cache), with the source fingerprint kept
//! as a final, unsorted entry so it is always last and always present.

use crate::document::{SourceFingerprint, StructuredQuestion, SubstringMapping};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One signature line for a validated mapping.
///
/// Unknown positions serialise as empty fields, so two mappings that
/// differ only in position hints still produce distinct lines.
fn mapping_entry(label: &str, m: &SubstringMapping) -> String {
    let start = m.start.map(|v| v.to_string()).unwrap_or_default();
    let end = m.end.map(|v| v.to_string()).unwrap_or_default();
    format!(
        "{}|{}|{}|{}|{}",
        label, m.original, m.replacement, start, end
    )
}

/// Compute the signature for a set of questions' validated mappings.
pub fn signature(questions: &[StructuredQuestion], source: &SourceFingerprint) -> Vec<String> {
    let mut entries: Vec<String> = questions
        .iter()
        .flat_map(|q| {
            let label = q.label();
            q.validated_mappings()
                .map(move |m| mapping_entry(&label, m))
                .collect::<Vec<_>>()
        })
        .collect();
    entries.sort();
    entries.push(format!("{}|{}", source.sha256, source.path.display()));
    entries
}

/// Mode-aware signature for the watermark method.
///
/// Prevention mode injects the same fixed phrase regardless of mapping
/// content, so its signature depends only on the question count; the
/// detection signature includes each question's chosen mapping id and
/// replacement text.
pub fn watermark_signature(
    questions: &[StructuredQuestion],
    source: &SourceFingerprint,
    prevention: bool,
) -> Vec<String> {
    let mut entries: Vec<String> = if prevention {
        vec![format!("prevention|questions={}", questions.len())]
    } else {
        questions
            .iter()
            .filter_map(|q| {
                q.validated_mappings()
                    .next()
                    .map(|m| format!("{}|{}|{}", q.label(), m.id, m.replacement))
            })
            .collect()
    };
    entries.sort();
    entries.push(format!("{}|{}", source.sha256, source.path.display()));
    entries
}

/// Cache metadata persisted at `artifacts/<method>/metadata.json`.
///
/// Holds the signature the artifacts were generated under plus the full
/// result payload, so a cache hit can return the previous result without
/// touching any other artifact file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub signature: Vec<String>,
    pub result: serde_json::Value,
}

impl CacheMetadata {
    /// Read stored metadata; `None` when absent or unreadable (either way
    /// the cache misses and the engine regenerates).
    pub fn read(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!("discarding unreadable cache metadata at {}: {e}", path.display());
                None
            }
        }
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self).unwrap_or_default())
    }
}

/// Cache hit test: stored metadata exists **and** its signature equals
/// the freshly computed one. A caller-supplied `force` flag bypasses the
/// cache unconditionally (the sole eviction mechanism — no implicit
/// expiry).
pub fn is_cached(metadata_path: &Path, fresh: &[String], force: bool) -> Option<CacheMetadata> {
    if force {
        debug!("cache bypassed (force) for {}", metadata_path.display());
        return None;
    }
    let meta = CacheMetadata::read(metadata_path)?;
    if meta.signature == fresh {
        Some(meta)
    } else {
        None
    }
}
