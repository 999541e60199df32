//! Error types for the gradetrap library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`AttackError`] — **Fatal to a method or run**: the attack cannot
//!   proceed at all (base font asset missing, TeX engine absent, stage
//!   service raised). Returned as `Err(AttackError)` from engine and
//!   orchestrator entry points.
//!
//! * [`MappingStatus`] — **Non-fatal**: a single substitution failed
//!   (text not found in its segment, glyph missing from the base face)
//!   but the rest of the mappings are fine. Stored inside
//!   [`crate::attack::MappingDiagnostic`] so callers can inspect partial
//!   success rather than losing the whole attack to one bad mapping.
//!
//! The separation lets the orchestrator stay strict (any stage exception
//! fails the run) while the engines underneath degrade gracefully and
//! report success ratios in their summaries.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the gradetrap library.
///
/// Mapping-level failures use [`MappingStatus`] and are stored in
/// diagnostics rather than propagated here.
#[derive(Debug, Error)]
pub enum AttackError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The structured document JSON was not found at the given path.
    #[error("structured document not found: '{path}'")]
    DocumentNotFound { path: PathBuf },

    /// The structured document exists but could not be parsed.
    #[error("structured document '{path}' is malformed: {detail}")]
    DocumentMalformed { path: PathBuf, detail: String },

    /// The typeset source referenced by the document is missing.
    #[error("LaTeX source not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    // ── Method-level errors ───────────────────────────────────────────────
    /// A base asset required by a whole method is missing (e.g. the base
    /// font for glyph substitution). Short-circuits the method before any
    /// file I/O so no partial artifacts are written.
    #[error("base asset missing for '{method}': {path}")]
    BaseAssetMissing { method: &'static str, path: PathBuf },

    /// TeX compilation failed: non-zero exit on some pass, or timeout.
    /// No partial PDF is considered usable.
    #[error("compile failed for '{method}' on pass {pass}: {detail}")]
    CompileFailure {
        method: &'static str,
        pass: u8,
        detail: String,
    },

    /// The external PDF collaborator could not open or render a document.
    #[error("PDF rendering failed for '{path}': {detail}")]
    RenderFailed { path: PathBuf, detail: String },

    // ── Run-level errors ──────────────────────────────────────────────────
    /// A stage service raised; always fatal to the run, persisted with the
    /// full error text, never silently retried.
    #[error("stage '{stage}' failed for run {run_id}: {detail}")]
    StageExecutionFailed {
        run_id: String,
        stage: String,
        detail: String,
    },

    /// A caller asked for a stage name the canonical pipeline does not know.
    #[error("unknown stage '{stage}' (canonical stages: {known})")]
    UnknownStage { stage: String, known: String },

    /// The run id has no persisted Run record.
    #[error("run '{run_id}' not found")]
    RunNotFound { run_id: String },

    // ── I/O & config ──────────────────────────────────────────────────────
    /// Could not create or write an artifact file.
    #[error("failed to write artifact '{path}': {source}")]
    ArtifactWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error (task join failures and the like).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-mapping outcome, recorded in diagnostics and never thrown.
///
/// Produced fresh on every attack run. The serialized snake_case names
/// are part of the diagnostics JSON contract consumed by the reporting
/// layer, so they are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    /// The mapping's original text was found and rewritten.
    Replaced,
    /// The original text does not occur in the mapping's segment
    /// (or anywhere, in global-fallback mode).
    NotFound,
    /// The match would claim a character range another mapping already
    /// occupies; rejected, never merged silently.
    OverlapConflict,
    /// A character in the pair has no glyph in the base font.
    MissingGlyph,
    /// The hidden/visual pairing is unusable (e.g. unequal alphanumeric
    /// runs) and no per-character plan can be built.
    InvalidMapping,
    /// The question has no validated mapping at all.
    NoMapping,
    /// Prevention mode only: the question's stem text could not be
    /// located in the typeset source.
    StemNotFound,
}

impl MappingStatus {
    /// True when the mapping actually changed the source.
    pub fn is_applied(self) -> bool {
        matches!(self, MappingStatus::Replaced)
    }
}

impl std::fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MappingStatus::Replaced => "replaced",
            MappingStatus::NotFound => "not_found",
            MappingStatus::OverlapConflict => "overlap_conflict",
            MappingStatus::MissingGlyph => "missing_glyph",
            MappingStatus::InvalidMapping => "invalid_mapping",
            MappingStatus::NoMapping => "no_mapping",
            MappingStatus::StemNotFound => "stem_not_found",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_failure_display() {
        let e = AttackError::CompileFailure {
            method: "dual_layer",
            pass: 2,
            detail: "exit status 1".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("dual_layer"), "got: {msg}");
        assert!(msg.contains("pass 2"), "got: {msg}");
    }

    #[test]
    fn mapping_status_serialises_snake_case() {
        let json = serde_json::to_string(&MappingStatus::OverlapConflict).unwrap();
        assert_eq!(json, "\"overlap_conflict\"");
        let back: MappingStatus = serde_json::from_str("\"stem_not_found\"").unwrap();
        assert_eq!(back, MappingStatus::StemNotFound);
    }

    #[test]
    fn only_replaced_counts_as_applied() {
        assert!(MappingStatus::Replaced.is_applied());
        assert!(!MappingStatus::NotFound.is_applied());
        assert!(!MappingStatus::NoMapping.is_applied());
    }
}
