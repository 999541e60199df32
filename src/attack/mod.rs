//! The three attack engines and their shared result contract.
//!
//! Every engine follows the same outline: compute the mapping signature,
//! return the cached result on a signature match, otherwise rewrite the
//! typeset source, compile it, finalise a PDF, and persist artifacts
//! plus a diagnostics payload under `artifacts/<method>/`. The engines
//! degrade per mapping (a failed substitution becomes a diagnostic, not
//! an error) and fail per method only on structural problems: a missing
//! base asset or a failed compile.
//!
//! 1. [`dual_layer`] — recompile with replacement text, paste crops of
//!    the original render over every changed region
//! 2. [`font_substitution`] — per-character fonts whose rendered glyph
//!    differs from the extracted code point
//! 3. [`watermark`] — zero-visual-footprint instruction text, one entry
//!    per question

pub mod dual_layer;
pub mod font_substitution;
pub mod watermark;

use crate::config::AttackMethod;
use crate::document::{SourceFingerprint, StructuredDocument};
use crate::error::{AttackError, MappingStatus};
use crate::latex::compile::CompileSummary;
use crate::latex::segment::SubstitutionOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ── Artifact layout ──────────────────────────────────────────────────────

/// Canonical artifact locations for one method under the artifact root.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
    pub metadata: PathBuf,
    pub attacked_tex: PathBuf,
    pub compile_log: PathBuf,
    pub final_pdf: PathBuf,
    pub fonts_dir: PathBuf,
    pub crops_dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(artifact_root: &Path, method: AttackMethod) -> Self {
        let dir = artifact_root.join(method.name());
        Self {
            metadata: dir.join("metadata.json"),
            attacked_tex: dir.join(format!("{}_attacked.tex", method.name())),
            compile_log: dir.join(format!("{}_compile.log", method.name())),
            final_pdf: dir.join(format!("{}_final.pdf", method.name())),
            fonts_dir: dir.join("fonts"),
            crops_dir: dir.join("crops"),
            dir,
        }
    }

    pub fn ensure_dir(&self) -> Result<(), AttackError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| AttackError::ArtifactWriteFailed {
            path: self.dir.clone(),
            source: e,
        })
    }
}

pub(crate) fn write_artifact(path: &Path, contents: &[u8]) -> Result<(), AttackError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AttackError::ArtifactWriteFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, contents).map_err(|e| AttackError::ArtifactWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

// ── Diagnostics ──────────────────────────────────────────────────────────

/// Per-mapping outcome recorded in the diagnostics payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDiagnostic {
    pub mapping_id: String,
    pub status: MappingStatus,
    /// The exact source fragment that matched, when one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
    /// Absolute character span in the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<(usize, usize)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MappingDiagnostic {
    pub fn simple(mapping_id: impl Into<String>, status: MappingStatus) -> Self {
        Self {
            mapping_id: mapping_id.into(),
            status,
            matched: None,
            span: None,
            note: None,
        }
    }

    pub fn with_note(mapping_id: impl Into<String>, status: MappingStatus, note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::simple(mapping_id, status)
        }
    }

    pub fn from_outcome(o: &SubstitutionOutcome) -> Self {
        Self {
            mapping_id: o.mapping_id.clone(),
            status: o.status,
            matched: o.matched.clone(),
            span: o.span,
            note: None,
        }
    }
}

/// Replacement totals across a method's diagnostics.
///
/// `total` counts real mapping attempts. Questions without a validated
/// mapping contribute a placeholder diagnostic tallied separately under
/// `no_mapping`; those never inflate the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementSummary {
    pub total: usize,
    pub replaced: usize,
    pub not_found: usize,
    pub no_mapping: usize,
}

impl ReplacementSummary {
    pub fn from_diagnostics(diags: &[MappingDiagnostic]) -> Self {
        let mut s = Self::default();
        for d in diags {
            match d.status {
                MappingStatus::NoMapping => s.no_mapping += 1,
                MappingStatus::Replaced => {
                    s.total += 1;
                    s.replaced += 1;
                }
                _ => {
                    s.total += 1;
                    s.not_found += 1;
                }
            }
        }
        s
    }
}

// ── Overlay summary ──────────────────────────────────────────────────────

/// How a page was finalised by the overlay method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMode {
    /// No overlay needed on this page.
    Untouched,
    /// Crops pasted over the resolved regions only.
    Selective,
    /// Geometry could not be resolved; the whole original page raster
    /// was stamped over the recompiled page.
    FullPageFallback,
    /// Some regions resolved, some did not, on the same page.
    Mixed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlaySummary {
    pub success: bool,
    pub overlay_count: usize,
    /// Per-page finalisation mode, keyed by 1-indexed page.
    pub pages: BTreeMap<u32, PageMode>,
    /// Mapping ids whose geometry could not be resolved at all.
    pub missing_targets: Vec<String>,
}

// ── Result contract ──────────────────────────────────────────────────────

/// What every engine returns and what the cache stores verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackResult {
    pub method: AttackMethod,
    pub success: bool,
    /// True when this result came from the signature cache untouched.
    #[serde(default)]
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<PathBuf>,
    pub replacements: ReplacementSummary,
    pub diagnostics: Vec<MappingDiagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlaySummary>,
    /// Method-specific extras (font build stats, watermark entry count).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

// ── Shared engine steps ──────────────────────────────────────────────────

/// Read the typeset source named by the document and pin its identity.
pub(crate) fn load_source(
    doc: &StructuredDocument,
) -> Result<(String, SourceFingerprint), AttackError> {
    let path = &doc.document.latex_path;
    let data = std::fs::read(path).map_err(|_| AttackError::SourceNotFound {
        path: path.clone(),
    })?;
    let fingerprint = SourceFingerprint::of_bytes(path, &data);
    let source = String::from_utf8_lossy(&data).into_owned();
    Ok((source, fingerprint))
}

/// Decode a cached result payload, marking it as served from cache.
pub(crate) fn cached_result(stored: serde_json::Value) -> Option<AttackResult> {
    let mut result: AttackResult = serde_json::from_value(stored).ok()?;
    result.cached = true;
    Some(result)
}

/// Record a successful method run on the shared document.
pub(crate) fn record_success(
    doc: &mut StructuredDocument,
    method: AttackMethod,
    paths: &ArtifactPaths,
    result: &AttackResult,
) {
    if let Some(pdf) = &result.pdf_path {
        doc.manipulation_results
            .enhanced_pdfs
            .insert(method.name().to_string(), pdf.clone());
    }
    doc.manipulation_results
        .artifacts
        .insert(method.name().to_string(), paths.dir.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_paths_follow_method_layout() {
        let p = ArtifactPaths::new(Path::new("artifacts"), AttackMethod::DualLayer);
        assert_eq!(p.metadata, Path::new("artifacts/dual_layer/metadata.json"));
        assert_eq!(
            p.attacked_tex,
            Path::new("artifacts/dual_layer/dual_layer_attacked.tex")
        );
        assert_eq!(
            p.final_pdf,
            Path::new("artifacts/dual_layer/dual_layer_final.pdf")
        );
        assert_eq!(p.fonts_dir, Path::new("artifacts/dual_layer/fonts"));
        assert_eq!(p.crops_dir, Path::new("artifacts/dual_layer/crops"));
    }

    #[test]
    fn replacement_summary_counts_statuses() {
        let diags = vec![
            MappingDiagnostic::simple("a", MappingStatus::Replaced),
            MappingDiagnostic::simple("b", MappingStatus::NotFound),
            MappingDiagnostic::simple("c", MappingStatus::OverlapConflict),
            MappingDiagnostic::simple("d", MappingStatus::NoMapping),
        ];
        let s = ReplacementSummary::from_diagnostics(&diags);
        assert_eq!(s.total, 3);
        assert_eq!(s.replaced, 1);
        assert_eq!(s.not_found, 2);
        assert_eq!(s.no_mapping, 1);
    }

    #[test]
    fn no_mapping_placeholders_stay_out_of_the_total() {
        // Two questions, one validated mapping: the placeholder for the
        // unmapped question must not count as a mapping attempt.
        let diags = vec![
            MappingDiagnostic::simple("q1_m1", MappingStatus::Replaced),
            MappingDiagnostic::simple("q2:none", MappingStatus::NoMapping),
        ];
        let s = ReplacementSummary::from_diagnostics(&diags);
        assert_eq!(s.total, 1);
        assert_eq!(s.replaced, 1);
        assert_eq!(s.not_found, 0);
        assert_eq!(s.no_mapping, 1);
    }

    #[test]
    fn cached_result_sets_flag() {
        let result = AttackResult {
            method: AttackMethod::Watermark,
            success: true,
            cached: false,
            pdf_path: None,
            replacements: ReplacementSummary::default(),
            diagnostics: vec![],
            compile: None,
            overlay: None,
            extra: serde_json::Value::Null,
        };
        let stored = serde_json::to_value(&result).unwrap();
        let back = cached_result(stored).unwrap();
        assert!(back.cached);
        assert_eq!(back.method, AttackMethod::Watermark);
    }
}
