//! The shared structured document: the single JSON artifact every stage
//! reads and rewrites wholesale.
//!
//! The content-discovery front end (out of scope) produces this file;
//! the attack engines consume mapping and path fields from it and write
//! artifact paths plus diagnostics back under `manipulation_results`.
//! There is no fine-grained locking: the orchestrator's strictly
//! sequential stage execution is the sole concurrency-safety mechanism
//! for this resource, so load → mutate → save is always a whole-file
//! round trip.

use crate::error::AttackError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level structured document contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredDocument {
    pub document: DocumentPaths,
    #[serde(default)]
    pub questions: Vec<StructuredQuestion>,
    #[serde(default)]
    pub manipulation_results: ManipulationResults,
}

/// Paths to the raw upload and its typeset source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentPaths {
    /// The original uploaded PDF.
    pub source_path: PathBuf,
    /// The typeset (LaTeX) source the attacks rewrite.
    pub latex_path: PathBuf,
}

/// One discovered question with its layout metadata and attack intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredQuestion {
    pub question_number: u32,
    #[serde(default)]
    pub stem_text: String,
    /// Lettered options, e.g. `{"A": "...", "B": "..."}`. BTreeMap keeps
    /// serialisation order deterministic for signature stability.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub positioning: Option<QuestionPositioning>,
    #[serde(default)]
    pub mappings: Vec<SubstringMapping>,
}

impl StructuredQuestion {
    /// Label used in diagnostics and mapping signatures, e.g. `"q3"`.
    pub fn label(&self) -> String {
        format!("q{}", self.question_number)
    }

    /// Validated mappings only, in declaration order.
    pub fn validated_mappings(&self) -> impl Iterator<Item = &SubstringMapping> {
        self.mappings.iter().filter(|m| m.validated)
    }
}

/// Layout metadata for one question on the rendered original document.
///
/// Coordinates are PDF points with a bottom-left origin, matching what
/// the rendering collaborator reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionPositioning {
    /// 1-indexed page the question starts on.
    pub page: u32,
    /// Whole-question bounding box `[x0, y0, x1, y1]`.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    /// Bounding box of the stem alone.
    #[serde(default)]
    pub stem_bbox: Option<[f32; 4]>,
    /// Per-option boxes keyed by option letter.
    #[serde(default)]
    pub option_bboxes: BTreeMap<String, [f32; 4]>,
}

/// The atomic unit of attack intent: substitute one substring for
/// another within a specific question's source text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstringMapping {
    pub id: String,
    /// Text as it appears in the typeset source (and in the rendered PDF).
    pub original: String,
    /// Text a scraping grader should read instead.
    pub replacement: String,
    /// Surrounding context, for disambiguation and review.
    #[serde(default)]
    pub context: String,
    /// Only validated mappings participate in attacks and signatures.
    #[serde(default)]
    pub validated: bool,
    /// Optional explicit 1-indexed page hint.
    #[serde(default)]
    pub page: Option<u32>,
    /// Optional explicit bounding box `[x0, y0, x1, y1]` in points.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    /// Optional absolute character offsets in the source, if known.
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
    /// Which occurrence of `original` to target when it repeats (0-based).
    #[serde(default)]
    pub occurrence_index: usize,
}

/// Everything the attack stages write back into the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManipulationResults {
    /// Final per-method PDFs, keyed by method name.
    #[serde(default)]
    pub enhanced_pdfs: BTreeMap<String, PathBuf>,
    /// Per-method artifact directories.
    #[serde(default)]
    pub artifacts: BTreeMap<String, PathBuf>,
    /// Free-form debug entries (method errors, degraded-mode notes).
    #[serde(default)]
    pub debug: BTreeMap<String, serde_json::Value>,
    /// Written by the out-of-scope scoring collaborator.
    #[serde(default)]
    pub detection_report: Option<serde_json::Value>,
}

impl StructuredDocument {
    /// Load the document from its JSON file.
    pub fn load(path: &Path) -> Result<Self, AttackError> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AttackError::DocumentNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                AttackError::DocumentMalformed {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                }
            }
        })?;
        serde_json::from_str(&data).map_err(|e| AttackError::DocumentMalformed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Rewrite the document wholesale (temp file + rename, so a crashed
    /// stage never leaves a truncated JSON behind).
    pub fn save(&self, path: &Path) -> Result<(), AttackError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AttackError::Internal(format!("document serialise: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| AttackError::ArtifactWriteFailed {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, path).map_err(|e| AttackError::ArtifactWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Record a method-level error under `manipulation_results.debug`.
    pub fn record_method_error(&mut self, method: &str, detail: &str) {
        self.manipulation_results.debug.insert(
            format!("{method}_error"),
            serde_json::Value::String(detail.to_string()),
        );
    }
}

/// Content identity of the typeset source, pinned once per attack run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub path: PathBuf,
    /// Hex sha256 of the source bytes.
    pub sha256: String,
}

impl SourceFingerprint {
    /// Hash the source file at `path`.
    pub fn of_file(path: &Path) -> Result<Self, AttackError> {
        let data = std::fs::read(path).map_err(|_| AttackError::SourceNotFound {
            path: path.to_path_buf(),
        })?;
        Ok(Self::of_bytes(path, &data))
    }

    /// Hash already-loaded source bytes.
    pub fn of_bytes(path: &Path, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            path: path.to_path_buf(),
            sha256: format!("{:x}", hasher.finalize()),
        }
    }
}

/// A persisted question row paired with its structured overlay.
///
/// The relational layer stores question rows; the structured document
/// may carry richer layout/mapping data for the same question. The pair
/// is built once when questions are loaded, instead of grafting extra
/// attributes onto the row at runtime.
#[derive(Debug, Clone)]
pub struct LoadedQuestion {
    /// The external persistence row (schemaless from this crate's view).
    pub row: serde_json::Value,
    /// Matching structured question, when discovery produced one.
    pub structured: Option<StructuredQuestion>,
}

/// Pair persisted question rows with structured questions by number.
///
/// Rows whose `question_number` field is absent or unmatched keep
/// `structured: None`; unmatched structured questions are dropped (the
/// row set is authoritative for what exists).
pub fn pair_questions(
    rows: Vec<serde_json::Value>,
    structured: &[StructuredQuestion],
) -> Vec<LoadedQuestion> {
    rows.into_iter()
        .map(|row| {
            let number = row
                .get("question_number")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32);
            let overlay = number
                .and_then(|n| structured.iter().find(|q| q.question_number == n))
                .cloned();
            LoadedQuestion {
                row,
                structured: overlay,
            }
        })
        .collect()
}
