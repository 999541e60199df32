//! # gradetrap
//!
//! Adversarial hardening for PDF assessments against automated graders.
//!
//! ## Why this crate?
//!
//! Scraping-based graders read a PDF's text stream, not its pixels. That
//! gap is measurable: this crate plants controlled divergence between
//! what a document *extracts to* and what it *renders as*, producing
//! benchmark PDFs that look identical to the original exam while their
//! text layer tells a different story. Three techniques cover the
//! spectrum, from region-level (overlay) through character-level (font
//! remapping) to pure injection (watermark).
//!
//! ## Pipeline Overview
//!
//! ```text
//! structured document (JSON)
//!  │
//!  ├─ 1. Prepare    validate document + typeset source
//!  ├─ 2. DualLayer  rewrite → pdflatex → paste original crops over edits
//!  ├─ 3. FontSub    per-char remap fonts → lualatex (hidden ≠ visual)
//!  ├─ 4. Watermark  zero-size hidden instructions, one per question
//!  └─ 5. Scoring    grader collaborator (seam only; impl out of scope)
//! ```
//!
//! Stages are persisted per run and resumable: completed stages are
//! skipped, generation is cached by mapping signature, and a failed
//! stage fails the run loudly rather than silently continuing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gradetrap::{AttackMethod, PipelineConfig, StructuredDocument};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .methods([AttackMethod::Watermark])
//!         .artifact_root("artifacts")
//!         .build()?;
//!     let mut doc = StructuredDocument::load("exam.json".as_ref())?;
//!     let result = gradetrap::attack::watermark::run(&mut doc, &config).await?;
//!     println!("{} hidden entries, cached={}",
//!         result.replacements.replaced, result.cached);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `gradetrap` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! gradetrap = { version = "0.3", default-features = false }
//! ```
//!
//! ## External collaborators
//!
//! The crate drives two external programs and one external service:
//! pdfium (via `pdfium-render`) for rasterisation, text geometry, and
//! overlay stamping; a TeX engine (`pdflatex` / `lualatex`) as a
//! subprocess for recompilation; and an out-of-scope grading model
//! behind the [`scoring::GraderClient`] seam.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod attack;
pub mod config;
pub mod document;
pub mod error;
pub mod font;
pub mod geometry;
pub mod latex;
pub mod orchestrator;
pub mod render;
pub mod scoring;
pub mod signature;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use attack::{AttackResult, MappingDiagnostic, OverlaySummary, PageMode, ReplacementSummary};
pub use config::{AttackGoal, AttackMethod, PipelineConfig, PipelineConfigBuilder, PipelineMode};
pub use document::{
    LoadedQuestion, SourceFingerprint, StructuredDocument, StructuredQuestion, SubstringMapping,
};
pub use error::{AttackError, MappingStatus};
pub use orchestrator::{
    Orchestrator, RunHandle, RunReport, StageContext, StageEvent, StageService, CANONICAL_STAGES,
};
pub use store::{InMemoryStore, Run, RunStatus, RunStore, StageRecord, StageStatus, StageStore};
