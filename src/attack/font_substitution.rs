//! Font glyph-substitution attack.
//!
//! The text stream of the output carries the replacement (hidden) code
//! points, but each one is typeset in a custom font whose glyph for that
//! code point is the original (visual) character's shape. Extraction
//! reads the planted text; the page looks untouched.
//!
//! Detection mode substitutes each validated mapping character by
//! character. Prevention mode blankets every question stem: each
//! alphanumeric character is replaced by the universal hidden code point
//! typeset in a font that renders the original glyph, so a scraper reads
//! a run of meaningless private-use characters.

use crate::attack::{
    cached_result, load_source, record_success, write_artifact, ArtifactPaths, AttackResult,
    MappingDiagnostic, ReplacementSummary,
};
use crate::config::{AttackGoal, AttackMethod, PipelineConfig};
use crate::document::StructuredDocument;
use crate::error::{AttackError, MappingStatus};
use crate::font::{plan_pair, BaseFont, FontBuilder, PlannedChar, UNIVERSAL_HIDDEN};
use crate::latex::compile::{compile, prepare_workdir, stage_fonts, TexEngine};
use crate::latex::insert_into_preamble;
use crate::latex::segment::{apply_substitutions, SubstitutionRequest};
use crate::signature::{is_cached, signature, CacheMetadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{info, warn};

const TEX_FILE: &str = "font_substitution_attacked.tex";

/// One planned substitution job, recorded in the method's extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackJob {
    pub attack_id: String,
    pub mapping_id: String,
    pub visual_text: String,
    pub hidden_text: String,
    /// Family id used at each planned position.
    pub families: Vec<String>,
}

pub async fn run(
    doc: &mut StructuredDocument,
    config: &PipelineConfig,
) -> Result<AttackResult, AttackError> {
    let method = AttackMethod::FontSubstitution;
    let paths = ArtifactPaths::new(&config.artifact_root, method);

    // The base face is required for every substitution; fail the whole
    // method before any artifact I/O when it is absent.
    let base = match BaseFont::load(&config.base_font) {
        Ok(base) => base,
        Err(e) => {
            doc.record_method_error(method.name(), &e.to_string());
            return Err(e);
        }
    };

    let (source, fingerprint) = load_source(doc)?;
    let sig = signature(&doc.questions, &fingerprint);
    if let Some(meta) = is_cached(&paths.metadata, &sig, config.force) {
        if let Some(result) = cached_result(meta.result) {
            info!("font_substitution: signature unchanged, returning cached result");
            record_success(doc, method, &paths, &result);
            return Ok(result);
        }
    }

    paths.ensure_dir()?;
    let mut builder = FontBuilder::new(
        base,
        paths.fonts_dir.clone(),
        config.font_library.clone(),
    );

    let mut diagnostics = Vec::new();
    let mut requests = Vec::new();
    let mut jobs: Vec<AttackJob> = Vec::new();
    // (family, file name) pairs for the deduplicated preamble block.
    let mut declared: BTreeSet<(String, String)> = BTreeSet::new();

    match config.goal {
        AttackGoal::Detection => {
            for (qi, q) in doc.questions.iter().enumerate() {
                let mut any = false;
                for m in q.validated_mappings() {
                    any = true;
                    let plan = match plan_pair(builder.base(), &m.original, &m.replacement) {
                        Ok(plan) => plan,
                        Err(status) => {
                            diagnostics.push(MappingDiagnostic::simple(m.id.clone(), status));
                            continue;
                        }
                    };
                    match render_snippet(&m.original, &plan, &mut builder, &mut declared) {
                        Ok((snippet, families)) => {
                            jobs.push(AttackJob {
                                attack_id: format!("{}:{}", q.label(), m.id),
                                mapping_id: m.id.clone(),
                                visual_text: m.original.clone(),
                                hidden_text: m.replacement.clone(),
                                families,
                            });
                            requests.push(SubstitutionRequest {
                                mapping_id: m.id.clone(),
                                question_index: qi,
                                search: m.original.clone(),
                                replacement: snippet,
                                occurrence_index: m.occurrence_index,
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
                if !any {
                    diagnostics.push(MappingDiagnostic::with_note(
                        format!("{}:none", q.label()),
                        MappingStatus::NoMapping,
                        "question has no validated mapping",
                    ));
                }
            }
        }
        AttackGoal::Prevention => {
            for (qi, q) in doc.questions.iter().enumerate() {
                let mapping_id = format!("{}:stem", q.label());
                if q.stem_text.trim().is_empty() {
                    diagnostics.push(MappingDiagnostic::with_note(
                        mapping_id,
                        MappingStatus::StemNotFound,
                        "question has no stem text",
                    ));
                    continue;
                }
                let (snippet, families) =
                    blanket_snippet(&q.stem_text, &mut builder, &mut declared)?;
                jobs.push(AttackJob {
                    attack_id: format!("{}:stem", q.label()),
                    mapping_id: mapping_id.clone(),
                    visual_text: q.stem_text.clone(),
                    hidden_text: UNIVERSAL_HIDDEN.to_string(),
                    families,
                });
                requests.push(SubstitutionRequest {
                    mapping_id,
                    question_index: qi,
                    search: q.stem_text.clone(),
                    replacement: snippet,
                    occurrence_index: 0,
                });
            }
        }
    }

    let applied = apply_substitutions(&source, doc.questions.len(), &requests);
    if applied.global_fallback {
        doc.manipulation_results.debug.insert(
            "font_substitution_segmentation".into(),
            serde_json::Value::String("global fallback (segment/question count mismatch)".into()),
        );
    }
    for outcome in &applied.outcomes {
        let mut diag = MappingDiagnostic::from_outcome(outcome);
        // A stem that cannot be located gets its dedicated status.
        if config.goal == AttackGoal::Prevention && diag.status == MappingStatus::NotFound {
            diag.status = MappingStatus::StemNotFound;
        }
        diagnostics.push(diag);
    }

    let attacked = insert_into_preamble(&applied.rewritten, &preamble_block(&declared));
    write_artifact(&paths.attacked_tex, attacked.as_bytes())?;

    // ── Compile ──────────────────────────────────────────────────────
    let workdir = prepare_workdir(&attacked, TEX_FILE, doc.document.latex_path.parent())?;
    stage_fonts(workdir.path(), &builder.assets())?;
    let timeout = Duration::from_secs(config.compile_timeout_secs);
    let compiled = compile(TexEngine::Lualatex, workdir.path(), TEX_FILE, timeout).await;
    write_artifact(&paths.compile_log, compiled.log.as_bytes())?;

    let Some(compiled_pdf) = compiled.pdf_path.clone() else {
        let detail = compiled
            .summary
            .error
            .clone()
            .unwrap_or_else(|| "unknown compile error".into());
        doc.record_method_error(method.name(), &detail);
        return Err(AttackError::CompileFailure {
            method: "font_substitution",
            pass: compiled.summary.passes.len() as u8,
            detail,
        });
    };
    std::fs::copy(&compiled_pdf, &paths.final_pdf).map_err(|e| {
        AttackError::ArtifactWriteFailed {
            path: paths.final_pdf.clone(),
            source: e,
        }
    })?;

    // ── Persist ──────────────────────────────────────────────────────
    let stats = builder.stats();
    if stats.library_hits + stats.runtime_builds > 0 {
        info!(
            "font_substitution: {} library hits, {} runtime builds",
            stats.library_hits, stats.runtime_builds
        );
    }
    let result = AttackResult {
        method,
        success: true,
        cached: false,
        pdf_path: Some(paths.final_pdf.clone()),
        replacements: ReplacementSummary::from_diagnostics(&diagnostics),
        diagnostics,
        compile: Some(compiled.summary),
        overlay: None,
        extra: serde_json::json!({
            "library_hits": stats.library_hits,
            "runtime_builds": stats.runtime_builds,
            "jobs": jobs,
        }),
    };

    let meta = CacheMetadata {
        signature: sig,
        result: serde_json::to_value(&result)
            .map_err(|e| AttackError::Internal(format!("result serialise: {e}")))?,
    };
    meta.write(&paths.metadata)
        .map_err(|e| AttackError::ArtifactWriteFailed {
            path: paths.metadata.clone(),
            source: e,
        })?;
    record_success(doc, method, &paths, &result);
    info!(
        "font_substitution: {}/{} substitutions applied",
        result.replacements.replaced, result.replacements.total
    );
    Ok(result)
}

// ── Snippet construction ─────────────────────────────────────────────────

/// Rebuild `visual_text` as a LaTeX snippet where every planned position
/// types the hidden code point in its substitution font. Unplanned
/// positions and non-alphanumeric characters pass through verbatim.
fn render_snippet(
    visual_text: &str,
    plan: &[PlannedChar],
    builder: &mut FontBuilder,
    declared: &mut BTreeSet<(String, String)>,
) -> Result<(String, Vec<String>), AttackError> {
    let planned: HashMap<usize, &PlannedChar> = plan.iter().map(|p| (p.position, p)).collect();
    let mut snippet = String::with_capacity(visual_text.len() * 2);
    let mut families = Vec::with_capacity(plan.len());
    let mut alnum_pos = 0usize;
    for ch in visual_text.chars() {
        if ch.is_alphanumeric() {
            if let Some(p) = planned.get(&alnum_pos) {
                let asset = builder.font_for(p.hidden, p.visual)?;
                declare(declared, &asset);
                snippet.push_str(&format!("\\gtuse{{{}}}{{{}}}", asset.family_id, p.hidden));
                families.push(asset.family_id);
            } else {
                snippet.push(ch);
            }
            alnum_pos += 1;
        } else {
            snippet.push(ch);
        }
    }
    Ok((snippet, families))
}

/// Prevention-mode snippet: every alphanumeric character of the stem is
/// typed as the universal hidden code point, rendered as itself.
fn blanket_snippet(
    stem: &str,
    builder: &mut FontBuilder,
    declared: &mut BTreeSet<(String, String)>,
) -> Result<(String, Vec<String>), AttackError> {
    let mut snippet = String::with_capacity(stem.len() * 2);
    let mut families = Vec::new();
    for ch in stem.chars() {
        if ch.is_alphanumeric() {
            match builder.font_for(UNIVERSAL_HIDDEN, ch) {
                Ok(asset) => {
                    declare(declared, &asset);
                    snippet.push_str(&format!(
                        "\\gtuse{{{}}}{{{UNIVERSAL_HIDDEN}}}",
                        asset.family_id
                    ));
                    families.push(asset.family_id);
                }
                Err(e) => {
                    // No glyph for this character in the base face; keep
                    // it readable rather than dropping it.
                    warn!("font_substitution: leaving '{ch}' visible: {e}");
                    snippet.push(ch);
                }
            }
        } else {
            snippet.push(ch);
        }
    }
    Ok((snippet, families))
}

fn declare(declared: &mut BTreeSet<(String, String)>, asset: &crate::font::FontAsset) {
    let file = asset
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    declared.insert((asset.family_id.clone(), file));
}

/// Preamble block: wrapper commands plus one deduplicated declaration
/// per substitution font. The wrappers degrade to plain text when the
/// font-loading package is unavailable, so the document still compiles
/// (without the attack) on a minimal TeX install.
fn preamble_block(declared: &BTreeSet<(String, String)>) -> String {
    let mut block = String::from(
        "\\IfFileExists{fontspec.sty}{%\n\
         \\usepackage{fontspec}%\n\
         \\newcommand{\\gtdeffont}[2]{\\expandafter\\newfontfamily\\csname gtfam#1\\endcsname[Path=./fonts/]{#2}}%\n\
         \\newcommand{\\gtuse}[2]{{\\csname gtfam#1\\endcsname #2}}%\n\
         }{%\n\
         \\newcommand{\\gtdeffont}[2]{}%\n\
         \\newcommand{\\gtuse}[2]{#2}%\n\
         }\n",
    );
    for (family, file) in declared {
        block.push_str(&format!("\\gtdeffont{{{family}}}{{{file}}}\n"));
    }
    block
}
