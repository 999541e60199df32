//! Dual-layer overlay attack.
//!
//! The text layer of the output carries the replacement text (that is
//! what the recompiled PDF extracts to), while the visual layer shows
//! the original: crops of the original document's raster are pasted
//! over every region the rewrite changed. A grader that reads the text
//! stream sees the planted answers; a human sees the untouched exam.
//!
//! Failure posture: a mapping that cannot be found or placed degrades to
//! a diagnostic (and, for placement, a full-page fallback stamp); only a
//! failed compile aborts the method.

use crate::attack::{
    cached_result, load_source, record_success, write_artifact, ArtifactPaths, AttackResult,
    MappingDiagnostic, OverlaySummary, PageMode, ReplacementSummary,
};
use crate::config::{AttackMethod, PipelineConfig};
use crate::document::{StructuredDocument, SubstringMapping};
use crate::error::{AttackError, MappingStatus};
use crate::geometry::{pad_and_merge, resolve_page, resolve_rect, PageRect, Rect};
use crate::latex::compile::{compile, prepare_workdir, TexEngine};
use crate::latex::segment::{
    apply_substitutions, rewrite_list_environments, SubstitutionRequest, LIST_VARIANT_DEFS,
};
use crate::latex::insert_into_preamble;
use crate::render::{
    crop_region, page_geometry, render_pages, stamp_overlays, text_indices, OverlayPatch,
};
use crate::signature::{is_cached, signature, CacheMetadata};
use image::DynamicImage;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Page dimensions within this tolerance (points) are treated as equal
/// and crops are placed without rescaling.
const PAGE_SIZE_TOLERANCE_PT: f32 = 0.25;

const TEX_FILE: &str = "dual_layer_attacked.tex";

pub async fn run(
    doc: &mut StructuredDocument,
    config: &PipelineConfig,
) -> Result<AttackResult, AttackError> {
    let method = AttackMethod::DualLayer;
    let paths = ArtifactPaths::new(&config.artifact_root, method);
    let (source, fingerprint) = load_source(doc)?;
    let sig = signature(&doc.questions, &fingerprint);

    if let Some(meta) = is_cached(&paths.metadata, &sig, config.force) {
        if let Some(result) = cached_result(meta.result) {
            info!("dual_layer: signature unchanged, returning cached result");
            record_success(doc, method, &paths, &result);
            return Ok(result);
        }
    }

    // ── Rewrite ──────────────────────────────────────────────────────
    let mut diagnostics = Vec::new();
    let mut requests = Vec::new();
    for (qi, q) in doc.questions.iter().enumerate() {
        let mut any = false;
        for m in q.validated_mappings() {
            any = true;
            requests.push(SubstitutionRequest {
                mapping_id: m.id.clone(),
                question_index: qi,
                search: m.original.clone(),
                replacement: m.replacement.clone(),
                occurrence_index: m.occurrence_index,
            });
        }
        if !any {
            diagnostics.push(MappingDiagnostic::with_note(
                format!("{}:none", q.label()),
                MappingStatus::NoMapping,
                "question has no validated mapping",
            ));
        }
    }

    let applied = apply_substitutions(&source, doc.questions.len(), &requests);
    if applied.global_fallback {
        doc.manipulation_results.debug.insert(
            "dual_layer_segmentation".into(),
            serde_json::Value::String("global fallback (segment/question count mismatch)".into()),
        );
    }
    diagnostics.extend(applied.outcomes.iter().map(MappingDiagnostic::from_outcome));

    let (restructured, rewritten_lists) = rewrite_list_environments(&applied.rewritten);
    let attacked = if rewritten_lists > 0 {
        insert_into_preamble(&restructured, LIST_VARIANT_DEFS)
    } else {
        restructured
    };

    paths.ensure_dir()?;
    write_artifact(&paths.attacked_tex, attacked.as_bytes())?;

    // ── Compile ──────────────────────────────────────────────────────
    let workdir = prepare_workdir(&attacked, TEX_FILE, doc.document.latex_path.parent())?;
    let timeout = Duration::from_secs(config.compile_timeout_secs);
    let compiled = compile(TexEngine::Pdflatex, workdir.path(), TEX_FILE, timeout).await;
    write_artifact(&paths.compile_log, compiled.log.as_bytes())?;

    let Some(compiled_pdf) = compiled.pdf_path.clone() else {
        let detail = compiled
            .summary
            .error
            .clone()
            .unwrap_or_else(|| "unknown compile error".into());
        doc.record_method_error(method.name(), &detail);
        return Err(AttackError::CompileFailure {
            method: "dual_layer",
            pass: compiled.summary.passes.len() as u8,
            detail,
        });
    };

    // ── Geometry ─────────────────────────────────────────────────────
    // Index mappings by id so substitution outcomes can be joined back
    // to their question's layout metadata.
    let mut by_id: HashMap<&str, (usize, &SubstringMapping)> = HashMap::new();
    for (qi, q) in doc.questions.iter().enumerate() {
        for m in &q.mappings {
            by_id.insert(m.id.as_str(), (qi, m));
        }
    }

    let mut missing_targets = Vec::new();
    let mut paged: Vec<(u32, &SubstringMapping, usize)> = Vec::new();
    for outcome in &applied.outcomes {
        if outcome.status != MappingStatus::Replaced {
            continue;
        }
        let Some(&(qi, mapping)) = by_id.get(outcome.mapping_id.as_str()) else {
            continue;
        };
        let positioning = doc.questions[qi].positioning.as_ref();
        match resolve_page(mapping, positioning) {
            Some(page) => paged.push((page, mapping, qi)),
            None => {
                warn!("dual_layer: no page resolvable for mapping '{}'", mapping.id);
                missing_targets.push(mapping.id.clone());
            }
        }
    }

    let pages_needed: Vec<u32> = paged
        .iter()
        .map(|&(p, _, _)| p)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let original_pdf = &doc.document.source_path;
    let original_geometry = page_geometry(original_pdf).await?;
    let attacked_geometry = page_geometry(&compiled_pdf).await?;
    let attacked_pages = attacked_geometry.len() as u32;
    let indices = text_indices(original_pdf, &pages_needed).await?;
    let rendered = render_pages(original_pdf, &pages_needed, config.overlay_zoom).await?;
    let rendered: BTreeMap<u32, _> = rendered.into_iter().map(|r| (r.page, r)).collect();

    let mut regions: Vec<PageRect> = Vec::new();
    let mut fallback_pages: BTreeSet<u32> = BTreeSet::new();
    let mut selective_pages: BTreeSet<u32> = BTreeSet::new();
    let mut absent_pages: BTreeSet<u32> = BTreeSet::new();
    for (page, mapping, qi) in &paged {
        // Recompilation may reflow the document onto fewer pages; a
        // target page that no longer exists cannot take any stamp.
        if !stampable_page(*page, attacked_pages) {
            warn!(
                "dual_layer: page {page} for mapping '{}' is outside the recompiled \
                 output ({attacked_pages} pages)",
                mapping.id
            );
            missing_targets.push(mapping.id.clone());
            absent_pages.insert(*page);
            continue;
        }
        let positioning = doc.questions[*qi].positioning.as_ref();
        match resolve_rect(mapping, positioning, indices.get(page)) {
            Some((rect, source_kind)) => {
                info!(
                    "dual_layer: mapping '{}' placed on page {page} via {source_kind:?}",
                    mapping.id
                );
                regions.push(PageRect { page: *page, rect });
                selective_pages.insert(*page);
            }
            None => {
                warn!(
                    "dual_layer: no rectangle for mapping '{}' on page {page}, \
                     falling back to full-page stamp",
                    mapping.id
                );
                missing_targets.push(mapping.id.clone());
                fallback_pages.insert(*page);
            }
        }
    }

    let merged = pad_and_merge(&regions, config.overlay_padding_pt);

    // ── Stamp ────────────────────────────────────────────────────────
    let mut patches = Vec::new();
    let mut page_modes: BTreeMap<u32, PageMode> = BTreeMap::new();

    for &page in &fallback_pages {
        let Some(render) = rendered.get(&page) else {
            continue;
        };
        let att = attacked_geometry.get(page as usize - 1);
        let (w, h) = att
            .map(|g| (g.width_pt, g.height_pt))
            .unwrap_or((render.width_pt, render.height_pt));
        patches.push(OverlayPatch {
            page,
            rect: Rect::new(0.0, 0.0, w, h),
            image: render.image.clone(),
        });
        let mode = if selective_pages.contains(&page) {
            PageMode::Mixed
        } else {
            PageMode::FullPageFallback
        };
        page_modes.insert(page, mode);
    }

    let mut crop_counters: BTreeMap<u32, usize> = BTreeMap::new();
    for region in &merged {
        // A full-page stamp already covers everything on its page.
        if fallback_pages.contains(&region.page) {
            continue;
        }
        let Some(render) = rendered.get(&region.page) else {
            continue;
        };
        let image = crop_region(render, &region.rect);
        let crop_index = crop_counters.entry(region.page).or_insert(0);
        save_crop(&paths.crops_dir, region.page, *crop_index, &image)?;
        *crop_index += 1;

        let target = match (
            original_geometry.get(region.page as usize - 1),
            attacked_geometry.get(region.page as usize - 1),
        ) {
            (Some(orig), Some(att))
                if (orig.width_pt - att.width_pt).abs() > PAGE_SIZE_TOLERANCE_PT
                    || (orig.height_pt - att.height_pt).abs() > PAGE_SIZE_TOLERANCE_PT =>
            {
                region
                    .rect
                    .scaled(att.width_pt / orig.width_pt, att.height_pt / orig.height_pt)
            }
            _ => region.rect,
        };
        patches.push(OverlayPatch {
            page: region.page,
            rect: target,
            image,
        });
        page_modes.entry(region.page).or_insert(PageMode::Selective);
    }
    for &page in &absent_pages {
        page_modes.insert(page, PageMode::FullPageFallback);
    }
    for page in pages_needed {
        page_modes.entry(page).or_insert(PageMode::Untouched);
    }

    let overlay_count = patches.len();
    stamp_overlays(&compiled_pdf, patches, &paths.final_pdf).await?;

    // ── Persist ──────────────────────────────────────────────────────
    let result = AttackResult {
        method,
        success: true,
        cached: false,
        pdf_path: Some(paths.final_pdf.clone()),
        replacements: ReplacementSummary::from_diagnostics(&diagnostics),
        diagnostics,
        compile: Some(compiled.summary),
        overlay: Some(OverlaySummary {
            success: true,
            overlay_count,
            pages: page_modes,
            missing_targets,
        }),
        extra: serde_json::Value::Null,
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
        "dual_layer: {}/{} mappings replaced, {} overlays",
        result.replacements.replaced, result.replacements.total, overlay_count
    );
    Ok(result)
}

/// Whether a 1-indexed page exists in the recompiled document.
fn stampable_page(page: u32, attacked_pages: u32) -> bool {
    page >= 1 && page <= attacked_pages
}

/// Persist one merged-region crop as a standalone asset next to the
/// method's other artifacts.
fn save_crop(
    crops_dir: &Path,
    page: u32,
    index: usize,
    image: &DynamicImage,
) -> Result<PathBuf, AttackError> {
    std::fs::create_dir_all(crops_dir).map_err(|e| AttackError::ArtifactWriteFailed {
        path: crops_dir.to_path_buf(),
        source: e,
    })?;
    let path = crops_dir.join(format!("page{page}_{index}.png"));
    image
        .save(&path)
        .map_err(|e| AttackError::Internal(format!("crop save '{}': {e}", path.display())))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_outside_the_recompiled_output_are_not_stampable() {
        assert!(stampable_page(1, 3));
        assert!(stampable_page(3, 3));
        assert!(!stampable_page(4, 3), "reflowed-away page");
        assert!(!stampable_page(0, 3), "page hints are 1-indexed");
    }

    #[test]
    fn crops_are_written_as_standalone_assets() {
        let dir = tempfile::tempdir().unwrap();
        let crops = dir.path().join("crops");
        let image = DynamicImage::new_rgba8(4, 4);
        let path = save_crop(&crops, 2, 0, &image).unwrap();
        assert_eq!(path, crops.join("page2_0.png"));
        assert!(path.exists());
    }
}
