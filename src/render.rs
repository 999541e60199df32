//! PDF rendering collaborator: rasterisation, per-character text
//! geometry, and overlay stamping via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async
//! contexts. `tokio::task::spawn_blocking` moves the work onto the
//! blocking thread pool so Tokio worker threads never stall during
//! CPU-heavy rendering.
//!
//! ## Coordinate conventions
//!
//! PDF space is points with a bottom-left origin; raster space is pixels
//! with a top-left origin. [`pixel_box`] is the single place that flip
//! happens — everything above it works in points, everything below it
//! in pixels.

use crate::error::AttackError;
use crate::geometry::{PageTextIndex, Rect};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Physical size of one page, in points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width_pt: f32,
    pub height_pt: f32,
}

/// One rasterised page, with enough context to map points to pixels.
#[derive(Debug)]
pub struct RenderedPage {
    /// 1-indexed page number.
    pub page: u32,
    pub image: DynamicImage,
    pub width_pt: f32,
    pub height_pt: f32,
}

impl RenderedPage {
    /// Effective pixels-per-point of the raster.
    pub fn zoom(&self) -> f32 {
        self.image.width() as f32 / self.width_pt
    }
}

/// A cropped graphic to paste onto a page of the attacked PDF, placed
/// at `rect` (points, bottom-left origin).
#[derive(Debug)]
pub struct OverlayPatch {
    pub page: u32,
    pub rect: Rect,
    pub image: DynamicImage,
}

// ── Async entry points ───────────────────────────────────────────────────

/// Page sizes for every page of a PDF, without rendering anything.
pub async fn page_geometry(pdf: &Path) -> Result<Vec<PageGeometry>, AttackError> {
    let path = pdf.to_path_buf();
    run_blocking(move || page_geometry_blocking(&path)).await
}

/// Rasterise the given 1-indexed pages at `zoom` pixels per point.
pub async fn render_pages(
    pdf: &Path,
    pages: &[u32],
    zoom: f32,
) -> Result<Vec<RenderedPage>, AttackError> {
    let path = pdf.to_path_buf();
    let pages = pages.to_vec();
    run_blocking(move || render_pages_blocking(&path, &pages, zoom)).await
}

/// Per-character text geometry for the given 1-indexed pages.
pub async fn text_indices(
    pdf: &Path,
    pages: &[u32],
) -> Result<HashMap<u32, PageTextIndex>, AttackError> {
    let path = pdf.to_path_buf();
    let pages = pages.to_vec();
    run_blocking(move || text_indices_blocking(&path, &pages)).await
}

/// Paste `patches` onto the attacked PDF and write the result to `out`.
pub async fn stamp_overlays(
    pdf: &Path,
    patches: Vec<OverlayPatch>,
    out: &Path,
) -> Result<(), AttackError> {
    let path = pdf.to_path_buf();
    let out = out.to_path_buf();
    run_blocking(move || stamp_overlays_blocking(&path, patches, &out)).await
}

async fn run_blocking<T, F>(f: F) -> Result<T, AttackError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AttackError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AttackError::Internal(format!("render task panicked: {e}")))?
}

// ── Blocking implementations ─────────────────────────────────────────────

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, AttackError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| AttackError::RenderFailed {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })
}

fn page_geometry_blocking(path: &Path) -> Result<Vec<PageGeometry>, AttackError> {
    let pdfium = Pdfium::default();
    let document = open(&pdfium, path)?;
    let pages = document.pages();
    let mut out = Vec::with_capacity(pages.len() as usize);
    for idx in 0..pages.len() {
        let page = pages.get(idx).map_err(|e| AttackError::RenderFailed {
            path: path.to_path_buf(),
            detail: format!("page {}: {e:?}", idx + 1),
        })?;
        out.push(PageGeometry {
            width_pt: page.width().value,
            height_pt: page.height().value,
        });
    }
    debug!("{}: {} pages", path.display(), out.len());
    Ok(out)
}

fn render_pages_blocking(
    path: &Path,
    pages: &[u32],
    zoom: f32,
) -> Result<Vec<RenderedPage>, AttackError> {
    let pdfium = Pdfium::default();
    let document = open(&pdfium, path)?;
    let doc_pages = document.pages();
    let total = doc_pages.len() as u32;

    let mut out = Vec::with_capacity(pages.len());
    for &page_no in pages {
        if page_no == 0 || page_no > total {
            warn!("skipping page {page_no} (document has {total})");
            continue;
        }
        let page =
            doc_pages
                .get((page_no - 1) as u16)
                .map_err(|e| AttackError::RenderFailed {
                    path: path.to_path_buf(),
                    detail: format!("page {page_no}: {e:?}"),
                })?;
        let width_pt = page.width().value;
        let height_pt = page.height().value;

        let render_config =
            PdfRenderConfig::new().set_target_width((width_pt * zoom).round() as i32);
        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| AttackError::RenderFailed {
                    path: path.to_path_buf(),
                    detail: format!("rasterise page {page_no}: {e:?}"),
                })?;
        let image = bitmap.as_image();
        debug!(
            "rendered page {page_no} → {}x{} px",
            image.width(),
            image.height()
        );
        out.push(RenderedPage {
            page: page_no,
            image,
            width_pt,
            height_pt,
        });
    }
    Ok(out)
}

fn text_indices_blocking(
    path: &Path,
    pages: &[u32],
) -> Result<HashMap<u32, PageTextIndex>, AttackError> {
    let pdfium = Pdfium::default();
    let document = open(&pdfium, path)?;
    let doc_pages = document.pages();
    let total = doc_pages.len() as u32;

    let mut out = HashMap::with_capacity(pages.len());
    for &page_no in pages {
        if page_no == 0 || page_no > total {
            continue;
        }
        let page =
            doc_pages
                .get((page_no - 1) as u16)
                .map_err(|e| AttackError::RenderFailed {
                    path: path.to_path_buf(),
                    detail: format!("page {page_no}: {e:?}"),
                })?;
        let text = page.text().map_err(|e| AttackError::RenderFailed {
            path: path.to_path_buf(),
            detail: format!("text layer page {page_no}: {e:?}"),
        })?;

        let mut index = PageTextIndex::default();
        for ch in text.chars().iter() {
            let Some(c) = ch.unicode_char() else { continue };
            let rect = match ch.loose_bounds() {
                Ok(b) => Rect::new(b.left.value, b.bottom.value, b.right.value, b.top.value),
                // Whitespace often has no sensible box; keep position in
                // the stream with a zero rect so searches stay aligned.
                Err(_) => Rect::new(0.0, 0.0, 0.0, 0.0),
            };
            index.push(c, rect);
        }
        debug!("page {page_no}: {} placed chars", index.chars.len());
        out.insert(page_no, index);
    }
    Ok(out)
}

fn stamp_overlays_blocking(
    path: &Path,
    patches: Vec<OverlayPatch>,
    out: &Path,
) -> Result<(), AttackError> {
    let pdfium = Pdfium::default();
    let document = open(&pdfium, path)?;
    let total = document.pages().len() as u32;

    let render_failed = |detail: String| AttackError::RenderFailed {
        path: path.to_path_buf(),
        detail,
    };

    for patch in &patches {
        if patch.page == 0 || patch.page > total {
            warn!("dropping overlay for page {} ({} pages)", patch.page, total);
            continue;
        }
        let mut page = document
            .pages()
            .get((patch.page - 1) as u16)
            .map_err(|e| render_failed(format!("page {}: {e:?}", patch.page)))?;

        let object = PdfPageImageObject::new_with_size(
            &document,
            &patch.image,
            PdfPoints::new(patch.rect.width()),
            PdfPoints::new(patch.rect.height()),
        )
        .map_err(|e| render_failed(format!("image object page {}: {e:?}", patch.page)))?;

        let mut object = object;
        object
            .translate(PdfPoints::new(patch.rect.x0), PdfPoints::new(patch.rect.y0))
            .map_err(|e| render_failed(format!("place overlay page {}: {e:?}", patch.page)))?;
        page.objects_mut()
            .add_image_object(object)
            .map_err(|e| render_failed(format!("add overlay page {}: {e:?}", patch.page)))?;
    }

    document
        .save_to_file(out)
        .map_err(|e| render_failed(format!("save '{}': {e:?}", out.display())))?;
    info!("stamped {} overlays → {}", patches.len(), out.display());
    Ok(())
}

// ── Crop math ────────────────────────────────────────────────────────────

/// Map a point-space rect to a clamped pixel box (x, y, w, h) on the
/// raster, flipping the vertical axis.
pub fn pixel_box(
    rect: &Rect,
    page_height_pt: f32,
    zoom: f32,
    img_w: u32,
    img_h: u32,
) -> (u32, u32, u32, u32) {
    let x = (rect.x0 * zoom).floor().max(0.0) as u32;
    let y = ((page_height_pt - rect.y1) * zoom).floor().max(0.0) as u32;
    let x = x.min(img_w.saturating_sub(1));
    let y = y.min(img_h.saturating_sub(1));
    let w = ((rect.width() * zoom).ceil() as u32).min(img_w - x).max(1);
    let h = ((rect.height() * zoom).ceil() as u32).min(img_h - y).max(1);
    (x, y, w, h)
}

/// Crop `rect` (points) out of a rendered page.
pub fn crop_region(rendered: &RenderedPage, rect: &Rect) -> DynamicImage {
    let zoom = rendered.zoom();
    let (x, y, w, h) = pixel_box(
        rect,
        rendered.height_pt,
        zoom,
        rendered.image.width(),
        rendered.image.height(),
    );
    DynamicImage::ImageRgba8(image::imageops::crop_imm(&rendered.image, x, y, w, h).to_image())
}
