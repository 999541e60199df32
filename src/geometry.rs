//! Geometry resolution for overlay placement.
//!
//! Given a text substitution and a page, find the rectangle(s) that
//! cover it. Resolution walks a fallback chain, most precise first:
//!
//! 1. an explicit bounding box on the mapping itself;
//! 2. structured layout metadata for the owning question (stem box, a
//!    specific lettered option box, or the whole-question box);
//! 3. a text search against the rendered original page — exact phrase,
//!    ASCII-folded phrase, truncated 8-word phrase, then a
//!    sliding-window multi-word token match.
//!
//! The first non-empty hit wins. Resolved rectangles are padded by a
//! small fixed margin and then merged transitively with any other
//! padded rectangle on the same page they intersect, so one overlay
//! graphic covers several adjacent edits. Rectangles on different pages
//! are never merged.
//!
//! All coordinates are PDF points with a bottom-left origin. The page
//! text index consumed by the search fallbacks is produced by
//! [`crate::render`] from per-character pdfium geometry; everything in
//! this module is pure and unit-testable without a PDF.

use crate::document::{QuestionPositioning, SubstringMapping};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Axis-aligned rectangle in PDF points, bottom-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn from_array(b: [f32; 4]) -> Self {
        Self::new(b[0], b[1], b[2], b[3])
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// Grow the rectangle by `margin` points on every side.
    pub fn padded(&self, margin: f32) -> Self {
        Self {
            x0: self.x0 - margin,
            y0: self.y0 - margin,
            x1: self.x1 + margin,
            y1: self.y1 + margin,
        }
    }

    /// Closed-interval intersection test (touching edges count).
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x0 <= other.x1 && other.x0 <= self.x1 && self.y0 <= other.y1 && other.y0 <= self.y1
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Self {
        Self {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Scale around the origin (used for original→recompiled page-size
    /// mapping).
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x0: self.x0 * sx,
            y0: self.y0 * sy,
            x1: self.x1 * sx,
            y1: self.y1 * sy,
        }
    }
}

/// A rectangle pinned to a 1-indexed page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageRect {
    pub page: u32,
    pub rect: Rect,
}

/// Which rung of the fallback chain produced a rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometrySource {
    ExplicitBbox,
    LayoutStem,
    LayoutOption,
    LayoutQuestion,
    TextExact,
    TextFolded,
    TextTruncated,
    TextTokens,
}

/// A resolved overlay target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRegion {
    pub page: u32,
    pub rect: Rect,
    pub source: GeometrySource,
}

// ── Page resolution ──────────────────────────────────────────────────────

static RE_SPAN_PAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"page(\d+)").unwrap());

/// Resolve the 1-indexed page for a mapping: explicit hint first, else
/// the embedded `...pageN...` span-identifier convention on its id,
/// else the owning question's layout page.
pub fn resolve_page(
    mapping: &SubstringMapping,
    positioning: Option<&QuestionPositioning>,
) -> Option<u32> {
    if let Some(page) = mapping.page {
        return Some(page);
    }
    if let Some(caps) = RE_SPAN_PAGE.captures(&mapping.id) {
        if let Ok(page) = caps[1].parse::<u32>() {
            return Some(page);
        }
    }
    positioning.map(|p| p.page)
}

// ── Rectangle resolution ─────────────────────────────────────────────────

/// Per-character text geometry for one rendered page.
///
/// Built by the rendering collaborator; consumed by the text-search
/// fallbacks. Whitespace characters may carry a zero rect.
#[derive(Debug, Clone, Default)]
pub struct PageTextIndex {
    pub chars: Vec<PlacedChar>,
}

#[derive(Debug, Clone, Copy)]
pub struct PlacedChar {
    pub ch: char,
    pub rect: Rect,
}

impl PageTextIndex {
    pub fn push(&mut self, ch: char, rect: Rect) {
        self.chars.push(PlacedChar { ch, rect });
    }

    /// Locate `needle` in the page text, whitespace-collapsed on both
    /// sides, and return the union of the matched characters' boxes.
    /// With `fold`, both the needle and the page characters are
    /// ASCII-folded first, so ligatures and smart punctuation typeset on
    /// the page still match a plain needle.
    fn find_normalised(&self, needle: &str, fold: bool) -> Option<Rect> {
        let needle = if fold {
            collapse_ws(&ascii_fold(needle))
        } else {
            collapse_ws(needle)
        };
        if needle.is_empty() {
            return None;
        }
        // Build the collapsed haystack together with a map back to the
        // contributing character indices. A folded ligature contributes
        // several haystack characters, all mapping to the same index.
        let mut haystack = String::with_capacity(self.chars.len());
        let mut origin: Vec<usize> = Vec::with_capacity(self.chars.len());
        let mut last_ws = true;
        for (i, pc) in self.chars.iter().enumerate() {
            if pc.ch.is_whitespace() {
                if !last_ws {
                    haystack.push(' ');
                    origin.push(i);
                    last_ws = true;
                }
                continue;
            }
            let before = haystack.len();
            if fold {
                push_folded(&mut haystack, pc.ch);
            } else {
                haystack.push(pc.ch);
            }
            for _ in haystack[before..].chars() {
                origin.push(i);
            }
            last_ws = false;
        }

        let start = haystack.find(&needle)?;
        let start_idx = haystack[..start].chars().count();
        let len = needle.chars().count();
        let mut rect: Option<Rect> = None;
        for &ci in origin.iter().skip(start_idx).take(len) {
            let pc = &self.chars[ci];
            if pc.ch.is_whitespace() {
                continue;
            }
            rect = Some(match rect {
                Some(r) => r.union(&pc.rect),
                None => pc.rect,
            });
        }
        rect
    }

    /// Word list with the union box of each word, for the token fallback.
    fn words(&self) -> Vec<(String, Rect)> {
        let mut out = Vec::new();
        let mut word = String::new();
        let mut rect: Option<Rect> = None;
        for pc in &self.chars {
            if pc.ch.is_whitespace() {
                if let Some(r) = rect.take() {
                    out.push((std::mem::take(&mut word), r));
                }
                word.clear();
            } else {
                word.push(pc.ch);
                rect = Some(match rect {
                    Some(r) => r.union(&pc.rect),
                    None => pc.rect,
                });
            }
        }
        if let Some(r) = rect {
            out.push((word, r));
        }
        out
    }
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold one character of non-ASCII typography to its ASCII spelling,
/// appending to `out`. Ligatures expand to several characters.
fn push_folded(out: &mut String, c: char) {
    match c {
        '\u{2018}' | '\u{2019}' => out.push('\''),
        '\u{201C}' | '\u{201D}' => out.push('"'),
        '\u{2013}' | '\u{2014}' => out.push('-'),
        '\u{2026}' => out.push_str("..."),
        '\u{FB00}' => out.push_str("ff"),
        '\u{FB01}' => out.push_str("fi"),
        '\u{FB02}' => out.push_str("fl"),
        '\u{FB03}' => out.push_str("ffi"),
        '\u{FB04}' => out.push_str("ffl"),
        '\u{00A0}' => out.push(' '),
        _ => out.push(c),
    }
}

/// Fold common non-ASCII typography to ASCII so typeset ligatures and
/// smart punctuation do not defeat the search.
pub fn ascii_fold(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        push_folded(&mut out, c);
    }
    out
}

/// Truncate a phrase to its first `n` words.
fn truncate_words(s: &str, n: usize) -> String {
    s.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

/// Minimum consecutive tokens for the sliding-window fallback to accept
/// a hit. Shorter windows match far too promiscuously on real pages.
const MIN_TOKEN_WINDOW: usize = 3;

/// Sliding-window multi-word token match: find the longest run of the
/// needle's tokens appearing consecutively in the page's word stream.
fn find_token_window(index: &PageTextIndex, needle: &str) -> Option<Rect> {
    let tokens: Vec<String> = ascii_fold(needle)
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if tokens.len() < MIN_TOKEN_WINDOW {
        return None;
    }
    let words = index.words();
    let folded: Vec<String> = words
        .iter()
        .map(|(w, _)| ascii_fold(w).to_lowercase())
        .collect();

    let mut best: Option<(usize, usize, usize)> = None; // (len, start_w, start_t)
    for t0 in 0..tokens.len() {
        for w0 in 0..folded.len() {
            let mut len = 0;
            while t0 + len < tokens.len()
                && w0 + len < folded.len()
                && folded[w0 + len] == tokens[t0 + len]
            {
                len += 1;
            }
            if len >= MIN_TOKEN_WINDOW && best.map_or(true, |(l, _, _)| len > l) {
                best = Some((len, w0, t0));
            }
        }
    }

    let (len, w0, _) = best?;
    let mut rect = words[w0].1;
    for (_, r) in words.iter().skip(w0 + 1).take(len - 1) {
        rect = rect.union(r);
    }
    Some(rect)
}

/// Option letter referenced by a mapping's context, e.g. "option B".
static RE_OPTION_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\boption\s+([A-Z])\b").unwrap());

/// Resolve the rectangle for one mapping on its (already resolved) page.
///
/// `index` is the original page's character geometry; `None` when the
/// page could not be rendered, which restricts resolution to the
/// explicit/layout rungs.
pub fn resolve_rect(
    mapping: &SubstringMapping,
    positioning: Option<&QuestionPositioning>,
    index: Option<&PageTextIndex>,
) -> Option<(Rect, GeometrySource)> {
    // 1) Explicit bounding box on the mapping.
    if let Some(bbox) = mapping.bbox {
        return Some((Rect::from_array(bbox), GeometrySource::ExplicitBbox));
    }

    // 2) Structured layout metadata for the owning question.
    if let Some(pos) = positioning {
        if let Some(caps) = RE_OPTION_LETTER.captures(&mapping.context) {
            let letter = caps[1].to_uppercase();
            if let Some(b) = pos.option_bboxes.get(&letter) {
                return Some((Rect::from_array(*b), GeometrySource::LayoutOption));
            }
        }
        let stem_holds = mapping.context.to_lowercase().contains("stem");
        if stem_holds {
            if let Some(b) = pos.stem_bbox {
                return Some((Rect::from_array(b), GeometrySource::LayoutStem));
            }
        }
        if let Some(b) = pos.bbox {
            return Some((Rect::from_array(b), GeometrySource::LayoutQuestion));
        }
    }

    // 3) Text search fallbacks against the rendered page, in order. The
    // folded rung always runs when the exact one misses: the typography
    // needing the fold usually sits on the page, not in the needle.
    let index = index?;
    let phrase = &mapping.original;
    if let Some(r) = index.find_normalised(phrase, false) {
        return Some((r, GeometrySource::TextExact));
    }
    if let Some(r) = index.find_normalised(phrase, true) {
        return Some((r, GeometrySource::TextFolded));
    }
    let folded = ascii_fold(phrase);
    let truncated = truncate_words(&folded, 8);
    if truncated.split_whitespace().count() < folded.split_whitespace().count() {
        if let Some(r) = index.find_normalised(&truncated, true) {
            return Some((r, GeometrySource::TextTruncated));
        }
    }
    if let Some(r) = find_token_window(index, phrase) {
        return Some((r, GeometrySource::TextTokens));
    }

    debug!("no rectangle resolvable for mapping '{}'", mapping.id);
    None
}

// ── Merging ──────────────────────────────────────────────────────────────

/// Pad every region and merge transitively-intersecting rectangles on
/// the same page. Output order: by page, then by the merged rect's
/// bottom-left corner.
pub fn pad_and_merge(regions: &[PageRect], margin: f32) -> Vec<PageRect> {
    let mut padded: Vec<PageRect> = regions
        .iter()
        .map(|r| PageRect {
            page: r.page,
            rect: r.rect.padded(margin),
        })
        .collect();

    // Union-by-sweep: repeatedly fold any intersecting same-page pair
    // until a fixpoint. Region counts are tiny (one per edit), so the
    // quadratic pass is irrelevant.
    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..padded.len() {
            for j in (i + 1)..padded.len() {
                if padded[i].page == padded[j].page
                    && padded[i].rect.intersects(&padded[j].rect)
                {
                    let u = padded[i].rect.union(&padded[j].rect);
                    padded[i].rect = u;
                    padded.swap_remove(j);
                    merged = true;
                    break 'outer;
                }
            }
        }
    }

    padded.sort_by(|a, b| {
        (a.page, a.rect.y0 as i64, a.rect.x0 as i64).cmp(&(b.page, b.rect.y0 as i64, b.rect.x0 as i64))
    });
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn mapping(original: &str) -> SubstringMapping {
        SubstringMapping {
            id: "m1".into(),
            original: original.into(),
            replacement: "x".into(),
            validated: true,
            ..Default::default()
        }
    }

    fn index_of(text: &str) -> PageTextIndex {
        // Lay characters out on a 10pt grid, one line.
        let mut idx = PageTextIndex::default();
        for (i, ch) in text.chars().enumerate() {
            let x = i as f32 * 10.0;
            idx.push(ch, Rect::new(x, 700.0, x + 10.0, 712.0));
        }
        idx
    }

    #[test]
    fn explicit_bbox_wins() {
        let mut m = mapping("hello");
        m.bbox = Some([1.0, 2.0, 3.0, 4.0]);
        let idx = index_of("hello world");
        let (r, src) = resolve_rect(&m, None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::ExplicitBbox);
        assert_eq!(r, Rect::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn layout_option_beats_text_search() {
        let m = SubstringMapping {
            context: "in option B".into(),
            ..mapping("hello")
        };
        let mut option_bboxes = BTreeMap::new();
        option_bboxes.insert("B".to_string(), [5.0, 5.0, 50.0, 20.0]);
        let pos = QuestionPositioning {
            page: 1,
            option_bboxes,
            ..Default::default()
        };
        let idx = index_of("hello world");
        let (_, src) = resolve_rect(&m, Some(&pos), Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::LayoutOption);
    }

    #[test]
    fn exact_text_search_unions_char_boxes() {
        let idx = index_of("say hello world");
        let (r, src) = resolve_rect(&mapping("hello"), None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::TextExact);
        assert_eq!(r.x0, 40.0); // "hello" starts at char 4
        assert_eq!(r.x1, 90.0);
    }

    #[test]
    fn whitespace_drift_does_not_break_exact_search() {
        let idx = index_of("say  hello   world");
        let (_, src) = resolve_rect(&mapping("hello world"), None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::TextExact);
    }

    #[test]
    fn folded_search_handles_ligatures() {
        let idx = index_of("an e\u{FB03}cient plan");
        let (_, src) = resolve_rect(&mapping("an efficient plan"), None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::TextFolded);
    }

    #[test]
    fn folded_search_folds_the_page_side() {
        // One token, so the token window cannot rescue a miss: the fold
        // itself has to bridge the page's ligature. The ligature expands
        // to three needle characters sharing one placed box.
        let idx = index_of("an e\u{FB03}cient plan");
        let (r, src) = resolve_rect(&mapping("efficient"), None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::TextFolded);
        assert_eq!(r.x0, 30.0); // 'e' at char 3
        assert_eq!(r.x1, 100.0); // 't' at char 9
    }

    #[test]
    fn truncated_search_matches_first_eight_words() {
        let page = "one two three four five six seven eight trailing text here";
        let idx = index_of(page);
        let needle = "one two three four five six seven eight COMPLETELY DIFFERENT TAIL";
        let (_, src) = resolve_rect(&mapping(needle), None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::TextTruncated);
    }

    #[test]
    fn token_window_matches_partial_run() {
        let idx = index_of("alpha beta gamma delta epsilon");
        // First 8 words of needle don't appear verbatim; a 3-token run does.
        let (_, src) =
            resolve_rect(&mapping("XX beta gamma delta YY"), None, Some(&idx)).unwrap();
        assert_eq!(src, GeometrySource::TextTokens);
    }

    #[test]
    fn fallback_exhaustion_yields_none() {
        let idx = index_of("completely unrelated page content");
        assert!(resolve_rect(&mapping("zq wv xk"), None, Some(&idx)).is_none());
    }

    #[test]
    fn page_from_span_identifier() {
        let mut m = mapping("x");
        m.id = "q2_page3_span1".into();
        assert_eq!(resolve_page(&m, None), Some(3));
        m.page = Some(7);
        assert_eq!(resolve_page(&m, None), Some(7), "explicit hint wins");
    }

    #[test]
    fn merge_joins_intersecting_padded_rects_same_page() {
        let a = PageRect {
            page: 1,
            rect: Rect::new(0.0, 0.0, 10.0, 10.0),
        };
        let b = PageRect {
            page: 1,
            rect: Rect::new(12.0, 0.0, 20.0, 10.0),
        };
        // 2pt padding closes the 2pt gap.
        let merged = pad_and_merge(&[a, b], 2.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].rect, Rect::new(-2.0, -2.0, 22.0, 12.0));
    }

    #[test]
    fn merge_never_crosses_pages() {
        let a = PageRect {
            page: 1,
            rect: Rect::new(0.0, 0.0, 10.0, 10.0),
        };
        let b = PageRect {
            page: 2,
            rect: Rect::new(0.0, 0.0, 10.0, 10.0),
        };
        assert_eq!(pad_and_merge(&[a, b], 5.0).len(), 2);
    }

    #[test]
    fn merge_is_transitive() {
        let rects = [
            PageRect { page: 1, rect: Rect::new(0.0, 0.0, 10.0, 10.0) },
            PageRect { page: 1, rect: Rect::new(30.0, 0.0, 40.0, 10.0) },
            PageRect { page: 1, rect: Rect::new(9.0, 0.0, 31.0, 10.0) },
        ];
        let merged = pad_and_merge(&rects, 0.0);
        assert_eq!(merged.len(), 1, "middle rect chains the outer two");
    }
}
