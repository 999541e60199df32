//! Question segmentation and occupied-range substitution.
//!
//! The document's ordered top-level `\item` markers split it into one
//! contiguous segment per question, so each mapping is searched only
//! inside its own question's text. Searches use a whitespace-tolerant
//! regex built from the literal mapping text, because typeset sources
//! re-wrap lines freely and a hard-coded space would miss across a line
//! break.
//!
//! When the segment count does not match the question count, the whole
//! strategy degrades to a single global search over the full document.
//! This is a correctness degradation inherited from the pipeline's
//! design; it is kept as an explicit, logged mode rather than guessed
//! around.

use crate::error::MappingStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

// ── Segmentation ─────────────────────────────────────────────────────────

/// Byte range of one question's text within the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
}

/// How the document was split for mapping search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentationOutcome {
    /// One segment per question, in document order.
    Segmented(Vec<Segment>),
    /// Segment/question counts disagreed; mappings are searched over the
    /// entire document instead. Logged as a degraded mode.
    GlobalFallback { segments_found: usize },
}

static RE_LIST_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\begin\{enumerate\}|\\end\{enumerate\}|\\item\b").unwrap());

/// Split the source into per-question segments on top-level `\item`
/// markers (depth 1 of the outermost `enumerate`). Falls back globally
/// when the count disagrees with `question_count`.
pub fn segment_source(source: &str, question_count: usize) -> SegmentationOutcome {
    let mut depth: i32 = 0;
    let mut item_starts: Vec<usize> = Vec::new();
    let mut outer_end = source.len();

    for m in RE_LIST_TOKEN.find_iter(source) {
        match m.as_str() {
            "\\begin{enumerate}" => depth += 1,
            "\\end{enumerate}" => {
                depth -= 1;
                if depth == 0 {
                    outer_end = m.start();
                }
            }
            _ => {
                if depth == 1 {
                    item_starts.push(m.start());
                }
            }
        }
    }

    if item_starts.len() != question_count || question_count == 0 {
        warn!(
            "segment/question count mismatch ({} segments, {} questions); \
             falling back to global search",
            item_starts.len(),
            question_count
        );
        return SegmentationOutcome::GlobalFallback {
            segments_found: item_starts.len(),
        };
    }

    let mut segments = Vec::with_capacity(item_starts.len());
    for (i, &start) in item_starts.iter().enumerate() {
        let end = item_starts.get(i + 1).copied().unwrap_or(outer_end);
        segments.push(Segment { start, end });
    }
    debug!("segmented source into {} question segments", segments.len());
    SegmentationOutcome::Segmented(segments)
}

// ── Whitespace-tolerant search ───────────────────────────────────────────

/// Build a regex matching `literal` with any whitespace run in place of
/// each of its whitespace runs, so line-break or spacing drift does not
/// cause a search miss.
pub fn whitespace_tolerant_regex(literal: &str) -> Option<Regex> {
    let trimmed = literal.trim();
    if trimmed.is_empty() {
        return None;
    }
    let pattern = trimmed
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    Regex::new(&pattern).ok()
}

// ── Occupied-range tracking ──────────────────────────────────────────────

/// Interval list preventing two mappings from claiming overlapping text.
///
/// A replacement is never applied twice to the same character range;
/// overlapping requests are rejected, not merged silently.
#[derive(Debug, Default)]
pub struct OccupiedRanges {
    ranges: Vec<(usize, usize)>,
}

impl OccupiedRanges {
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.ranges.iter().any(|&(s, e)| start < e && s < end)
    }

    /// Claim `[start, end)`; false when it overlaps an existing claim.
    pub fn claim(&mut self, start: usize, end: usize) -> bool {
        if self.overlaps(start, end) {
            return false;
        }
        self.ranges.push((start, end));
        true
    }
}

// ── Substitution ─────────────────────────────────────────────────────────

/// One substitution request, scoped to a question segment.
#[derive(Debug, Clone)]
pub struct SubstitutionRequest {
    /// Mapping id carried through to diagnostics.
    pub mapping_id: String,
    /// 0-based index of the owning question (selects the segment).
    pub question_index: usize,
    /// Literal text to find (whitespace-tolerant).
    pub search: String,
    /// Replacement source text to splice in.
    pub replacement: String,
    /// Which non-occupied occurrence to take (0-based).
    pub occurrence_index: usize,
}

/// Outcome of one substitution attempt.
#[derive(Debug, Clone)]
pub struct SubstitutionOutcome {
    pub mapping_id: String,
    pub status: MappingStatus,
    /// The exact source fragment that was matched, when any.
    pub matched: Option<String>,
    /// Absolute byte offsets of the match in the original source.
    pub span: Option<(usize, usize)>,
    /// Offset of the match within its segment (absolute in global mode).
    pub segment_offset: Option<usize>,
}

/// Result of applying a batch of substitutions.
#[derive(Debug)]
pub struct ApplyResult {
    pub rewritten: String,
    pub outcomes: Vec<SubstitutionOutcome>,
    pub global_fallback: bool,
}

/// Apply `requests` to `source`, searching each inside its question's
/// segment (or globally in degraded mode). Matches are applied in the
/// order requests are declared; occupied-range tracking rejects any
/// overlap with an earlier accepted match.
pub fn apply_substitutions(
    source: &str,
    question_count: usize,
    requests: &[SubstitutionRequest],
) -> ApplyResult {
    let segmentation = segment_source(source, question_count);
    let (segments, global_fallback) = match &segmentation {
        SegmentationOutcome::Segmented(segments) => (Some(segments.as_slice()), false),
        SegmentationOutcome::GlobalFallback { .. } => (None, true),
    };

    let mut occupied = OccupiedRanges::default();
    let mut edits: Vec<(usize, usize, String)> = Vec::new();
    let mut outcomes = Vec::with_capacity(requests.len());

    for req in requests {
        let (scope_start, scope_end) = match segments {
            Some(segs) => match segs.get(req.question_index) {
                Some(seg) => (seg.start, seg.end),
                None => (0, source.len()),
            },
            None => (0, source.len()),
        };
        let scope = &source[scope_start..scope_end];

        let regex = match whitespace_tolerant_regex(&req.search) {
            Some(r) => r,
            None => {
                outcomes.push(SubstitutionOutcome {
                    mapping_id: req.mapping_id.clone(),
                    status: MappingStatus::NotFound,
                    matched: None,
                    span: None,
                    segment_offset: None,
                });
                continue;
            }
        };

        // Walk matches in order; skip past `occurrence_index` free ones.
        let mut found = None;
        let mut conflicted = false;
        let mut skipped = 0usize;
        for m in regex.find_iter(scope) {
            let abs = (scope_start + m.start(), scope_start + m.end());
            if occupied.overlaps(abs.0, abs.1) {
                conflicted = true;
                continue;
            }
            if skipped < req.occurrence_index {
                skipped += 1;
                continue;
            }
            found = Some((abs, m.start(), m.as_str().to_string()));
            break;
        }

        match found {
            Some(((start, end), seg_off, matched)) => {
                occupied.claim(start, end);
                edits.push((start, end, req.replacement.clone()));
                outcomes.push(SubstitutionOutcome {
                    mapping_id: req.mapping_id.clone(),
                    status: MappingStatus::Replaced,
                    matched: Some(matched),
                    span: Some((start, end)),
                    segment_offset: Some(seg_off),
                });
            }
            None => {
                let status = if conflicted {
                    MappingStatus::OverlapConflict
                } else {
                    MappingStatus::NotFound
                };
                outcomes.push(SubstitutionOutcome {
                    mapping_id: req.mapping_id.clone(),
                    status,
                    matched: None,
                    span: None,
                    segment_offset: None,
                });
            }
        }
    }

    // Splice accepted edits back to front so earlier offsets stay valid.
    edits.sort_by_key(|&(start, _, _)| std::cmp::Reverse(start));
    let mut rewritten = source.to_string();
    for (start, end, replacement) in edits {
        rewritten.replace_range(start..end, &replacement);
    }

    ApplyResult {
        rewritten,
        outcomes,
        global_fallback,
    }
}

// ── Structural list fallback ─────────────────────────────────────────────

static RE_BRACKETED_ENUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\begin\{enumerate\}\[([^\]]*)\]").unwrap());

/// Preamble definitions for the two internal list variants. Plain
/// `enumerate` plus a label override, so nesting depth determines
/// numbering without any styling package being installed.
pub const LIST_VARIANT_DEFS: &str = r"\newenvironment{gtenumarab}{\begingroup\renewcommand{\labelenumi}{\arabic{enumi}.}\begin{enumerate}}{\end{enumerate}\endgroup}
\newenvironment{gtenumalph}{\begingroup\renewcommand{\labelenumi}{(\alph{enumi})}\begin{enumerate}}{\end{enumerate}\endgroup}";

/// Rewrite bracketed `enumerate` environments to the two internal
/// variants. Alphabetic-looking options (`(a)`, `a)`, `label=\alph*`…)
/// map to the alphabetic variant, everything else to arabic; the
/// matching `\end{enumerate}` is rewritten by nesting depth.
pub fn rewrite_list_environments(source: &str) -> (String, usize) {
    if !RE_BRACKETED_ENUM.is_match(source) {
        return (source.to_string(), 0);
    }

    let mut out = String::with_capacity(source.len());
    // Stack entry is Some(variant) for a rewritten begin, None for an
    // untouched one, so ends pair up correctly under nesting.
    let mut stack: Vec<Option<&'static str>> = Vec::new();
    let mut rewritten = 0usize;
    let mut pos = 0usize;

    static RE_ANY_ENUM: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\\begin\{enumerate\}(\[[^\]]*\])?|\\end\{enumerate\}").unwrap()
    });

    for m in RE_ANY_ENUM.find_iter(source) {
        out.push_str(&source[pos..m.start()]);
        pos = m.end();
        let text = m.as_str();
        if text.starts_with("\\begin") {
            if let Some(open) = text.find('[') {
                let option = &text[open + 1..text.len() - 1];
                let variant = if is_alphabetic_option(option) {
                    "gtenumalph"
                } else {
                    "gtenumarab"
                };
                out.push_str(&format!("\\begin{{{variant}}}"));
                stack.push(Some(variant));
                rewritten += 1;
            } else {
                out.push_str(text);
                stack.push(None);
            }
        } else {
            match stack.pop().flatten() {
                Some(variant) => out.push_str(&format!("\\end{{{variant}}}")),
                None => out.push_str(text),
            }
        }
    }
    out.push_str(&source[pos..]);
    (out, rewritten)
}

fn is_alphabetic_option(option: &str) -> bool {
    let o = option.to_lowercase();
    o.contains("alph") || o.contains("(a)") || o.contains("a)")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_QUESTIONS: &str = "\\documentclass{article}\n\\begin{document}\n\
\\begin{enumerate}\n\
\\item What is the capital of France?\n\
\\begin{enumerate}\n\\item Paris\n\\item Lyon\n\\end{enumerate}\n\
\\item Compute 2+2.\n\
\\end{enumerate}\n\\end{document}\n";

    fn req(id: &str, qi: usize, search: &str, replacement: &str) -> SubstitutionRequest {
        SubstitutionRequest {
            mapping_id: id.into(),
            question_index: qi,
            search: search.into(),
            replacement: replacement.into(),
            occurrence_index: 0,
        }
    }

    #[test]
    fn segments_ignore_nested_items() {
        match segment_source(TWO_QUESTIONS, 2) {
            SegmentationOutcome::Segmented(segs) => {
                assert_eq!(segs.len(), 2);
                assert!(TWO_QUESTIONS[segs[0].start..segs[0].end].contains("France"));
                assert!(TWO_QUESTIONS[segs[1].start..segs[1].end].contains("2+2"));
            }
            other => panic!("expected segmentation, got {other:?}"),
        }
    }

    #[test]
    fn count_mismatch_degrades_to_global() {
        assert_eq!(
            segment_source(TWO_QUESTIONS, 3),
            SegmentationOutcome::GlobalFallback { segments_found: 2 }
        );
    }

    #[test]
    fn whitespace_tolerant_match_across_linebreak() {
        let re = whitespace_tolerant_regex("capital of France").unwrap();
        assert!(re.is_match("capital\nof   France"));
        assert!(!re.is_match("capital France"));
    }

    #[test]
    fn substitution_scoped_to_own_segment() {
        // "Paris" only exists in question 1's segment; asking question 2
        // to replace it must fail, not steal question 1's text.
        let result = apply_substitutions(TWO_QUESTIONS, 2, &[req("m1", 1, "Paris", "Rome")]);
        assert_eq!(result.outcomes[0].status, MappingStatus::NotFound);
        assert!(result.rewritten.contains("Paris"));
    }

    #[test]
    fn replacement_applies_and_reports_span() {
        let result = apply_substitutions(TWO_QUESTIONS, 2, &[req("m1", 1, "2+2", "3+3")]);
        assert_eq!(result.outcomes[0].status, MappingStatus::Replaced);
        assert!(result.rewritten.contains("Compute 3+3."));
        assert!(!result.global_fallback);
        let (start, end) = result.outcomes[0].span.unwrap();
        assert_eq!(&TWO_QUESTIONS[start..end], "2+2");
    }

    #[test]
    fn overlapping_requests_conflict_not_merge() {
        let result = apply_substitutions(
            TWO_QUESTIONS,
            2,
            &[
                req("m1", 0, "capital of France", "city of Spain"),
                req("m2", 0, "of France", "of Italy"),
            ],
        );
        assert_eq!(result.outcomes[0].status, MappingStatus::Replaced);
        assert_eq!(result.outcomes[1].status, MappingStatus::OverlapConflict);
        assert!(result.rewritten.contains("city of Spain"));
        assert!(!result.rewritten.contains("of Italy"));
    }

    #[test]
    fn accepted_spans_never_intersect() {
        let result = apply_substitutions(
            TWO_QUESTIONS,
            2,
            &[
                req("m1", 0, "capital", "seat"),
                req("m2", 0, "France", "Italy"),
                req("m3", 0, "capital of France", "x"),
            ],
        );
        let spans: Vec<_> = result
            .outcomes
            .iter()
            .filter_map(|o| o.span)
            .collect();
        for (i, a) in spans.iter().enumerate() {
            for b in &spans[i + 1..] {
                assert!(a.1 <= b.0 || b.1 <= a.0, "spans {a:?} and {b:?} intersect");
            }
        }
    }

    #[test]
    fn occurrence_index_selects_later_match() {
        let src = "\\begin{enumerate}\n\\item red red red\n\\end{enumerate}";
        let mut r = req("m1", 0, "red", "blue");
        r.occurrence_index = 1;
        let result = apply_substitutions(src, 1, &[r]);
        assert_eq!(result.rewritten, "\\begin{enumerate}\n\\item red blue red\n\\end{enumerate}");
    }

    #[test]
    fn global_fallback_searches_whole_document() {
        // 3 expected questions vs 2 segments → degraded mode still finds
        // the text anywhere in the document.
        let result = apply_substitutions(TWO_QUESTIONS, 3, &[req("m1", 2, "Paris", "Rome")]);
        assert!(result.global_fallback);
        assert_eq!(result.outcomes[0].status, MappingStatus::Replaced);
        assert!(result.rewritten.contains("Rome"));
    }

    #[test]
    fn bracketed_lists_rewritten_by_variant() {
        let src = "\\begin{enumerate}[label=(\\alph*)]\n\\item a\n\\end{enumerate}\n\
                   \\begin{enumerate}[1.]\n\\item b\n\\end{enumerate}\n";
        let (out, n) = rewrite_list_environments(src);
        assert_eq!(n, 2);
        assert!(out.contains("\\begin{gtenumalph}"));
        assert!(out.contains("\\end{gtenumalph}"));
        assert!(out.contains("\\begin{gtenumarab}"));
        assert!(!out.contains("\\begin{enumerate}["));
    }

    #[test]
    fn unbracketed_lists_left_alone() {
        let (out, n) = rewrite_list_environments(TWO_QUESTIONS);
        assert_eq!(n, 0);
        assert_eq!(out, TWO_QUESTIONS);
    }

    #[test]
    fn nested_mixed_lists_pair_ends_correctly() {
        let src = "\\begin{enumerate}[(a)]\n\\item x\n\\begin{enumerate}\n\\item y\n\\end{enumerate}\n\\end{enumerate}";
        let (out, _) = rewrite_list_environments(src);
        // Inner plain enumerate keeps its own end; outer end is rewritten.
        assert!(out.contains("\\begin{enumerate}\n\\item y\n\\end{enumerate}"));
        assert!(out.trim_end().ends_with("\\end{gtenumalph}"));
    }
}
