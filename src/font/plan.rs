//! Per-character substitution planning against the base font.
//!
//! A mapping's (original, replacement) pair is reduced to its
//! alphanumeric characters: position `i` of the plan renders the
//! original's character (visual) while the text stream carries the
//! replacement's character (hidden). Non-alphanumeric characters are
//! left untouched by the font method — punctuation and whitespace
//! extract identically either way and remapping them buys nothing.

use crate::error::{AttackError, MappingStatus};
use std::path::{Path, PathBuf};

/// The base face all substitution fonts are cloned from.
///
/// Holds the raw bytes; `ttf_parser::Face` borrows, so lookups parse on
/// demand (parsing is a header scan, not a decode — cheap enough per
/// call, and it keeps this struct `Send + 'static` for spawn_blocking).
#[derive(Debug, Clone)]
pub struct BaseFont {
    pub path: PathBuf,
    pub data: Vec<u8>,
    /// Hex sha256 of `data`; part of every substitution font's cache key.
    pub sha256: String,
}

impl BaseFont {
    /// Load the base font, failing with a method-level error when the
    /// asset is missing — the caller short-circuits the whole method.
    pub fn load(path: &Path) -> Result<Self, AttackError> {
        let data = std::fs::read(path).map_err(|_| AttackError::BaseAssetMissing {
            method: "font_substitution",
            path: path.to_path_buf(),
        })?;
        // Validate up front so glyph lookups can't fail on parse later.
        ttf_parser::Face::parse(&data, 0).map_err(|e| AttackError::Internal(format!(
            "base font '{}' unparseable: {e}",
            path.display()
        )))?;
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(&data);
        Ok(Self {
            path: path.to_path_buf(),
            sha256: format!("{:x}", hasher.finalize()),
            data,
        })
    }

    /// Glyph id for `ch`, when the face maps it.
    pub fn glyph_id(&self, ch: char) -> Option<u16> {
        let face = ttf_parser::Face::parse(&self.data, 0).ok()?;
        face.glyph_index(ch).map(|g| g.0)
    }
}

/// One position of a substitution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedChar {
    /// Index within the alphanumeric run (for diagnostics).
    pub position: usize,
    /// Code point placed in the text stream (what extraction reads).
    pub hidden: char,
    /// Character whose glyph is rendered (what a human sees).
    pub visual: char,
    /// The visual character's glyph id in the base face.
    pub glyph_id: u16,
}

/// Plan the per-character substitutions for one mapping.
///
/// `visual_text` is what the page must keep showing (the original);
/// `hidden_text` is what a text scraper must read (the replacement).
/// Returns `Err(InvalidMapping)` when the alphanumeric runs differ in
/// length (no positional pairing exists), `Err(MissingGlyph)` when a
/// needed visual glyph is absent from the base face. Positions whose
/// hidden and visual characters coincide are skipped — nothing to remap.
pub fn plan_pair(
    base: &BaseFont,
    visual_text: &str,
    hidden_text: &str,
) -> Result<Vec<PlannedChar>, MappingStatus> {
    let visual: Vec<char> = visual_text.chars().filter(|c| c.is_alphanumeric()).collect();
    let hidden: Vec<char> = hidden_text.chars().filter(|c| c.is_alphanumeric()).collect();

    if visual.is_empty() || visual.len() != hidden.len() {
        return Err(MappingStatus::InvalidMapping);
    }

    let mut plan = Vec::new();
    for (position, (&v, &h)) in visual.iter().zip(hidden.iter()).enumerate() {
        if v == h {
            continue;
        }
        let glyph_id = base.glyph_id(v).ok_or(MappingStatus::MissingGlyph)?;
        plan.push(PlannedChar {
            position,
            hidden: h,
            visual: v,
            glyph_id,
        });
    }
    Ok(plan)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal valid TrueType face built in-memory for tests: glyf-less
    /// faces are rejected by ttf-parser, so we assemble the smallest
    /// structure it accepts — cmap format 4 covering 'A'..'z', empty
    /// glyf outlines, and the mandatory head/hhea/hmtx/maxp tables.
    pub(crate) fn tiny_test_font() -> Vec<u8> {
        build_test_font()
    }

    fn be16(v: u16) -> [u8; 2] {
        v.to_be_bytes()
    }
    fn be32(v: u32) -> [u8; 4] {
        v.to_be_bytes()
    }

    /// Assemble a 4-table font (cmap, head, hhea, hmtx + maxp + glyf +
    /// loca) mapping 'A'–'z' to glyph ids 1..=n with empty outlines.
    fn build_test_font() -> Vec<u8> {
        // Glyph ids: 0 = .notdef, then one per code point 0x41..=0x7A.
        let first: u16 = 0x41;
        let last: u16 = 0x7A;
        let num_glyphs: u16 = (last - first + 1) + 1;

        // head
        let mut head = Vec::new();
        head.extend(be32(0x0001_0000)); // version
        head.extend(be32(0)); // fontRevision
        head.extend(be32(0)); // checkSumAdjustment (left 0 for the test face)
        head.extend(be32(0x5F0F_3CF5)); // magic
        head.extend(be16(0)); // flags
        head.extend(be16(1000)); // unitsPerEm
        head.extend([0u8; 16]); // created + modified
        head.extend(be16(0)); // xMin
        head.extend(be16(0)); // yMin
        head.extend(be16(0)); // xMax
        head.extend(be16(0)); // yMax
        head.extend(be16(0)); // macStyle
        head.extend(be16(8)); // lowestRecPPEM
        head.extend(be16(2)); // fontDirectionHint
        head.extend(be16(0)); // indexToLocFormat (short)
        head.extend(be16(0)); // glyphDataFormat

        // hhea
        let mut hhea = Vec::new();
        hhea.extend(be32(0x0001_0000));
        hhea.extend(be16(800)); // ascender
        hhea.extend(be16((-200i16) as u16)); // descender
        hhea.extend(be16(0)); // lineGap
        hhea.extend(be16(600)); // advanceWidthMax
        hhea.extend([0u8; 12]); // min bearings / extents / carets
        hhea.extend([0u8; 10]); // caretOffset + reserved
        hhea.extend(be16(1)); // numberOfHMetrics

        // hmtx: single metric applies to all glyphs
        let mut hmtx = Vec::new();
        hmtx.extend(be16(600));
        hmtx.extend(be16(0));

        // maxp
        let mut maxp = Vec::new();
        maxp.extend(be32(0x0001_0000));
        maxp.extend(be16(num_glyphs));
        maxp.extend([0u8; 26]);

        // cmap: format 4, one mapped segment + terminator
        let seg_count: u16 = 2;
        let mut sub = Vec::new();
        sub.extend(be16(4)); // format
        sub.extend(be16(32)); // length
        sub.extend(be16(0)); // language
        sub.extend(be16(seg_count * 2));
        sub.extend(be16(4)); // searchRange
        sub.extend(be16(1)); // entrySelector
        sub.extend(be16(0)); // rangeShift
        sub.extend(be16(last)); // endCode[0]
        sub.extend(be16(0xFFFF)); // endCode[1]
        sub.extend(be16(0)); // reservedPad
        sub.extend(be16(first)); // startCode[0]
        sub.extend(be16(0xFFFF)); // startCode[1]
        sub.extend(be16(1u16.wrapping_sub(first))); // idDelta[0]: maps first→1
        sub.extend(be16(1)); // idDelta[1]: 0xFFFF→0
        sub.extend(be16(0)); // idRangeOffset[0]
        sub.extend(be16(0)); // idRangeOffset[1]
        let mut cmap = Vec::new();
        cmap.extend(be16(0)); // version
        cmap.extend(be16(1)); // numTables
        cmap.extend(be16(3)); // platformID
        cmap.extend(be16(1)); // encodingID
        cmap.extend(be32(12)); // subtable offset
        cmap.extend(&sub);

        // loca (short format): all zero offsets → empty glyphs
        let mut loca = Vec::new();
        for _ in 0..=num_glyphs {
            loca.extend(be16(0));
        }
        let glyf = vec![0u8; 4];

        // Assemble sfnt
        let tables: Vec<([u8; 4], Vec<u8>)> = vec![
            (*b"cmap", cmap),
            (*b"glyf", glyf),
            (*b"head", head),
            (*b"hhea", hhea),
            (*b"hmtx", hmtx),
            (*b"loca", loca),
            (*b"maxp", maxp),
        ];
        let num_tables = tables.len() as u16;
        let mut font = Vec::new();
        font.extend(be32(0x0001_0000));
        font.extend(be16(num_tables));
        let pow = 16u16.max(1) * 4; // searchRange for 4 ≤ n < 8
        font.extend(be16(pow));
        font.extend(be16(2));
        font.extend(be16(num_tables * 16 - pow));

        let mut offset = 12 + num_tables as u32 * 16;
        let mut records = Vec::new();
        let mut blobs = Vec::new();
        for (tag, data) in &tables {
            let mut padded = data.clone();
            while padded.len() % 4 != 0 {
                padded.push(0);
            }
            records.extend_from_slice(tag);
            records.extend(be32(0)); // checksum unchecked by ttf-parser
            records.extend(be32(offset));
            records.extend(be32(data.len() as u32));
            offset += padded.len() as u32;
            blobs.push(padded);
        }
        font.extend(records);
        for b in blobs {
            font.extend(b);
        }
        font
    }

    fn base() -> BaseFont {
        let data = tiny_test_font();
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(&data);
        BaseFont {
            path: PathBuf::from("test.ttf"),
            sha256: format!("{:x}", hasher.finalize()),
            data,
        }
    }

    #[test]
    fn test_face_parses_and_maps_ascii() {
        let b = base();
        assert_eq!(b.glyph_id('A'), Some(1));
        assert_eq!(b.glyph_id('B'), Some(2));
        assert!(b.glyph_id('\u{4E2D}').is_none());
    }

    #[test]
    fn plan_pairs_alphanumeric_positions() {
        let b = base();
        let plan = plan_pair(&b, "cat", "dog").unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].visual, 'c');
        assert_eq!(plan[0].hidden, 'd');
        assert_eq!(plan[0].glyph_id, b.glyph_id('c').unwrap());
    }

    #[test]
    fn identical_positions_are_skipped() {
        let b = base();
        let plan = plan_pair(&b, "cat", "cut").unwrap();
        assert_eq!(plan.len(), 1, "only the middle char differs");
        assert_eq!(plan[0].position, 1);
    }

    #[test]
    fn unequal_runs_are_invalid() {
        let b = base();
        assert_eq!(
            plan_pair(&b, "cat", "horse").unwrap_err(),
            MappingStatus::InvalidMapping
        );
        assert_eq!(plan_pair(&b, "", "").unwrap_err(), MappingStatus::InvalidMapping);
    }

    #[test]
    fn punctuation_is_ignored_in_pairing() {
        let b = base();
        // "c-a-t" and "dog!" both reduce to 3 alphanumerics.
        let plan = plan_pair(&b, "c-a-t", "dog!").unwrap();
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn unmapped_visual_char_is_missing_glyph() {
        let b = base();
        assert_eq!(
            plan_pair(&b, "\u{4E2D}a", "ba").unwrap_err(),
            MappingStatus::MissingGlyph
        );
    }

    #[test]
    fn missing_base_font_is_method_fatal() {
        let err = BaseFont::load(Path::new("/no/such/base.ttf")).unwrap_err();
        assert!(matches!(err, AttackError::BaseAssetMissing { .. }));
    }
}
