//! Content-addressed emission of single-remap substitution fonts.
//!
//! Every emitted font is the base face with its `cmap` table replaced by
//! a minimal format-4 subtable mapping exactly one code point (the
//! hidden character) to the visual character's glyph id. All other
//! tables are carried over byte-for-byte, so metrics, hinting, and
//! outlines stay identical to the base face.
//!
//! Fonts are keyed by sha256(hidden, visual, base-font hash): the same
//! pair always yields the same file, a pre-generated library directory
//! is consulted before any runtime build, and repeated requests within a
//! run are served from an in-memory map.

use crate::error::AttackError;
use crate::font::plan::BaseFont;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

/// Private-use code point that every prevention-mode stem is rewritten
/// to. Keeping a single hidden character means prevention needs one font
/// per distinct visual glyph instead of one per (hidden, visual) pair.
pub const UNIVERSAL_HIDDEN: char = '\u{E000}';

/// A font the builder has made available for compilation.
#[derive(Debug, Clone)]
pub struct FontAsset {
    /// On-disk TTF, staged into the compile workdir by the caller.
    pub path: PathBuf,
    /// LaTeX-safe family identifier, stable per content key.
    pub family_id: String,
}

/// Counters reported in the font method's diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FontBuildStats {
    pub library_hits: usize,
    pub runtime_builds: usize,
}

/// Builds (or locates) substitution fonts for one attack run.
pub struct FontBuilder {
    base: BaseFont,
    out_dir: PathBuf,
    library: Option<PathBuf>,
    built: HashMap<String, FontAsset>,
    stats: FontBuildStats,
}

impl FontBuilder {
    /// `out_dir` receives runtime-built fonts (created on demand);
    /// `library` is an optional directory of pre-generated fonts using
    /// the same content-key naming.
    pub fn new(base: BaseFont, out_dir: PathBuf, library: Option<PathBuf>) -> Self {
        Self {
            base,
            out_dir,
            library,
            built: HashMap::new(),
            stats: FontBuildStats::default(),
        }
    }

    pub fn base(&self) -> &BaseFont {
        &self.base
    }

    pub fn stats(&self) -> FontBuildStats {
        self.stats
    }

    /// All fonts produced or located so far, for staging into the
    /// compile workdir.
    pub fn assets(&self) -> Vec<PathBuf> {
        self.built.values().map(|a| a.path.clone()).collect()
    }

    /// Font in which typing `hidden` renders `visual`'s base-face glyph.
    ///
    /// Library first, then runtime build; either way the result is
    /// memoised for the rest of the run.
    pub fn font_for(&mut self, hidden: char, visual: char) -> Result<FontAsset, AttackError> {
        let key = content_key(hidden, visual, &self.base.sha256);
        if let Some(asset) = self.built.get(&key) {
            return Ok(asset.clone());
        }

        let file_name = format!("sub_{}.ttf", &key[..16]);
        let family_id = family_id(&key);

        if let Some(lib) = &self.library {
            let lib_path = lib.join(&file_name);
            if lib_path.exists() {
                debug!("font library hit for U+{:04X}→'{visual}'", hidden as u32);
                self.stats.library_hits += 1;
                let asset = FontAsset {
                    path: lib_path,
                    family_id,
                };
                self.built.insert(key, asset.clone());
                return Ok(asset);
            }
        }

        let glyph_id = self
            .base
            .glyph_id(visual)
            .ok_or_else(|| AttackError::Internal(format!("no glyph for '{visual}' in base font")))?;
        let data = remap_font(&self.base.data, hidden, glyph_id)?;

        std::fs::create_dir_all(&self.out_dir).map_err(|e| AttackError::ArtifactWriteFailed {
            path: self.out_dir.clone(),
            source: e,
        })?;
        let path = self.out_dir.join(&file_name);
        std::fs::write(&path, &data).map_err(|e| AttackError::ArtifactWriteFailed {
            path: path.clone(),
            source: e,
        })?;
        info!(
            "built substitution font {file_name} (U+{:04X} renders '{visual}')",
            hidden as u32
        );
        self.stats.runtime_builds += 1;

        let asset = FontAsset { path, family_id };
        self.built.insert(key, asset.clone());
        Ok(asset)
    }
}

fn content_key(hidden: char, visual: char, base_sha256: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((hidden as u32).to_be_bytes());
    hasher.update((visual as u32).to_be_bytes());
    hasher.update(base_sha256.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Control sequence names cannot contain digits, so hex nibbles are
/// spelled with the letters 'a'..='p'.
fn family_id(key: &str) -> String {
    let mut id = String::from("gt");
    for c in key.chars().take(8) {
        let nibble = c.to_digit(16).unwrap_or(0) as u8;
        id.push((b'a' + nibble) as char);
    }
    id
}

// ── sfnt rewriting ──────────────────────────────────────────────────────

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes([
        *data.get(at)?,
        *data.get(at + 1)?,
        *data.get(at + 2)?,
        *data.get(at + 3)?,
    ]))
}

/// Standard sfnt checksum: sum of big-endian u32 words, zero-padded.
fn table_checksum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut i = 0;
    while i < data.len() {
        let mut word = [0u8; 4];
        for (j, b) in data[i..data.len().min(i + 4)].iter().enumerate() {
            word[j] = *b;
        }
        sum = sum.wrapping_add(u32::from_be_bytes(word));
        i += 4;
    }
    sum
}

/// Minimal cmap: version 0, one encoding record (Windows Unicode BMP),
/// format-4 subtable with the mapped segment plus the 0xFFFF terminator.
fn minimal_cmap(hidden: u16, glyph_id: u16) -> Vec<u8> {
    let id_delta = glyph_id.wrapping_sub(hidden);

    let mut cmap = Vec::with_capacity(44);
    cmap.extend(0u16.to_be_bytes()); // version
    cmap.extend(1u16.to_be_bytes()); // numTables
    cmap.extend(3u16.to_be_bytes()); // platformID: Windows
    cmap.extend(1u16.to_be_bytes()); // encodingID: Unicode BMP
    cmap.extend(12u32.to_be_bytes()); // subtable offset

    // Format 4, segCount = 2.
    cmap.extend(4u16.to_be_bytes()); // format
    cmap.extend(32u16.to_be_bytes()); // length
    cmap.extend(0u16.to_be_bytes()); // language
    cmap.extend(4u16.to_be_bytes()); // segCountX2
    cmap.extend(4u16.to_be_bytes()); // searchRange
    cmap.extend(1u16.to_be_bytes()); // entrySelector
    cmap.extend(0u16.to_be_bytes()); // rangeShift
    cmap.extend(hidden.to_be_bytes()); // endCode[0]
    cmap.extend(0xFFFFu16.to_be_bytes()); // endCode[1]
    cmap.extend(0u16.to_be_bytes()); // reservedPad
    cmap.extend(hidden.to_be_bytes()); // startCode[0]
    cmap.extend(0xFFFFu16.to_be_bytes()); // startCode[1]
    cmap.extend(id_delta.to_be_bytes()); // idDelta[0]
    cmap.extend(1u16.to_be_bytes()); // idDelta[1]: 0xFFFF → .notdef
    cmap.extend(0u16.to_be_bytes()); // idRangeOffset[0]
    cmap.extend(0u16.to_be_bytes()); // idRangeOffset[1]
    cmap
}

/// Clone `base` with its cmap replaced so that `hidden` maps to
/// `glyph_id` and nothing else maps at all.
fn remap_font(base: &[u8], hidden: char, glyph_id: u16) -> Result<Vec<u8>, AttackError> {
    let hidden_cp = hidden as u32;
    if hidden_cp > 0xFFFF {
        return Err(AttackError::Internal(format!(
            "hidden code point U+{hidden_cp:04X} outside the BMP"
        )));
    }
    let new_cmap = minimal_cmap(hidden_cp as u16, glyph_id);

    let malformed = || AttackError::Internal("base font directory truncated".into());
    let num_tables = be_u16(base, 4).ok_or_else(malformed)? as usize;

    // Collect (tag, data) preserving directory order; swap in the cmap.
    let mut tables: Vec<([u8; 4], Vec<u8>)> = Vec::with_capacity(num_tables);
    let mut had_cmap = false;
    for i in 0..num_tables {
        let rec = 12 + i * 16;
        let tag: [u8; 4] = base
            .get(rec..rec + 4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(malformed)?;
        let offset = be_u32(base, rec + 8).ok_or_else(malformed)? as usize;
        let length = be_u32(base, rec + 12).ok_or_else(malformed)? as usize;
        let data = if &tag == b"cmap" {
            had_cmap = true;
            new_cmap.clone()
        } else {
            base.get(offset..offset + length)
                .ok_or_else(malformed)?
                .to_vec()
        };
        tables.push((tag, data));
    }
    if !had_cmap {
        return Err(AttackError::Internal("base font has no cmap table".into()));
    }

    // Reassemble: original 12-byte offset table is still valid since the
    // table count is unchanged.
    let mut font = base[..12].to_vec();
    let mut offset = 12 + num_tables * 16;
    let mut head_record: Option<(usize, usize)> = None; // (record pos, data offset)
    let mut directory = Vec::with_capacity(num_tables * 16);
    let mut body = Vec::new();
    for (tag, data) in &tables {
        let record_pos = 12 + directory.len();
        directory.extend_from_slice(tag);
        directory.extend(table_checksum(data).to_be_bytes());
        directory.extend((offset as u32).to_be_bytes());
        directory.extend((data.len() as u32).to_be_bytes());
        if tag == b"head" {
            head_record = Some((record_pos, offset));
        }
        body.extend_from_slice(data);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        offset = 12 + num_tables * 16 + body.len();
    }
    font.extend(&directory);
    font.extend(&body);

    // head.checkSumAdjustment: zero it, checksum head over the zeroed
    // bytes, then set it so the whole file sums to 0xB1B0AFBA.
    if let Some((record_pos, head_offset)) = head_record {
        let adj = head_offset + 8;
        font[adj..adj + 4].copy_from_slice(&[0; 4]);
        let head_len = be_u32(&font, record_pos + 12).ok_or_else(malformed)? as usize;
        let head_sum = table_checksum(&font[head_offset..head_offset + head_len]);
        font[record_pos + 4..record_pos + 8].copy_from_slice(&head_sum.to_be_bytes());
        let adjustment = 0xB1B0AFBAu32.wrapping_sub(table_checksum(&font));
        font[adj..adj + 4].copy_from_slice(&adjustment.to_be_bytes());
    }

    Ok(font)
}
