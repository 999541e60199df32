//! Single-glyph substitution fonts.
//!
//! The font attack needs, for every (hidden, visual) character pair, a
//! font in which typing the *hidden* code point renders the *visual*
//! character's glyph. Rather than synthesising outlines, the builder
//! copies the base font wholesale and rewrites only its character map,
//! so the emitted font is a faithful clone of the base face with one
//! remapped code point.
//!
//! 1. [`plan`]    — per-character planning: pair up alphanumeric runs and
//!    resolve each visual character to a glyph id in the base face
//! 2. [`builder`] — content-addressed emission of the remapped fonts,
//!    with a pre-generated library checked before any runtime build

pub mod builder;
pub mod plan;

pub use builder::{FontAsset, FontBuilder, UNIVERSAL_HIDDEN};
pub use plan::{plan_pair, BaseFont, PlannedChar};
