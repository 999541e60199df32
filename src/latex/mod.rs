//! LaTeX source handling shared by all three attack engines.
//!
//! Each submodule covers exactly one concern:
//!
//! 1. [`segment`] — split the document into per-question segments,
//!    search mappings with whitespace tolerance, and apply edits under
//!    occupied-range tracking
//! 2. [`compile`] — drive the external TeX engine in an isolated
//!    working copy, two passes, time-boxed

pub mod compile;
pub mod segment;

use once_cell::sync::Lazy;
use regex::Regex;

static RE_BEGIN_DOCUMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\begin\{document\}").unwrap());

/// Insert `block` into the preamble, immediately before
/// `\begin{document}`. Sources without a preamble (fragments) get the
/// block prepended instead.
pub fn insert_into_preamble(source: &str, block: &str) -> String {
    match RE_BEGIN_DOCUMENT.find(source) {
        Some(m) => {
            let mut out = String::with_capacity(source.len() + block.len() + 2);
            out.push_str(&source[..m.start()]);
            out.push_str(block);
            if !block.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&source[m.start()..]);
            out
        }
        None => format!("{block}\n{source}"),
    }
}
