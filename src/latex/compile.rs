//! External TeX compilation: two-pass, non-interactive, time-boxed.
//!
//! ## Why an isolated working copy?
//!
//! The rewritten source must never clobber the original document's
//! directory: aux files, generated fonts, and the output PDF all land in
//! a per-invocation tempdir that holds the attacked source plus copies
//! of whatever assets the source references. The compile either yields a
//! complete PDF there or nothing usable at all.
//!
//! ## Why two passes, and why is a timeout a failure?
//!
//! Cross-references and list counters settle on the second pass; more
//! passes never change the attack-relevant output, so two is the cap. A
//! pass that exceeds its timeout is killed and treated identically to a
//! non-zero exit: no partial PDF is ever considered usable.

use crate::error::AttackError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Which external engine variant to invoke.
///
/// The overlay method only needs the fixed engine; the font method
/// requires the variable-font-capable one for inline per-glyph font
/// switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TexEngine {
    Pdflatex,
    Lualatex,
}

impl TexEngine {
    pub fn command(self) -> &'static str {
        match self {
            TexEngine::Pdflatex => "pdflatex",
            TexEngine::Lualatex => "lualatex",
        }
    }
}

/// Outcome of one engine pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    /// Process exit code; `None` when the pass was killed on timeout.
    pub exit_code: Option<i32>,
    /// Captured log size for this pass, in bytes.
    pub log_bytes: usize,
}

/// Result of invoking the external typesetting engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileSummary {
    pub success: bool,
    pub engine: TexEngine,
    pub duration_ms: u64,
    pub passes: Vec<PassReport>,
    pub error: Option<String>,
}

/// Everything a successful compile produces.
#[derive(Debug)]
pub struct CompileOutput {
    pub summary: CompileSummary,
    /// Combined log of all passes.
    pub log: String,
    /// The produced PDF; `None` unless `summary.success`.
    pub pdf_path: Option<PathBuf>,
}

/// Compile `tex_file` (a file name inside `workdir`) with up to two
/// passes of `engine`, each capped at `timeout`.
pub async fn compile(
    engine: TexEngine,
    workdir: &Path,
    tex_file: &str,
    timeout: Duration,
) -> CompileOutput {
    let start = Instant::now();
    let mut passes = Vec::with_capacity(2);
    let mut log = String::new();
    let mut error = None;

    for pass in 1u8..=2 {
        debug!("{} pass {pass} on {}", engine.command(), tex_file);
        match run_pass(engine, workdir, tex_file, timeout).await {
            PassOutcome::Completed { code, output } => {
                log.push_str(&format!("── pass {pass} (exit {code:?}) ──\n"));
                log.push_str(&output);
                passes.push(PassReport {
                    exit_code: code,
                    log_bytes: output.len(),
                });
                if code != Some(0) {
                    error = Some(format!("pass {pass} exited with {code:?}"));
                    break;
                }
            }
            PassOutcome::TimedOut { output } => {
                warn!("{} pass {pass} timed out after {timeout:?}", engine.command());
                log.push_str(&format!("── pass {pass} (timed out) ──\n"));
                log.push_str(&output);
                passes.push(PassReport {
                    exit_code: None,
                    log_bytes: output.len(),
                });
                error = Some(format!("pass {pass} timed out after {}s", timeout.as_secs()));
                break;
            }
            PassOutcome::SpawnFailed { detail } => {
                passes.push(PassReport {
                    exit_code: None,
                    log_bytes: 0,
                });
                error = Some(format!("could not start {}: {detail}", engine.command()));
                break;
            }
        }
    }

    let success = error.is_none();
    let duration_ms = start.elapsed().as_millis() as u64;
    let pdf_path = if success {
        let stem = Path::new(tex_file)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| tex_file.to_string());
        let pdf = workdir.join(format!("{stem}.pdf"));
        if pdf.exists() {
            Some(pdf)
        } else {
            error = Some("engine reported success but produced no PDF".into());
            None
        }
    } else {
        None
    };
    let success = success && pdf_path.is_some();

    info!(
        "compile {} → success={success} in {duration_ms}ms ({} passes)",
        tex_file,
        passes.len()
    );

    CompileOutput {
        summary: CompileSummary {
            success,
            engine,
            duration_ms,
            passes,
            error,
        },
        log,
        pdf_path,
    }
}

enum PassOutcome {
    Completed { code: Option<i32>, output: String },
    TimedOut { output: String },
    SpawnFailed { detail: String },
}

async fn run_pass(
    engine: TexEngine,
    workdir: &Path,
    tex_file: &str,
    timeout: Duration,
) -> PassOutcome {
    let child = match Command::new(engine.command())
        .arg("-interaction=nonstopmode")
        .arg("-halt-on-error")
        .arg(tex_file)
        .current_dir(workdir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return PassOutcome::SpawnFailed {
                detail: e.to_string(),
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            PassOutcome::Completed {
                code: out.status.code(),
                output,
            }
        }
        Ok(Err(e)) => PassOutcome::SpawnFailed {
            detail: e.to_string(),
        },
        // kill_on_drop reaps the child when the future is dropped here.
        Err(_) => PassOutcome::TimedOut {
            output: String::new(),
        },
    }
}

/// Set up an isolated working copy: write the attacked source into a
/// fresh tempdir and copy sibling assets (graphics, fonts, class files)
/// the source may reference.
pub fn prepare_workdir(
    attacked_source: &str,
    tex_file: &str,
    source_dir: Option<&Path>,
) -> Result<tempfile::TempDir, AttackError> {
    let dir = tempfile::tempdir()
        .map_err(|e| AttackError::Internal(format!("compile tempdir: {e}")))?;
    let tex_path = dir.path().join(tex_file);
    std::fs::write(&tex_path, attacked_source).map_err(|e| AttackError::ArtifactWriteFailed {
        path: tex_path.clone(),
        source: e,
    })?;

    if let Some(src_dir) = source_dir {
        copy_assets(src_dir, dir.path());
    }
    Ok(dir)
}

/// Asset extensions worth carrying into the working copy.
const ASSET_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "pdf", "eps", "ttf", "otf", "sty", "cls", "bib",
];

fn copy_assets(from: &Path, to: &Path) {
    let Ok(entries) = std::fs::read_dir(from) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_asset = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ASSET_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false);
        if is_asset {
            if let Some(name) = path.file_name() {
                if let Err(e) = std::fs::copy(&path, to.join(name)) {
                    warn!("could not copy asset {} into workdir: {e}", path.display());
                }
            }
        }
    }
}

/// Copy generated font files into the working copy's `fonts/` directory
/// (font method only; referenced by relative path from the preamble).
pub fn stage_fonts(workdir: &Path, fonts: &[PathBuf]) -> Result<(), AttackError> {
    if fonts.is_empty() {
        return Ok(());
    }
    let font_dir = workdir.join("fonts");
    std::fs::create_dir_all(&font_dir).map_err(|e| AttackError::ArtifactWriteFailed {
        path: font_dir.clone(),
        source: e,
    })?;
    for font in fonts {
        if let Some(name) = font.file_name() {
            std::fs::copy(font, font_dir.join(name)).map_err(|e| {
                AttackError::ArtifactWriteFailed {
                    path: font.clone(),
                    source: e,
                }
            })?;
        }
    }
    Ok(())
}
