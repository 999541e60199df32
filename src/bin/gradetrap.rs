//! CLI binary for gradetrap.
//!
//! A thin shim over the library crate that maps CLI flags to a
//! `PipelineConfig`, runs the pipeline against a structured document,
//! and prints the stage report.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gradetrap::{
    AttackGoal, AttackMethod, InMemoryStore, Orchestrator, PipelineConfig, PipelineMode, Run,
    RunStore, StageEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodArg {
    DualLayer,
    FontSubstitution,
    Watermark,
}

impl From<MethodArg> for AttackMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::DualLayer => AttackMethod::DualLayer,
            MethodArg::FontSubstitution => AttackMethod::FontSubstitution,
            MethodArg::Watermark => AttackMethod::Watermark,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum GoalArg {
    #[default]
    Detection,
    Prevention,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum ModeArg {
    #[default]
    Full,
    Evaluation,
}

/// Generate text-layer attack PDFs from a structured assessment document.
#[derive(Parser, Debug)]
#[command(name = "gradetrap", version, about)]
struct Cli {
    /// Structured document JSON (questions, mappings, source paths).
    document: PathBuf,

    /// Attack methods to run (default: all three).
    #[arg(long, value_enum, value_delimiter = ',')]
    methods: Vec<MethodArg>,

    /// Targeted mappings (detection) or blanket coverage (prevention).
    #[arg(long, value_enum, default_value_t)]
    goal: GoalArg,

    /// Full pipeline or evaluation-only (skips generation stages).
    #[arg(long, value_enum, default_value_t)]
    mode: ModeArg,

    /// Regenerate even when the mapping signature is unchanged.
    #[arg(long)]
    force: bool,

    /// Re-run stages whose persisted status is already completed.
    #[arg(long)]
    no_skip: bool,

    /// Root directory for artifacts.
    #[arg(long, default_value = "artifacts")]
    artifact_root: PathBuf,

    /// Base font for the glyph-substitution method.
    #[arg(long)]
    base_font: Option<PathBuf>,

    /// Directory of pre-generated substitution fonts.
    #[arg(long)]
    font_library: Option<PathBuf>,

    /// Per-pass TeX compile timeout, seconds.
    #[arg(long, default_value_t = 120)]
    compile_timeout: u64,

    /// Rasterisation zoom for overlay crops (1-6).
    #[arg(long, default_value_t = 2.0)]
    overlay_zoom: f32,

    /// Run identifier (defaults to the document file stem).
    #[arg(long)]
    run_id: Option<String>,

    /// Verbose logging (or set RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "gradetrap=debug" } else { "gradetrap=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with_target(false)
        .init();

    let methods: Vec<AttackMethod> = if cli.methods.is_empty() {
        vec![
            AttackMethod::DualLayer,
            AttackMethod::FontSubstitution,
            AttackMethod::Watermark,
        ]
    } else {
        cli.methods.iter().map(|&m| m.into()).collect()
    };

    // Scoring needs an embedded grader; the CLI stops after generation,
    // which leaves the run paused and resumable.
    let mut stages: Vec<String> = vec!["prepare".into()];
    stages.extend(methods.iter().map(|m| m.name().to_string()));

    let mut builder = PipelineConfig::builder()
        .methods(methods)
        .goal(match cli.goal {
            GoalArg::Detection => AttackGoal::Detection,
            GoalArg::Prevention => AttackGoal::Prevention,
        })
        .mode(match cli.mode {
            ModeArg::Full => PipelineMode::Full,
            ModeArg::Evaluation => PipelineMode::Evaluation,
        })
        .stages(stages)
        .skip_if_exists(!cli.no_skip)
        .force(cli.force)
        .artifact_root(&cli.artifact_root)
        .compile_timeout_secs(cli.compile_timeout)
        .overlay_zoom(cli.overlay_zoom);
    if let Some(font) = &cli.base_font {
        builder = builder.base_font(font);
    }
    if let Some(lib) = &cli.font_library {
        builder = builder.font_library(lib);
    }
    let config = builder.build().context("invalid configuration")?;

    let run_id = cli.run_id.clone().unwrap_or_else(|| {
        cli.document
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".into())
    });

    let store = Arc::new(InMemoryStore::new());
    store
        .put_run(&Run::new(run_id.clone(), config.clone()))
        .context("seed run record")?;
    let orchestrator =
        Orchestrator::new(store.clone(), store, &cli.document).with_builtin_stages();

    eprintln!(
        "{} {}",
        bold("gradetrap"),
        dim(&format!("run {run_id} on {}", cli.document.display()))
    );

    match orchestrator.execute(&run_id, &config).await {
        Ok(report) => {
            for event in &report.events {
                match event {
                    StageEvent::Skipped { stage } => {
                        eprintln!("  {} {stage} {}", dim("○"), dim("(skipped)"))
                    }
                    StageEvent::Started { .. } => {}
                    StageEvent::Completed { stage, duration_ms } => {
                        eprintln!("  {} {stage} {}", green("✓"), dim(&format!("{duration_ms}ms")))
                    }
                    StageEvent::Failed { stage, detail } => {
                        eprintln!("  {} {stage}: {detail}", red("✗"))
                    }
                }
            }
            eprintln!("{} run {run_id}: {:?}", green("◆"), report.status);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {e}", red("✗"));
            Err(e.into())
        }
    }
}
