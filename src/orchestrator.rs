//! Stage orchestration: sequence, resume, and persist pipeline runs.
//!
//! A run walks an ordered stage list. Each stage is persisted as a
//! [`StageRecord`] before and after its service executes, so a crashed
//! or failed run can be re-executed and picks up where it left off:
//! stages already `completed` are skipped (when `skip_if_exists` is on),
//! the failed stage runs again, and everything downstream follows.
//!
//! Strictness is deliberate: any stage service error fails the whole
//! run. The engines underneath degrade per mapping; by the time an
//! error surfaces here it is structural, and rerunning later stages on
//! top of it would only bury the problem.

use crate::attack;
use crate::config::{AttackMethod, PipelineConfig, PipelineMode};
use crate::document::StructuredDocument;
use crate::error::AttackError;
use crate::store::{RunStatus, RunStore, StageRecord, StageStatus, StageStore};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Canonical stage order. Every planned run is a subsequence of this
/// list (plus any registered custom stages appended at the end).
pub const CANONICAL_STAGES: &[&str] = &[
    "prepare",
    "dual_layer",
    "font_substitution",
    "watermark",
    "scoring",
];

/// The stages `Mode::Evaluation` removes up front.
const GENERATION_STAGES: &[&str] = &["dual_layer", "font_substitution", "watermark"];

/// Everything a stage service gets to see.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: String,
    pub config: PipelineConfig,
    /// The shared structured document (JSON) all stages read and write.
    pub document_path: PathBuf,
}

/// One pipeline stage. Implementations are registered by name; the name
/// must match the stage's entry in the planned list.
pub trait StageService: Send + Sync {
    fn name(&self) -> &str;
    fn run<'a>(&'a self, ctx: StageContext)
        -> BoxFuture<'a, Result<serde_json::Value, AttackError>>;
}

/// Observable stage transitions, returned with the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StageEvent {
    Skipped { stage: String },
    Started { stage: String },
    Completed { stage: String, duration_ms: u64 },
    Failed { stage: String, detail: String },
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub events: Vec<StageEvent>,
}

pub struct Orchestrator {
    run_store: Arc<dyn RunStore>,
    stage_store: Arc<dyn StageStore>,
    services: HashMap<String, Arc<dyn StageService>>,
    document_path: PathBuf,
}

impl Orchestrator {
    pub fn new(
        run_store: Arc<dyn RunStore>,
        stage_store: Arc<dyn StageStore>,
        document_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_store,
            stage_store,
            services: HashMap::new(),
            document_path: document_path.into(),
        }
    }

    /// Register the built-in prepare + attack-generation services.
    pub fn with_builtin_stages(mut self) -> Self {
        self.register(Arc::new(PrepareStage));
        for method in [
            AttackMethod::DualLayer,
            AttackMethod::FontSubstitution,
            AttackMethod::Watermark,
        ] {
            self.register(Arc::new(AttackStage { method }));
        }
        self
    }

    pub fn register(&mut self, service: Arc<dyn StageService>) {
        self.services.insert(service.name().to_string(), service);
    }

    /// The full stage list this config would run (canonical order,
    /// evaluation-mode and method filtering applied).
    fn effective_canonical(&self, config: &PipelineConfig) -> Vec<String> {
        CANONICAL_STAGES
            .iter()
            .filter(|&&s| {
                if GENERATION_STAGES.contains(&s) {
                    if config.mode == PipelineMode::Evaluation {
                        return false;
                    }
                    return config.methods.iter().any(|m| m.name() == s);
                }
                true
            })
            .map(|&s| s.to_string())
            .collect()
    }

    /// Resolve the caller's target subset into execution order.
    ///
    /// Requested stages are re-ordered to canonical order; names outside
    /// the canonical list must have a registered service and are
    /// appended in request order.
    pub fn plan_stages(&self, config: &PipelineConfig) -> Result<Vec<String>, AttackError> {
        let canonical = self.effective_canonical(config);
        if config.stages.is_empty() {
            return Ok(canonical);
        }

        let mut planned: Vec<String> = canonical
            .iter()
            .filter(|s| config.stages.contains(s))
            .cloned()
            .collect();
        for requested in &config.stages {
            if CANONICAL_STAGES.contains(&requested.as_str()) {
                continue;
            }
            if !self.services.contains_key(requested) {
                return Err(AttackError::UnknownStage {
                    stage: requested.clone(),
                    known: CANONICAL_STAGES.join(", "),
                });
            }
            planned.push(requested.clone());
        }
        Ok(planned)
    }

    /// Execute a run to completion, failure, or pause.
    pub async fn execute(
        &self,
        run_id: &str,
        config: &PipelineConfig,
    ) -> Result<RunReport, AttackError> {
        let mut run = self
            .run_store
            .get_run(run_id)?
            .ok_or_else(|| AttackError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        let planned = self.plan_stages(config)?;
        let canonical = self.effective_canonical(config);

        run.stages = planned.clone();
        run.status = RunStatus::Running;
        run.touch();
        self.run_store.put_run(&run)?;

        let mut events = Vec::new();
        for stage in &planned {
            run.current_stage = Some(stage.clone());
            run.touch();
            self.run_store.put_run(&run)?;

            if config.skip_if_exists {
                if let Some(existing) = self.stage_store.get_stage(run_id, stage)? {
                    if existing.status == StageStatus::Completed {
                        info!("run {run_id}: stage '{stage}' already completed, skipping");
                        events.push(StageEvent::Skipped {
                            stage: stage.clone(),
                        });
                        continue;
                    }
                }
            }

            let service = self.services.get(stage).ok_or_else(|| {
                AttackError::UnknownStage {
                    stage: stage.clone(),
                    known: self.services.keys().cloned().collect::<Vec<_>>().join(", "),
                }
            })?;

            let mut record = self
                .stage_store
                .get_stage(run_id, stage)?
                .unwrap_or_else(|| StageRecord::new(run_id, stage.clone()));
            record.mark_running();
            self.stage_store.put_stage(&record)?;
            events.push(StageEvent::Started {
                stage: stage.clone(),
            });
            info!("run {run_id}: stage '{stage}' started");

            let ctx = StageContext {
                run_id: run_id.to_string(),
                config: config.clone(),
                document_path: self.document_path.clone(),
            };
            match service.run(ctx).await {
                Ok(payload) => {
                    record.mark_completed(payload);
                    self.stage_store.put_stage(&record)?;
                    let duration_ms = record.duration_ms.unwrap_or(0);
                    events.push(StageEvent::Completed {
                        stage: stage.clone(),
                        duration_ms,
                    });
                    info!("run {run_id}: stage '{stage}' completed in {duration_ms}ms");
                }
                Err(e) => {
                    let detail = e.to_string();
                    error!("run {run_id}: stage '{stage}' failed: {detail}");
                    record.mark_failed(detail.clone());
                    self.stage_store.put_stage(&record)?;
                    run.status = RunStatus::Failed;
                    run.touch();
                    self.run_store.put_run(&run)?;
                    events.push(StageEvent::Failed {
                        stage: stage.clone(),
                        detail: detail.clone(),
                    });
                    return Err(AttackError::StageExecutionFailed {
                        run_id: run_id.to_string(),
                        stage: stage.clone(),
                        detail,
                    });
                }
            }
        }

        // Reaching the final canonical stage completes the run; an
        // earlier-ending target subset leaves it paused and resumable,
        // with current_stage still pointing at the last stage touched.
        let finished = planned.last() == canonical.last();
        run.status = if finished {
            RunStatus::Completed
        } else {
            warn!("run {run_id}: target subset exhausted early, pausing");
            RunStatus::Paused
        };
        run.touch();
        self.run_store.put_run(&run)?;

        Ok(RunReport {
            run_id: run_id.to_string(),
            status: run.status,
            events,
        })
    }

    /// Launch a run on a background task. The handle delivers the final
    /// report; dropping it does not cancel the run.
    pub fn start_background(self: &Arc<Self>, run_id: String, config: PipelineConfig) -> RunHandle {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let orchestrator = Arc::clone(self);
        let join = tokio::spawn(async move {
            let result = orchestrator.execute(&run_id, &config).await;
            let _ = tx.send(result).await;
        });
        RunHandle { join, rx }
    }
}

/// Handle to a background run.
pub struct RunHandle {
    join: tokio::task::JoinHandle<()>,
    rx: tokio::sync::mpsc::Receiver<Result<RunReport, AttackError>>,
}

impl RunHandle {
    /// Wait for the run to finish and take its report.
    pub async fn wait(mut self) -> Result<RunReport, AttackError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(AttackError::Internal(
                "background run ended without reporting".into(),
            )),
        }
    }

    /// Coarse cancellation: aborts the task wherever it is. Persisted
    /// state stays whatever the last stage write left behind.
    pub fn abort(&self) {
        self.join.abort();
    }
}

// ── Built-in stage services ──────────────────────────────────────────────

/// Validates the shared document and its referenced source up front, so
/// later stages fail fast on missing inputs.
struct PrepareStage;

impl StageService for PrepareStage {
    fn name(&self) -> &str {
        "prepare"
    }

    fn run<'a>(
        &'a self,
        ctx: StageContext,
    ) -> BoxFuture<'a, Result<serde_json::Value, AttackError>> {
        async move {
            let doc = StructuredDocument::load(&ctx.document_path)?;
            if !doc.document.latex_path.exists() {
                return Err(AttackError::SourceNotFound {
                    path: doc.document.latex_path.clone(),
                });
            }
            let mapping_count: usize =
                doc.questions.iter().map(|q| q.validated_mappings().count()).sum();
            Ok(serde_json::json!({
                "questions": doc.questions.len(),
                "validated_mappings": mapping_count,
            }))
        }
        .boxed()
    }
}

/// Runs one attack engine against the shared document and writes the
/// updated document back, whatever the outcome, so method errors are
/// visible in `manipulation_results` even when the stage fails.
struct AttackStage {
    method: AttackMethod,
}

impl StageService for AttackStage {
    fn name(&self) -> &str {
        self.method.name()
    }

    fn run<'a>(
        &'a self,
        ctx: StageContext,
    ) -> BoxFuture<'a, Result<serde_json::Value, AttackError>> {
        async move {
            let mut doc = StructuredDocument::load(&ctx.document_path)?;
            let outcome = match self.method {
                AttackMethod::DualLayer => attack::dual_layer::run(&mut doc, &ctx.config).await,
                AttackMethod::FontSubstitution => {
                    attack::font_substitution::run(&mut doc, &ctx.config).await
                }
                AttackMethod::Watermark => attack::watermark::run(&mut doc, &ctx.config).await,
            };
            match outcome {
                Ok(result) => {
                    doc.save(&ctx.document_path)?;
                    serde_json::to_value(&result)
                        .map_err(|e| AttackError::Internal(format!("stage payload: {e}")))
                }
                Err(e) => {
                    // Best effort: the engine may have recorded a method
                    // error on the document already.
                    let _ = doc.save(&ctx.document_path);
                    Err(e)
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    struct FixedStage {
        name: &'static str,
        fail: bool,
    }

    impl StageService for FixedStage {
        fn name(&self) -> &str {
            self.name
        }

        fn run<'a>(
            &'a self,
            _ctx: StageContext,
        ) -> BoxFuture<'a, Result<serde_json::Value, AttackError>> {
            async move {
                if self.fail {
                    Err(AttackError::Internal("boom".into()))
                } else {
                    Ok(serde_json::json!({"ran": self.name}))
                }
            }
            .boxed()
        }
    }

    fn orchestrator_with(stages: Vec<(&'static str, bool)>) -> (Arc<Orchestrator>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let mut orch = Orchestrator::new(store.clone(), store.clone(), "/tmp/doc.json");
        for (name, fail) in stages {
            orch.register(Arc::new(FixedStage { name, fail }));
        }
        (Arc::new(orch), store)
    }

    #[test]
    fn plan_reorders_subset_to_canonical_order() {
        let (orch, _) = orchestrator_with(vec![]);
        let config = PipelineConfig::builder()
            .stages(["watermark", "prepare"])
            .build()
            .unwrap();
        assert_eq!(orch.plan_stages(&config).unwrap(), vec!["prepare", "watermark"]);
    }

    #[test]
    fn plan_rejects_unregistered_unknown_stage() {
        let (orch, _) = orchestrator_with(vec![]);
        let config = PipelineConfig::builder()
            .stages(["prepare", "mystery"])
            .build()
            .unwrap();
        assert!(matches!(
            orch.plan_stages(&config).unwrap_err(),
            AttackError::UnknownStage { .. }
        ));
    }

    #[test]
    fn plan_appends_registered_custom_stage() {
        let (orch, _) = orchestrator_with(vec![("audit", false)]);
        let config = PipelineConfig::builder()
            .stages(["audit", "prepare"])
            .build()
            .unwrap();
        assert_eq!(orch.plan_stages(&config).unwrap(), vec!["prepare", "audit"]);
    }

    #[test]
    fn evaluation_mode_drops_generation_stages() {
        let (orch, _) = orchestrator_with(vec![]);
        let config = PipelineConfig::builder()
            .mode(PipelineMode::Evaluation)
            .build()
            .unwrap();
        assert_eq!(orch.plan_stages(&config).unwrap(), vec!["prepare", "scoring"]);
    }

    #[tokio::test]
    async fn execute_unknown_run_is_not_found() {
        let (orch, _) = orchestrator_with(vec![]);
        let config = PipelineConfig::builder().build().unwrap();
        let err = orch.execute("ghost", &config).await.unwrap_err();
        assert!(matches!(err, AttackError::RunNotFound { .. }));
    }
}
