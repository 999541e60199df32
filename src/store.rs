//! Run and stage persistence.
//!
//! The orchestrator records progress through two narrow traits so the
//! actual persistence backend (an external relational layer, out of
//! scope here) stays swappable. The in-memory implementation ships for
//! tests and for embedding the pipeline without a database; it is the
//! source of truth for resume semantics either way, since the
//! orchestrator only ever talks to the traits.

use crate::config::PipelineConfig;
use crate::error::AttackError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The caller's target subset was exhausted before the final
    /// canonical stage; the run can be resumed later.
    Paused,
}

/// Lifecycle of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    /// Last stage the orchestrator pointed at; retained when paused so a
    /// resume knows where it stood.
    pub current_stage: Option<String>,
    /// Planned stage list for this run, in execution order.
    pub stages: Vec<String>,
    pub config: PipelineConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: impl Into<String>, config: PipelineConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: RunStatus::Pending,
            current_stage: None,
            stages: Vec::new(),
            config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Persisted record for one (run, stage) pair. Created lazily the first
/// time the orchestrator reaches the stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub run_id: String,
    pub stage: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Service result payload, stored verbatim.
    pub stage_data: Option<serde_json::Value>,
    pub error_details: Option<String>,
}

impl StageRecord {
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            stage_data: None,
            error_details: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = StageStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.duration_ms = None;
        self.error_details = None;
    }

    pub fn mark_completed(&mut self, payload: serde_json::Value) {
        let now = Utc::now();
        self.status = StageStatus::Completed;
        self.duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        self.completed_at = Some(now);
        self.stage_data = Some(payload);
    }

    pub fn mark_failed(&mut self, detail: impl Into<String>) {
        let now = Utc::now();
        self.status = StageStatus::Failed;
        self.duration_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64);
        self.completed_at = Some(now);
        self.error_details = Some(detail.into());
    }
}

// ── Store traits ─────────────────────────────────────────────────────────

pub trait RunStore: Send + Sync {
    fn get_run(&self, run_id: &str) -> Result<Option<Run>, AttackError>;
    fn put_run(&self, run: &Run) -> Result<(), AttackError>;
}

pub trait StageStore: Send + Sync {
    fn get_stage(&self, run_id: &str, stage: &str) -> Result<Option<StageRecord>, AttackError>;
    fn put_stage(&self, record: &StageRecord) -> Result<(), AttackError>;
    /// All records for a run, in no particular order.
    fn stages_for_run(&self, run_id: &str) -> Result<Vec<StageRecord>, AttackError>;
}

// ── In-memory implementation ─────────────────────────────────────────────

/// Process-local store backing tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    runs: Mutex<HashMap<String, Run>>,
    stages: Mutex<HashMap<(String, String), StageRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(what: &str) -> AttackError {
    AttackError::Internal(format!("{what} store lock poisoned"))
}

impl RunStore for InMemoryStore {
    fn get_run(&self, run_id: &str) -> Result<Option<Run>, AttackError> {
        Ok(self
            .runs
            .lock()
            .map_err(|_| poisoned("run"))?
            .get(run_id)
            .cloned())
    }

    fn put_run(&self, run: &Run) -> Result<(), AttackError> {
        self.runs
            .lock()
            .map_err(|_| poisoned("run"))?
            .insert(run.id.clone(), run.clone());
        Ok(())
    }
}

impl StageStore for InMemoryStore {
    fn get_stage(&self, run_id: &str, stage: &str) -> Result<Option<StageRecord>, AttackError> {
        Ok(self
            .stages
            .lock()
            .map_err(|_| poisoned("stage"))?
            .get(&(run_id.to_string(), stage.to_string()))
            .cloned())
    }

    fn put_stage(&self, record: &StageRecord) -> Result<(), AttackError> {
        self.stages
            .lock()
            .map_err(|_| poisoned("stage"))?
            .insert(
                (record.run_id.clone(), record.stage.clone()),
                record.clone(),
            );
        Ok(())
    }

    fn stages_for_run(&self, run_id: &str) -> Result<Vec<StageRecord>, AttackError> {
        Ok(self
            .stages
            .lock()
            .map_err(|_| poisoned("stage"))?
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }
}
