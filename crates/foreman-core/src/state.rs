//! Mutable execution state.
//!
//! [`ExecutionState`] is the single mutable focus of the engine. Only the
//! workflow executor writes stage state, only the orchestrator appends to
//! the tracker; everything else reads. The serialized form is the state
//! store blob, versioned by `schema_version`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{JournalEntry, SharedEntry};
use crate::tracker::SkillExecution;

/// Version tag on every persisted blob. Bump on incompatible layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Stage lifecycle. Completed is terminal; Blocked returns to InProgress via
/// an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

/// Descriptor of a persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub stage_id: Option<String>,
}

/// Live workflow execution state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub current_stage_id: Option<String>,
    pub current_role_id: Option<String>,
    #[serde(default)]
    pub stage_states: HashMap<String, StageState>,
    /// Completion order, append-only.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Agent id → role id for agents currently considered live.
    #[serde(default)]
    pub active_agents: HashMap<String, String>,
    /// Findings per blocked stage, cleared on retry.
    #[serde(default)]
    pub findings: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointMeta>,
}

impl ExecutionState {
    pub fn new(workflow_id: impl Into<String>, stage_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stage_states: stage_ids
                .into_iter()
                .map(|id| (id, StageState::Pending))
                .collect(),
            ..Default::default()
        }
    }

    pub fn stage_state(&self, stage_id: &str) -> StageState {
        self.stage_states
            .get(stage_id)
            .copied()
            .unwrap_or(StageState::Pending)
    }

    pub fn is_completed(&self, stage_id: &str) -> bool {
        self.stage_state(stage_id) == StageState::Completed
    }

    pub fn all_completed(&self) -> bool {
        self.stage_states
            .values()
            .all(|s| *s == StageState::Completed)
    }

    pub fn blocked_stages(&self) -> Vec<String> {
        let mut blocked: Vec<String> = self
            .stage_states
            .iter()
            .filter(|(_, s)| **s == StageState::Blocked)
            .map(|(id, _)| id.clone())
            .collect();
        blocked.sort_unstable();
        blocked
    }
}

/// The complete persisted form of a workflow's execution: state machine,
/// tracker log, shared context and bus journal tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    pub schema_version: u32,
    pub state: ExecutionState,
    #[serde(default)]
    pub tracker: Vec<SkillExecution>,
    #[serde(default)]
    pub shared_context: HashMap<String, SharedEntry>,
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
}

impl StateDocument {
    pub fn new(
        state: ExecutionState,
        tracker: Vec<SkillExecution>,
        shared_context: HashMap<String, SharedEntry>,
        journal: Vec<JournalEntry>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            state,
            tracker,
            shared_context,
            journal,
        }
    }
}
