//! Checkpoint management.
//!
//! A checkpoint is a serializable snapshot of the full [`StateDocument`]:
//! execution state, tracker log, bus shared context and journal tail.
//! Restore fully replaces live state. Checkpoints live in the state store
//! next to the live blob, keyed `{workflow_id}:{checkpoint_id}`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::state::StateDocument;
use crate::store::StateStore;

/// A persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub document: StateDocument,
}

pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    workflow_id: String,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>, workflow_id: impl Into<String>) -> Self {
        Self {
            store,
            workflow_id: workflow_id.into(),
        }
    }

    fn key(&self, checkpoint_id: &str) -> String {
        format!("{}:{}", self.workflow_id, checkpoint_id)
    }

    /// Snapshot the given document under a new checkpoint id.
    pub fn create(&self, name: Option<&str>, document: StateDocument) -> Result<Checkpoint> {
        let id = format!("ckpt-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let checkpoint = Checkpoint {
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| {
                    document
                        .state
                        .current_stage_id
                        .clone()
                        .map(|s| format!("at {s}"))
                        .unwrap_or_else(|| "checkpoint".to_string())
                }),
            created_at: Utc::now(),
            document,
            id: id.clone(),
        };
        let blob = serde_json::to_vec(&checkpoint)?;
        self.store.save(&self.key(&id), &blob)?;
        info!(checkpoint = %id, workflow = %self.workflow_id, "checkpoint created");
        Ok(checkpoint)
    }

    /// All checkpoints for this workflow, newest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let prefix = format!("{}:", self.workflow_id);
        let mut checkpoints = Vec::new();
        for key in self.store.list()? {
            if key.starts_with(&prefix) {
                if let Some(blob) = self.store.load(&key)? {
                    checkpoints.push(serde_json::from_slice::<Checkpoint>(&blob)?);
                }
            }
        }
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    pub fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        match self.store.load(&self.key(checkpoint_id))? {
            Some(blob) => Ok(Some(serde_json::from_slice(&blob)?)),
            None => Ok(None),
        }
    }

    /// Load a checkpoint for restore. The caller replaces live state with
    /// the returned document.
    pub fn restore(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.get(checkpoint_id)?.ok_or_else(|| {
            EngineError::Internal(format!("checkpoint '{checkpoint_id}' not found"))
        })
    }

    pub fn delete(&self, checkpoint_id: &str) -> Result<bool> {
        self.store.delete(&self.key(checkpoint_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ExecutionState, StateDocument};
    use crate::store::MemoryStateStore;
    use std::collections::HashMap;

    fn document() -> StateDocument {
        let mut state = ExecutionState::new("wf", vec!["a".to_string()]);
        state.completed_stages.push("a".into());
        StateDocument::new(state, Vec::new(), HashMap::new(), Vec::new())
    }

    #[test]
    fn test_create_restore_round_trip() {
        let manager = CheckpointManager::new(Arc::new(MemoryStateStore::new()), "wf");
        let checkpoint = manager.create(Some("mid"), document()).unwrap();

        let restored = manager.restore(&checkpoint.id).unwrap();
        assert_eq!(restored.name, "mid");
        assert_eq!(restored.document.state, document().state);
    }

    #[test]
    fn test_list_and_delete() {
        let manager = CheckpointManager::new(Arc::new(MemoryStateStore::new()), "wf");
        let c1 = manager.create(Some("one"), document()).unwrap();
        let _c2 = manager.create(Some("two"), document()).unwrap();

        assert_eq!(manager.list().unwrap().len(), 2);
        assert!(manager.delete(&c1.id).unwrap());
        assert_eq!(manager.list().unwrap().len(), 1);
        assert!(manager.get(&c1.id).unwrap().is_none());
    }

    #[test]
    fn test_restore_unknown_id_errors() {
        let manager = CheckpointManager::new(Arc::new(MemoryStateStore::new()), "wf");
        assert!(manager.restore("ckpt-missing").is_err());
    }

    #[test]
    fn test_checkpoints_are_scoped_per_workflow() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let m1 = CheckpointManager::new(Arc::clone(&store), "wf-1");
        let m2 = CheckpointManager::new(Arc::clone(&store), "wf-2");

        m1.create(Some("only mine"), document()).unwrap();
        assert_eq!(m1.list().unwrap().len(), 1);
        assert!(m2.list().unwrap().is_empty());
    }
}
