//! Structured engine events.
//!
//! The engine emits a one-way stream of events consumed by progress
//! renderers and test probes. Sinks must be cheap and non-blocking; the
//! engine never waits on a consumer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::bus::MessageKind;
use crate::tracker::ExecutionStatus;

/// Environment variable that disables streaming progress-chunk emission.
pub const NO_STREAM_ENV: &str = "FOREMAN_NO_STREAM";

/// Something the engine did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "stage.started")]
    StageStarted { stage_id: String, role_id: String },
    #[serde(rename = "stage.completed")]
    StageCompleted { stage_id: String },
    #[serde(rename = "stage.blocked")]
    StageBlocked {
        stage_id: String,
        findings: Vec<String>,
    },
    #[serde(rename = "task.created")]
    TaskCreated { task_id: String, role_id: String },
    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: String, status: String },
    #[serde(rename = "skill.invoked")]
    SkillInvoked {
        skill_id: String,
        stage_id: Option<String>,
        task_id: Option<String>,
    },
    #[serde(rename = "skill.completed")]
    SkillCompleted {
        skill_id: String,
        status: ExecutionStatus,
        duration_ms: i64,
    },
    /// Streaming output chunk from an LLM-backed invocation.
    #[serde(rename = "skill.progress")]
    SkillProgress { skill_id: String, chunk: String },
    #[serde(rename = "checkpoint.created")]
    CheckpointCreated { checkpoint_id: String, name: String },
    #[serde(rename = "gate.failed")]
    GateFailed {
        stage_id: String,
        gate_id: String,
        message: String,
        blocking: bool,
    },
    #[serde(rename = "agent.message")]
    AgentMessage {
        from_agent: String,
        to: String,
        kind: MessageKind,
    },
}

/// An event plus its envelope.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// One-way consumer of engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &EventRecord);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _record: &EventRecord) {}
}

/// Buffers records in memory; the test probe sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<EventRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Event type tags in emission order, for assertions on ordering.
    pub fn event_types(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| {
                serde_json::to_value(r)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, record: &EventRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Stamps events with the envelope and forwards them to the sink.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    workflow_id: String,
    streaming_enabled: bool,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, workflow_id: impl Into<String>) -> Self {
        Self {
            sink,
            workflow_id: workflow_id.into(),
            streaming_enabled: std::env::var(NO_STREAM_ENV).is_err(),
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        if matches!(event, EngineEvent::SkillProgress { .. }) && !self.streaming_enabled {
            return;
        }
        debug!(workflow = %self.workflow_id, event = ?event, "engine event");
        let record = EventRecord {
            timestamp: Utc::now(),
            workflow_id: self.workflow_id.clone(),
            event,
        };
        self.sink.emit(&record);
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("workflow_id", &self.workflow_id)
            .field("streaming_enabled", &self.streaming_enabled)
            .finish()
    }
}
