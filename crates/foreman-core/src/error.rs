//! Error types for the Foreman engine.
//!
//! All fallible engine operations return [`Result`]. The taxonomy is closed:
//! configuration problems are fatal at load time, skill-level failures are
//! recorded on the execution log and propagated to the workflow executor,
//! and gate failures block a stage without tearing the engine down.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or inconsistent registry input. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Skill input or output failed its declared schema.
    #[error("validation failed for skill '{skill_id}': {detail}")]
    Validation { skill_id: String, detail: String },

    /// Backend failure while executing a skill (LLM error, MCP failure,
    /// predicate exception).
    #[error("execution of skill '{skill_id}' failed: {detail}")]
    Execution { skill_id: String, detail: String },

    /// An invoker exceeded the skill's `timeout_ms`.
    #[error("skill '{skill_id}' timed out after {timeout_ms}ms")]
    Timeout { skill_id: String, timeout_ms: u64 },

    /// The agent could not produce any intents for its goal.
    #[error("agent '{agent_id}' could not produce intents: {reason}")]
    InsufficientContext { agent_id: String, reason: String },

    /// The selector found no candidate skill with a non-zero score.
    /// Recoverable: the agent may re-prompt with a broader description.
    #[error("no skill available for task: {task}")]
    NoSkillAvailable { task: String },

    /// Task decomposition produced a dependency cycle.
    #[error("cyclic task decomposition involving {0:?}")]
    CyclicDecomposition(Vec<String>),

    /// One or more blocking quality gates failed; the stage is blocked.
    #[error("stage '{stage_id}' blocked by quality gates: {findings:?}")]
    GateFailure {
        stage_id: String,
        findings: Vec<String>,
    },

    /// Workflow-level cancellation was signalled.
    #[error("workflow cancelled")]
    Cancelled,

    /// Invariant violation. Fatal and surfaced loudly.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization failure in state or checkpoint handling.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure in the state store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context attached.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<EngineError>,
    },
}

/// Errors raised while loading and validating the registry.
///
/// Validation is total: a partially valid configuration is rejected, so every
/// downstream component may assume all references resolve.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{kind} '{id}' referenced by '{referenced_by}' does not exist")]
    MissingRef {
        kind: &'static str,
        id: String,
        referenced_by: String,
    },

    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("skill bundle expansion cycle: {0:?}")]
    BundleCycle(Vec<String>),

    #[error("role extends cycle: {0:?}")]
    RoleCycle(Vec<String>),

    #[error("role '{role_id}' lists actions as both allowed and forbidden: {actions:?}")]
    ForbiddenAllowedOverlap {
        role_id: String,
        actions: Vec<String>,
    },

    #[error("skill level {level} out of range 1..=3 (in '{location}')")]
    LevelOutOfRange { level: u8, location: String },

    #[error("workflow stage dependency cycle: {0:?}")]
    WorkflowCycle(Vec<String>),

    #[error("gate '{gate_id}' references unregistered predicate '{predicate}'")]
    UnknownPredicate { gate_id: String, predicate: String },

    #[error("stage '{stage_id}' requires skill '{skill_id}' which role '{role_id}' does not authorize")]
    UnauthorizedStageSkill {
        stage_id: String,
        skill_id: String,
        role_id: String,
    },
}

/// Machine-readable label recorded on failed skill executions and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Execution,
    Timeout,
    InsufficientContext,
    NoSkillAvailable,
    GateFailure,
    Cancelled,
    Config,
    Internal,
}

impl From<&EngineError> for ErrorKind {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::Execution { .. } => ErrorKind::Execution,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::InsufficientContext { .. } => ErrorKind::InsufficientContext,
            EngineError::NoSkillAvailable { .. } => ErrorKind::NoSkillAvailable,
            EngineError::GateFailure { .. } => ErrorKind::GateFailure,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::WithContext { source, .. } => ErrorKind::from(source.as_ref()),
            _ => ErrorKind::Internal,
        }
    }
}

impl EngineError {
    /// Add context to an error.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Process exit code for an external CLI: 1 blocked by gate, 2 task
    /// failure, 3 configuration error, 4 cancelled, 5 internal error.
    /// A successful run is 0, reported by the caller.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::GateFailure { .. } => 1,
            EngineError::Validation { .. }
            | EngineError::Execution { .. }
            | EngineError::Timeout { .. }
            | EngineError::InsufficientContext { .. }
            | EngineError::NoSkillAvailable { .. }
            | EngineError::CyclicDecomposition(_) => 2,
            EngineError::Config(_) => 3,
            EngineError::Cancelled => 4,
            EngineError::WithContext { source, .. } => source.exit_code(),
            _ => 5,
        }
    }
}

/// Extension trait for adding context to results.
pub trait ResultExt<T> {
    /// Add context to a `Result`.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazily-built context to a `Result`.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = EngineError::from(ConfigError::DuplicateId {
            kind: "skill",
            id: "s1".into(),
        });
        let err = err.context("loading registry");
        assert!(err.to_string().contains("loading registry"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            EngineError::GateFailure {
                stage_id: "s".into(),
                findings: vec![]
            }
            .exit_code(),
            1
        );
        assert_eq!(
            EngineError::Timeout {
                skill_id: "s".into(),
                timeout_ms: 10
            }
            .exit_code(),
            2
        );
        assert_eq!(EngineError::Cancelled.exit_code(), 4);
        assert_eq!(EngineError::Internal("bad".into()).exit_code(), 5);
    }

    #[test]
    fn test_error_kind_follows_context() {
        let err = EngineError::Validation {
            skill_id: "s1".into(),
            detail: "missing field".into(),
        }
        .context("invoking");
        assert_eq!(ErrorKind::from(&err), ErrorKind::Validation);
    }
}
