//! Workflow, stage and quality-gate definitions.
//!
//! A workflow is an ordered list of stages forming a DAG over `depends_on`.
//! Stages declare an input/output artifact contract and quality gates that
//! are evaluated when the stage completes.

use serde::{Deserialize, Serialize};

use crate::registry::skill::SkillRequirement;

/// A named artifact a stage consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    /// Required outputs missing at completion always block the stage.
    #[serde(default)]
    pub required: bool,
}

impl ArtifactSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// The check a quality gate performs, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateKind {
    /// A named output exists and is non-empty.
    ArtifactExists { artifact: String },
    /// A named output's string form matches a pattern.
    RegexMatch { artifact: String, pattern: String },
    /// A numeric output (or an array's length) is at least `threshold`.
    CountThreshold { artifact: String, threshold: f64 },
    /// A predicate registered with the gate evaluator.
    CustomPredicate { predicate: String },
}

/// A quality gate declared on a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub id: String,
    #[serde(flatten)]
    pub kind: GateKind,
    /// Blocking gates that fail transition the stage to Blocked;
    /// non-blocking gates only produce warnings.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

impl QualityGate {
    pub fn new(id: impl Into<String>, kind: GateKind) -> Self {
        Self {
            id: id.into(),
            kind,
            blocking: true,
        }
    }

    pub fn warning_only(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// A node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,

    /// Role assigned to this stage. When absent the executor infers one from
    /// `required_skills`.
    #[serde(default)]
    pub role_id: Option<String>,

    #[serde(default)]
    pub required_skills: Vec<SkillRequirement>,

    /// Named artifacts this stage consumes from the shared context.
    #[serde(default)]
    pub inputs: Vec<ArtifactSpec>,

    /// Named artifacts this stage is expected to produce.
    #[serde(default)]
    pub outputs: Vec<ArtifactSpec>,

    /// Stage ids that must be completed before this stage starts.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,

    /// Whether this stage may run concurrently with other ready stages.
    #[serde(default)]
    pub parallelizable: bool,

    /// Declared mode (e.g. "implementation", "analysis"), matched against
    /// skill metadata during selection.
    #[serde(default)]
    pub execution_mode: Option<String>,
}

impl Stage {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: name.into(),
            role_id: None,
            required_skills: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends_on: Vec::new(),
            quality_gates: Vec::new(),
            parallelizable: false,
            execution_mode: None,
            id,
        }
    }
}

/// A workflow definition: a DAG of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<Stage>,
}

impl Workflow {
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Stages with no dependencies (the DAG sources).
    pub fn source_stages(&self) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .collect()
    }

    /// Stages no other stage depends on (the DAG terminals).
    pub fn terminal_stages(&self) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|s| !self.stages.iter().any(|o| o.depends_on.contains(&s.id)))
            .collect()
    }
}
