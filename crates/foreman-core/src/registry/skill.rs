//! Skill, skill-requirement and skill-bundle definitions.
//!
//! Skills are capability units with typed input/output and a declared
//! invocation backend. They are immutable once loaded into the registry.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a skill is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkillType {
    /// Reasoning-heavy, typically LLM-backed.
    #[default]
    Cognitive,
    /// Mechanical, tool- or API-backed.
    Procedural,
    /// A mix of both.
    Hybrid,
}

/// Which invoker variant a skill routes to when set explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokerKind {
    Placeholder,
    Llm,
    Mcp,
}

/// MCP request a skill maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpAction {
    ListResources,
    FetchResource,
    CallTool,
}

/// MCP dispatch configuration carried in skill metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpConfig {
    pub action: McpAction,
    pub server: String,
    #[serde(default)]
    pub resource_uri: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
}

/// Invoker hints attached to a skill. Known keys are typed; everything else
/// is kept in `extra` for forward compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillMetadata {
    /// Declared execution mode (e.g. "implementation", "analysis"); matched
    /// against the stage's mode by the selector.
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// MCP dispatch configuration, when the skill is MCP-backed.
    #[serde(default)]
    pub mcp: Option<McpConfig>,

    /// Per-invocation timeout. No timeout when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Route directly to a specific invoker variant, bypassing `supports`.
    #[serde(default)]
    pub invoker_type: Option<InvokerKind>,

    /// Unknown metadata keys, passed through untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// A skill definition loaded from the skill library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,

    /// Tag-like dimensions used for task affinity matching.
    #[serde(default)]
    pub dimensions: Vec<String>,

    /// Proficiency levels keyed 1..=3.
    #[serde(default)]
    pub levels: BTreeMap<u8, String>,

    /// Opaque tool identifiers this skill touches.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Opaque policy tags.
    #[serde(default)]
    pub constraints: Vec<String>,

    /// Actions this skill performs when executed; checked against role
    /// `forbidden_actions` during selection.
    #[serde(default)]
    pub execution_capabilities: Vec<String>,

    /// JSON-Schema for the invocation input.
    #[serde(default)]
    pub input_schema: Option<Value>,

    /// JSON-Schema the invocation output must satisfy.
    #[serde(default)]
    pub output_schema: Option<Value>,

    #[serde(default)]
    pub metadata: SkillMetadata,

    #[serde(default)]
    pub skill_type: SkillType,

    /// Same input always yields the same output; enables digest-based reuse.
    #[serde(default)]
    pub deterministic: bool,

    #[serde(default)]
    pub testable: bool,

    /// Declared side effects; empty means repetition is safe.
    #[serde(default)]
    pub side_effects: Vec<String>,
}

impl Skill {
    /// Minimal skill for tests and placeholder wiring.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: name.into(),
            description: String::new(),
            dimensions: Vec::new(),
            levels: BTreeMap::new(),
            tools: Vec::new(),
            constraints: Vec::new(),
            execution_capabilities: Vec::new(),
            input_schema: None,
            output_schema: None,
            metadata: SkillMetadata::default(),
            skill_type: SkillType::default(),
            deterministic: false,
            testable: false,
            side_effects: Vec::new(),
            id,
        }
    }
}

/// A requirement on a role: a skill (or bundle, pre-expansion) at a minimum
/// proficiency level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRequirement {
    pub skill_id: String,
    #[serde(default = "default_min_level")]
    pub min_level: u8,
    #[serde(default)]
    pub focus: Vec<String>,
}

fn default_min_level() -> u8 {
    1
}

impl SkillRequirement {
    pub fn new(skill_id: impl Into<String>, min_level: u8) -> Self {
        Self {
            skill_id: skill_id.into(),
            min_level,
            focus: Vec::new(),
        }
    }
}

/// A named set of skill requirements assignable as a unit. Bundles may
/// reference other bundles; expansion is acyclic and happens at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillBundle {
    pub id: String,
    #[serde(default)]
    pub requirements: Vec<SkillRequirement>,
}
