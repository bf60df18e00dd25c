//! Role definitions.
//!
//! A role names a set of required skills plus the actions an agent bound to
//! it may and may not take. Role composition (`extends`) is flattened at load
//! time; there is no runtime inheritance chain.

use serde::{Deserialize, Serialize};

use crate::registry::skill::SkillRequirement;

/// Allowed and forbidden actions for a role. The two sets must be disjoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleConstraints {
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub forbidden_actions: Vec<String>,
}

/// A role definition loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,

    /// Roles whose required skills this role absorbs. Resolved during
    /// registry load; the stored `required_skills` is the expanded union.
    #[serde(default)]
    pub extends: Vec<String>,

    #[serde(default)]
    pub required_skills: Vec<SkillRequirement>,

    #[serde(default)]
    pub constraints: RoleConstraints,

    /// Opaque validation rule identifiers, passed through to callers.
    #[serde(default)]
    pub validation_rules: Vec<String>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: name.into(),
            description: String::new(),
            extends: Vec::new(),
            required_skills: Vec::new(),
            constraints: RoleConstraints::default(),
            validation_rules: Vec::new(),
            id,
        }
    }

    /// Whether an action is permitted under this role's constraints.
    /// Forbidden wins over allowed; an empty allowed list permits anything
    /// not forbidden.
    pub fn permits(&self, action: &str) -> bool {
        if self
            .constraints
            .forbidden_actions
            .iter()
            .any(|a| a == action)
        {
            return false;
        }
        self.constraints.allowed_actions.is_empty()
            || self.constraints.allowed_actions.iter().any(|a| a == action)
    }
}
