//! Composite invoker.
//!
//! An ordered list of invokers. A skill with `metadata.invoker_type` routes
//! directly to that variant; otherwise the first invoker whose `supports`
//! accepts the skill wins.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::registry::Skill;

use super::SkillInvoker;

#[derive(Default)]
pub struct CompositeInvoker {
    invokers: Vec<Arc<dyn SkillInvoker>>,
}

impl CompositeInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an invoker; earlier registrations take precedence.
    pub fn push(mut self, invoker: Arc<dyn SkillInvoker>) -> Self {
        self.invokers.push(invoker);
        self
    }

    fn route(&self, skill: &Skill) -> Result<&Arc<dyn SkillInvoker>> {
        if let Some(wanted) = skill.metadata.invoker_type {
            return self
                .invokers
                .iter()
                .find(|i| i.kind() == Some(wanted))
                .ok_or_else(|| EngineError::Execution {
                    skill_id: skill.id.clone(),
                    detail: format!("no invoker of kind {wanted:?} registered"),
                });
        }
        self.invokers
            .iter()
            .find(|i| i.supports(skill))
            .ok_or_else(|| EngineError::Execution {
                skill_id: skill.id.clone(),
                detail: "no registered invoker supports this skill".to_string(),
            })
    }
}

#[async_trait]
impl SkillInvoker for CompositeInvoker {
    fn supports(&self, skill: &Skill) -> bool {
        self.invokers.iter().any(|i| i.supports(skill))
    }

    async fn invoke(&self, skill: &Skill, input: &Value, context: &Value) -> Result<Value> {
        let invoker = self.route(skill)?;
        debug!(skill = %skill.id, kind = ?invoker.kind(), "dispatching skill");
        invoker.invoke(skill, input, context).await
    }
}
