//! Skill invocation dispatch.
//!
//! Invokers are the only layer that actually runs a skill. Every invocation
//! goes through [`invoke_checked`]: validate input against the skill's
//! schema, execute under the declared timeout and the workflow cancel
//! signal, then validate the output. The orchestrator records the resulting
//! execution on the tracker.

mod composite;
mod llm;
mod mcp;
mod placeholder;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::{EngineError, Result};
use crate::registry::{InvokerKind, Skill};
use crate::schema;

pub use composite::CompositeInvoker;
pub use llm::LlmInvoker;
pub use mcp::McpInvoker;
pub use placeholder::PlaceholderInvoker;

/// A concrete skill execution backend.
#[async_trait]
pub trait SkillInvoker: Send + Sync {
    /// Which variant this is, for direct routing via `metadata.invoker_type`.
    /// Composite dispatchers return `None`.
    fn kind(&self) -> Option<InvokerKind> {
        None
    }

    /// Whether this invoker can handle the skill.
    fn supports(&self, skill: &Skill) -> bool;

    /// Run the skill. Input has already been validated; output is validated
    /// by the caller.
    async fn invoke(&self, skill: &Skill, input: &Value, context: &Value) -> Result<Value>;
}

/// Validate → execute (with timeout and cancellation) → validate.
///
/// Idempotence is the skill's own declaration: invokers may be called
/// repeatedly for the same input, and `side_effects` says whether that is
/// safe. Duplicate-call avoidance lives in the orchestrator via input
/// digests.
pub async fn invoke_checked(
    invoker: &dyn SkillInvoker,
    skill: &Skill,
    input: &Value,
    context: &Value,
    cancel: &CancelToken,
) -> Result<Value> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    if let Some(input_schema) = &skill.input_schema {
        schema::conforms(input, input_schema).map_err(|detail| EngineError::Validation {
            skill_id: skill.id.clone(),
            detail: format!("input: {detail}"),
        })?;
    }

    let fut = invoker.invoke(skill, input, context);
    let output = match skill.metadata.timeout_ms {
        Some(timeout_ms) => tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), fut) => {
                match outcome {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(EngineError::Timeout {
                            skill_id: skill.id.clone(),
                            timeout_ms,
                        })
                    }
                }
            }
        },
        None => tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = fut => result?,
        },
    };

    if let Some(output_schema) = &skill.output_schema {
        schema::conforms(&output, output_schema).map_err(|detail| EngineError::Validation {
            skill_id: skill.id.clone(),
            detail: format!("output: {detail}"),
        })?;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowInvoker;

    #[async_trait]
    impl SkillInvoker for SlowInvoker {
        fn supports(&self, _skill: &Skill) -> bool {
            true
        }

        async fn invoke(&self, _skill: &Skill, _input: &Value, _context: &Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let mut skill = Skill::new("slow", "Slow");
        skill.metadata.timeout_ms = Some(20);

        let err = invoke_checked(
            &SlowInvoker,
            &skill,
            &json!({}),
            &json!({}),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_invocation() {
        let skill = Skill::new("slow", "Slow");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = invoke_checked(&SlowInvoker, &skill, &json!({}), &json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_input_schema_enforced() {
        let mut skill = Skill::new("typed", "Typed");
        skill.input_schema = Some(json!({
            "type": "object",
            "required": ["task"]
        }));

        let err = invoke_checked(
            &PlaceholderInvoker::new(),
            &skill,
            &json!({}),
            &json!({}),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_output_schema_enforced() {
        struct Empty;

        #[async_trait]
        impl SkillInvoker for Empty {
            fn supports(&self, _skill: &Skill) -> bool {
                true
            }

            async fn invoke(
                &self,
                _skill: &Skill,
                _input: &Value,
                _context: &Value,
            ) -> Result<Value> {
                Ok(json!({}))
            }
        }

        let mut skill = Skill::new("typed", "Typed");
        skill.output_schema = Some(json!({
            "type": "object",
            "required": ["result"]
        }));

        let err = invoke_checked(&Empty, &skill, &json!({}), &json!({}), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
