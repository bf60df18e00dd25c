//! LLM-backed invoker.
//!
//! Serializes the skill description, input and context into a prompt,
//! delegates to the injected [`LlmClient`], and parses the response against
//! the skill's output schema. Streaming responses forward each chunk to the
//! event sink as `skill.progress`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventEmitter};
use crate::llm::{LlmClient, LlmOptions};
use crate::registry::{InvokerKind, Skill};

use super::SkillInvoker;

pub struct LlmInvoker {
    client: Arc<dyn LlmClient>,
    options: LlmOptions,
    emitter: Option<EventEmitter>,
}

impl LlmInvoker {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            options: LlmOptions::default(),
            emitter: None,
        }
    }

    pub fn with_options(mut self, options: LlmOptions) -> Self {
        self.options = options;
        self
    }

    /// Wire the event emitter used for streaming progress chunks.
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn build_prompt(skill: &Skill, input: &Value, context: &Value) -> String {
        let mut parts = vec![
            format!("# Task: execute skill '{}'", skill.name),
            format!("\n## Description\n{}", skill.description),
        ];
        if !skill.dimensions.is_empty() {
            parts.push(format!("\n## Dimensions\n- {}", skill.dimensions.join("\n- ")));
        }
        if !skill.constraints.is_empty() {
            parts.push(format!("\n## Constraints\n- {}", skill.constraints.join("\n- ")));
        }
        parts.push(format!(
            "\n## Input\n```json\n{}\n```",
            serde_json::to_string_pretty(input).unwrap_or_default()
        ));
        if !context.is_null() {
            parts.push(format!(
                "\n## Context\n```json\n{}\n```",
                serde_json::to_string_pretty(context).unwrap_or_default()
            ));
        }
        if let Some(schema) = &skill.output_schema {
            parts.push(format!(
                "\n## Expected output format\n```json\n{}\n```",
                serde_json::to_string_pretty(schema).unwrap_or_default()
            ));
        }
        parts.push(
            "\n## Instructions\nExecute the task and respond with valid JSON matching the \
             expected output format."
                .to_string(),
        );
        parts.join("\n")
    }

    /// Pull a JSON object out of the raw response: fenced block first, then
    /// the whole body; plain text falls back to `{"text": ...}`.
    fn parse_response(response: &str) -> Value {
        let fenced = regex::Regex::new(r"```(?:json)?\s*([\s\S]*?)```")
            .ok()
            .and_then(|re| re.captures(response))
            .and_then(|caps| caps.get(1))
            .and_then(|m| serde_json::from_str::<Value>(m.as_str().trim()).ok());
        if let Some(value) = fenced {
            return value;
        }
        match serde_json::from_str::<Value>(response.trim()) {
            Ok(value) => value,
            Err(_) => json!({ "text": response }),
        }
    }
}

#[async_trait]
impl SkillInvoker for LlmInvoker {
    fn kind(&self) -> Option<InvokerKind> {
        Some(InvokerKind::Llm)
    }

    fn supports(&self, _skill: &Skill) -> bool {
        true
    }

    async fn invoke(&self, skill: &Skill, input: &Value, context: &Value) -> Result<Value> {
        let prompt = Self::build_prompt(skill, input, context);

        let response = if self.options.stream {
            let mut stream = self
                .client
                .stream(&prompt, &self.options)
                .await
                .map_err(|e| EngineError::Execution {
                    skill_id: skill.id.clone(),
                    detail: e.to_string(),
                })?;
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| EngineError::Execution {
                    skill_id: skill.id.clone(),
                    detail: e.to_string(),
                })?;
                if let Some(emitter) = &self.emitter {
                    emitter.emit(EngineEvent::SkillProgress {
                        skill_id: skill.id.clone(),
                        chunk: chunk.clone(),
                    });
                }
                buffer.push_str(&chunk);
            }
            buffer
        } else {
            self.client
                .complete(&prompt, &self.options)
                .await
                .map_err(|e| EngineError::Execution {
                    skill_id: skill.id.clone(),
                    detail: e.to_string(),
                })?
        };

        let parsed = Self::parse_response(&response);
        if parsed.get("text").is_some() && skill.output_schema.is_some() {
            warn!(skill = %skill.id, "LLM response was not structured JSON");
        }
        Ok(parsed)
    }
}
