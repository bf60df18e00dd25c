//! MCP-backed invoker.
//!
//! Skills carrying `metadata.mcp` map onto an MCP request against the
//! injected client: list resources, fetch a resource, or call a tool.
//! Transport errors surface as execution errors.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::mcp::McpClient;
use crate::registry::{InvokerKind, McpAction, Skill};

use super::SkillInvoker;

pub struct McpInvoker {
    client: Arc<dyn McpClient>,
}

impl McpInvoker {
    pub fn new(client: Arc<dyn McpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SkillInvoker for McpInvoker {
    fn kind(&self) -> Option<InvokerKind> {
        Some(InvokerKind::Mcp)
    }

    fn supports(&self, skill: &Skill) -> bool {
        skill.metadata.mcp.is_some()
    }

    async fn invoke(&self, skill: &Skill, input: &Value, _context: &Value) -> Result<Value> {
        let config = skill
            .metadata
            .mcp
            .as_ref()
            .ok_or_else(|| EngineError::Execution {
                skill_id: skill.id.clone(),
                detail: "skill has no mcp configuration".to_string(),
            })?;

        let into_execution = |e: EngineError| EngineError::Execution {
            skill_id: skill.id.clone(),
            detail: e.to_string(),
        };

        match config.action {
            McpAction::ListResources => self
                .client
                .list_resources(&config.server)
                .await
                .map_err(into_execution),
            McpAction::FetchResource => {
                let uri = config
                    .resource_uri
                    .as_deref()
                    .ok_or_else(|| EngineError::Execution {
                        skill_id: skill.id.clone(),
                        detail: "resource_uri required for fetch_resource".to_string(),
                    })?;
                self.client
                    .fetch_resource(&config.server, uri)
                    .await
                    .map_err(into_execution)
            }
            McpAction::CallTool => {
                let tool = config.tool.as_deref().ok_or_else(|| EngineError::Execution {
                    skill_id: skill.id.clone(),
                    detail: "tool required for call_tool".to_string(),
                })?;
                self.client
                    .call_tool(&config.server, tool, input)
                    .await
                    .map_err(into_execution)
            }
        }
    }
}
