//! Optional MCP (Model Context Protocol) client interface.
//!
//! Skills carrying an `mcp` metadata block are dispatched through this
//! client. Transport errors pass through as execution errors.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// An injected MCP transport.
#[async_trait]
pub trait McpClient: Send + Sync {
    /// List the resources a server exposes.
    async fn list_resources(&self, server: &str) -> Result<Value>;

    /// Fetch one resource by URI.
    async fn fetch_resource(&self, server: &str, uri: &str) -> Result<Value>;

    /// Call a tool on a server with JSON arguments.
    async fn call_tool(&self, server: &str, tool: &str, args: &Value) -> Result<Value>;
}
