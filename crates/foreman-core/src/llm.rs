//! Optional LLM client interface.
//!
//! The transport is opaque to the engine: anything that can turn a prompt
//! into text (or a stream of tokens) plugs in here. Absence of a client
//! disables LLM-backed invokers and the LLM decomposition strategy; the
//! engine stays operational on the placeholder and MCP invokers.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Result;

/// Options recognized by LLM backends. Unknown knobs stay out of the core.
#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stream: bool,
    pub model: Option<String>,
}

/// A callable LLM transport.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt and return the full response text.
    async fn complete(&self, prompt: &str, options: &LlmOptions) -> Result<String>;

    /// Stream a response in chunks. The default implementation degrades to a
    /// single-chunk stream wrapping [`complete`](Self::complete).
    async fn stream(
        &self,
        prompt: &str,
        options: &LlmOptions,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let full = self.complete(prompt, options).await?;
        Ok(futures::stream::iter(vec![Ok(full)]).boxed())
    }
}
