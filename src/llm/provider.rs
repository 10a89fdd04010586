use async_trait::async_trait;

use crate::errors::SeeFlowResult;
use crate::llm::types::{GenerateRequest, GenerateResponse};

/// Unified model client trait. The agent loop only ever talks to models through this.
/// New providers only need to implement this trait and register in config.toml.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Returns the provider's identifier (matches config.toml key).
    fn name(&self) -> &str;

    /// Runs one completion and returns the concatenated text output.
    async fn generate_content(&self, request: GenerateRequest) -> SeeFlowResult<GenerateResponse>;
}

/// Runs `generate_content` under a deadline. Elapsed deadlines map to `SeeFlowError::Timeout`.
pub async fn generate_with_timeout(
    client: &dyn ModelClient,
    request: GenerateRequest,
    timeout: std::time::Duration,
) -> SeeFlowResult<GenerateResponse> {
    match tokio::time::timeout(timeout, client.generate_content(request)).await {
        Ok(result) => result,
        Err(_) => Err(crate::errors::SeeFlowError::Timeout(timeout.as_millis() as u64)),
    }
}
