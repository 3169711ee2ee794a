//! Provider adapter contract.

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::types::{Request, Response};

/// One AI backend. Implementations translate [`Request`] into their own wire
/// protocol and classify failures into [`ProviderError`] variants.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: Request) -> Result<Response, ProviderError>;
}
