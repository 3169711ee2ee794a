//! Request routing across registered provider adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ProviderError;
use crate::provider::ProviderAdapter;
use crate::types::{Request, Response};

#[derive(Clone, Default)]
pub struct Client {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    default_provider: Option<String>,
}

impl Client {
    pub fn new(
        providers: HashMap<String, Arc<dyn ProviderAdapter>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers,
            default_provider,
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn ProviderAdapter>) {
        let name = provider.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn set_default_provider(&mut self, provider: impl Into<String>) {
        self.default_provider = Some(provider.into());
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn complete(&self, mut request: Request) -> Result<Response, ProviderError> {
        let provider_name = self.resolve_provider(&request)?;
        request.provider = Some(provider_name.clone());
        let adapter = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| ProviderError::NotRegistered(provider_name.clone()))?
            .clone();
        adapter.complete(request).await
    }

    fn resolve_provider(&self, request: &Request) -> Result<String, ProviderError> {
        if let Some(provider) = &request.provider {
            return Ok(provider.clone());
        }
        if let Some(provider) = &self.default_provider {
            return Ok(provider.clone());
        }
        Err(ProviderError::InvalidRequest(
            "no provider configured".to_string(),
        ))
    }
}
