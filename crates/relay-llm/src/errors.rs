//! Provider error taxonomy and outcome classification.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

/// Failure reported by a provider adapter.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("billing failure: {0}")]
    Billing(String),
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("provider not registered: {0}")]
    NotRegistered(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn billing(message: impl Into<String>) -> Self {
        Self::Billing(message.into())
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Classification fed to the provider runtime state machine.
    pub fn outcome(&self) -> ProviderOutcome {
        match self {
            Self::Authentication(_) => ProviderOutcome::AuthError,
            Self::Billing(_) => ProviderOutcome::BillingError,
            Self::RateLimited { .. } => ProviderOutcome::RateLimited,
            Self::Transient(_) | Self::NotRegistered(_) | Self::InvalidRequest(_) => {
                ProviderOutcome::TransientError
            }
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOutcome {
    Ok,
    AuthError,
    BillingError,
    RateLimited,
    TransientError,
}

impl ProviderOutcome {
    /// Auth and billing failures take a provider out of rotation until an
    /// operator clears it. Everything else is left to the caller's retry policy.
    pub fn disables_provider(&self) -> bool {
        matches!(self, Self::AuthError | Self::BillingError)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AuthError => "auth_error",
            Self::BillingError => "billing_error",
            Self::RateLimited => "rate_limited",
            Self::TransientError => "transient_error",
        }
    }
}

impl Display for ProviderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
