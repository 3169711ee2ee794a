//! Provider gateway contract for the relay runtime.
//!
//! The runtime never speaks a backend wire protocol directly. It builds a
//! [`Request`], hands it to the [`Client`], and the client routes it to the
//! [`ProviderAdapter`] registered under the requested provider id. Adapter
//! failures come back as [`ProviderError`]s whose [`ProviderOutcome`]
//! drives failover in the agent crate.

pub mod client;
pub mod errors;
pub mod provider;
pub mod types;

pub use client::Client;
pub use errors::{ProviderError, ProviderOutcome};
pub use provider::ProviderAdapter;
pub use types::*;
