//! Completion backends for Murmur.

pub mod openai_compat;

use std::sync::Arc;

use murmur_config::AppConfig;
use murmur_core::provider::CompletionClient;

pub use openai_compat::OpenAiCompatClient;

/// Build the completion client described by the configuration.
pub fn build_from_config(config: &AppConfig) -> Arc<dyn CompletionClient> {
    let api_key = config.provider.api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("No API key configured — completion requests will be rejected");
    }
    Arc::new(OpenAiCompatClient::new(
        "groq",
        &config.provider.base_url,
        api_key,
        &config.provider.model,
    ))
}
