//! Error types for the Murmur domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each bounded context
//! has its own error enum; module errors are additionally the values the
//! orchestrator folds back into the transcript.

use thiserror::Error;

/// The top-level error type for all Murmur operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of capability-module dispatch and execution.
///
/// Display strings double as the model-visible error text, so they are
/// phrased for the model, not for a log file.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    #[error("Module '{name}' is not available. Available modules: {available}")]
    UnknownModule { name: String, available: String },

    #[error("Module '{0}' not imported.")]
    NotImported(String),

    #[error("Function '{function}' not found in module '{module}'.")]
    FunctionNotFound { module: String, function: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Module '{module}' function '{function}' failed: {reason}")]
    ExecutionFailed {
        module: String,
        function: String,
        reason: String,
    },

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Activation timed out: {0}")]
    ActivationTimeout(String),
}

/// Failures talking to the completion API.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures delivering events to the connected client.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}
