/// Errors from a provider API call.
///
/// Only `NotFound` is permanent: the VM no longer exists and the caller
/// may drop its record. Everything else is treated as transient: logged
/// and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// 404-class response: the VM is gone.
    #[error("{provider}: VM {vmid} not found")]
    NotFound { provider: &'static str, vmid: String },

    /// Non-2xx status from the provider API.
    #[error("{provider} API HTTP error: status={status}, body={body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// 2xx response whose payload is missing a required field.
    #[error("{provider} API response missing {field}")]
    MalformedResponse {
        provider: &'static str,
        field: &'static str,
    },

    /// Underlying HTTP transport error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The requested provider kind is not registered.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Account configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
