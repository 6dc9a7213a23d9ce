use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Health store error: {0}")]
    HealthStore(String),

    #[error("Pricing error: {0}")]
    Pricing(String),

    #[error("Provider error: {message}")]
    Provider { message: String, status: Option<u16> },

    #[error("Provider call timed out after {0}ms")]
    Timeout(u64),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Logging setup error: {0}")]
    Logging(String),
}

impl Error {
    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    pub fn health_store(msg: impl Into<String>) -> Self {
        Error::HealthStore(msg.into())
    }

    pub fn pricing(msg: impl Into<String>) -> Self {
        Error::Pricing(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider { message: msg.into(), status: None }
    }

    /// Non-2xx answer from an upstream provider.
    pub fn upstream_status(status: u16, msg: impl Into<String>) -> Self {
        Error::Provider { message: msg.into(), status: Some(status) }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Caller-visible terminal error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnsupportedModelOrEndpoint,
    PricingNotConfigured,
    UpstreamError,
    ClientClosedRequest,
}

impl ErrorCode {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::UnsupportedModelOrEndpoint => 400,
            ErrorCode::PricingNotConfigured => 502,
            ErrorCode::UpstreamError => 502,
            ErrorCode::ClientClosedRequest => 499,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedModelOrEndpoint => "unsupported_model_or_endpoint",
            ErrorCode::PricingNotConfigured => "pricing_not_configured",
            ErrorCode::UpstreamError => "upstream_error",
            ErrorCode::ClientClosedRequest => "client_closed_request",
        }
    }

    fn default_description(&self) -> &'static str {
        match self {
            ErrorCode::UnsupportedModelOrEndpoint => "No provider serves the requested model on this endpoint",
            ErrorCode::PricingNotConfigured => "No provider has pricing configured for the requested model",
            ErrorCode::UpstreamError => "Every candidate provider failed to serve the request",
            ErrorCode::ClientClosedRequest => "The caller closed the request before it completed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a gateway request, serialized as the JSON error payload.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{error}: {description}")]
pub struct GatewayError {
    pub error: ErrorCode,
    pub description: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, request_id: impl Into<String>) -> Self {
        Self {
            error: code,
            description: code.default_description().to_string(),
            request_id: request_id.into(),
            model: None,
            endpoint: None,
            reason: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.error.status_code()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "error": self.error.as_str(), "request_id": self.request_id })
        })
    }
}
