//! Error types for the gateway.
//!
//! Every failure the balancer can surface to a caller is a [`GatewayError`].
//! Each variant knows the HTTP status it maps to and the OpenAI-style error
//! `type` string used in JSON envelopes.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the gateway crates
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Unified gateway error
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or empty request
    #[error("Invalid request: {message}")]
    Validation {
        /// Human readable description
        message: String,
        /// Offending field, if known
        field: Option<String>,
    },

    /// Missing or unknown credential
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Reason
        message: String,
        /// Machine readable error type for JSON envelopes
        kind: &'static str,
    },

    /// A proxy request carried neither an API key nor a trace identity
    #[error("must have trace id or apikey")]
    MissingIdentity,

    /// The credential is valid but may not use this resource
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Reason
        message: String,
    },

    /// The requested model is not configured anywhere
    #[error("Model not found: {model}")]
    ModelNotFound {
        /// Requested model name
        model: String,
    },

    /// The model exists but has no providers
    #[error("no provider found for {model}, contact admin")]
    NoProvider {
        /// Requested model name
        model: String,
    },

    /// A caller exhausted its traffic quota
    #[error("Traffic limit exceeded for key {key}")]
    TrafficLimitExceeded {
        /// Masked key
        key: String,
    },

    /// Building a client for a provider failed
    #[error("Failed to construct client for provider {provider}: {message}")]
    ClientConstruction {
        /// Provider description
        provider: String,
        /// Underlying error
        message: String,
    },

    /// An upstream call failed
    #[error("Provider {provider} error: {message}")]
    Provider {
        /// Provider description
        provider: String,
        /// Error message
        message: String,
        /// Upstream HTTP status, if any
        status_code: Option<u16>,
        /// Whether another provider/key may succeed
        retryable: bool,
    },

    /// An upstream call did not finish in time
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout {
        /// Provider description
        provider: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Every candidate in a pool failed
    #[error("all providers failed for {target}, last error: {last_error}")]
    ProvidersExhausted {
        /// Model name or pool description
        target: String,
        /// Number of attempts made
        attempts: usize,
        /// Message of the final failure
        last_error: String,
    },

    /// No upstream resource is available at all (empty key pool)
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Reason
        message: String,
    },

    /// A rate-limit wait exceeded its deadline
    #[error("Rate limit wait timed out for {identity} after {waited:?}")]
    RateLimitTimeout {
        /// Identity that was throttled
        identity: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Requested address
        address: String,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Connection level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field,
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            kind: "authentication_error",
        }
    }

    /// Create an authentication error with a specific envelope type
    pub fn authentication_kind(message: impl Into<String>, kind: &'static str) -> Self {
        Self::Authentication {
            message: message.into(),
            kind,
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a model not found error
    pub fn model_not_found(model: impl Into<String>) -> Self {
        Self::ModelNotFound {
            model: model.into(),
        }
    }

    /// Create a no provider error
    pub fn no_provider(model: impl Into<String>) -> Self {
        Self::NoProvider {
            model: model.into(),
        }
    }

    /// Create a client construction error
    pub fn client_construction(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClientConstruction {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a provider error
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Create a timeout error
    pub fn timeout(provider: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            provider: provider.into(),
            timeout,
        }
    }

    /// Create a pool exhaustion error
    pub fn exhausted(
        target: impl Into<String>,
        attempts: usize,
        last_error: impl Into<String>,
    ) -> Self {
        Self::ProvidersExhausted {
            target: target.into(),
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code surfaced to callers
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authentication { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::ModelNotFound { .. } | Self::NoProvider { .. } => 404,
            Self::TrafficLimitExceeded { .. } => 429,
            Self::ProvidersExhausted { .. } | Self::Provider { .. } | Self::MissingIdentity => 502,
            Self::Unavailable { .. } => 503,
            Self::Timeout { .. } | Self::RateLimitTimeout { .. } => 504,
            Self::ClientConstruction { .. }
            | Self::Storage(_)
            | Self::Configuration(_)
            | Self::Bind { .. }
            | Self::Io(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Error `type` string for JSON error envelopes
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation { .. } | Self::ModelNotFound { .. } | Self::NoProvider { .. } => {
                "invalid_request_error"
            }
            Self::Authentication { kind, .. } => kind,
            Self::MissingIdentity => "authentication_error",
            Self::Forbidden { .. } => "permission_error",
            Self::TrafficLimitExceeded { .. } => "traffic_limit_exceeded",
            Self::ProvidersExhausted { .. } | Self::Provider { .. } | Self::Timeout { .. } => {
                "upstream_error"
            }
            Self::Unavailable { .. } => "service_unavailable",
            Self::RateLimitTimeout { .. } => "rate_limit_timeout",
            _ => "internal_error",
        }
    }

    /// Whether a failover loop should move on to the next candidate
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::ClientConstruction { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error originates from caller input rather than upstream
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::validation("empty", None).status_code(), 400);
        assert_eq!(GatewayError::authentication("bad key").status_code(), 401);
        assert_eq!(GatewayError::forbidden("nope").status_code(), 403);
        assert_eq!(GatewayError::model_not_found("ghost").status_code(), 404);
        assert_eq!(GatewayError::no_provider("gpt").status_code(), 404);
        assert_eq!(
            GatewayError::TrafficLimitExceeded { key: "k".into() }.status_code(),
            429
        );
        assert_eq!(
            GatewayError::client_construction("p", "boom").status_code(),
            500
        );
        assert_eq!(GatewayError::exhausted("gpt", 2, "eof").status_code(), 502);
        assert_eq!(GatewayError::unavailable("no keys").status_code(), 503);
        assert_eq!(GatewayError::MissingIdentity.status_code(), 502);
        assert_eq!(GatewayError::MissingIdentity.error_type(), "authentication_error");
        assert_eq!(
            GatewayError::RateLimitTimeout {
                identity: "t".into(),
                waited: Duration::from_secs(30)
            }
            .status_code(),
            504
        );
    }

    #[test]
    fn test_retryable() {
        assert!(GatewayError::provider("p", "503", Some(503), true).is_retryable());
        assert!(!GatewayError::provider("p", "400", Some(400), false).is_retryable());
        assert!(GatewayError::client_construction("p", "bad url").is_retryable());
        assert!(!GatewayError::authentication("x").is_retryable());
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            GatewayError::authentication_kind("missing", "totp_auth_required").error_type(),
            "totp_auth_required"
        );
        assert_eq!(
            GatewayError::exhausted("pool", 3, "x").error_type(),
            "upstream_error"
        );
        assert!(GatewayError::forbidden("x").is_client_error());
        assert!(!GatewayError::internal("x").is_client_error());
    }

    #[test]
    fn test_exhausted_message() {
        let err = GatewayError::exhausted("gpt-4o", 2, "connection refused");
        assert_eq!(
            err.to_string(),
            "all providers failed for gpt-4o, last error: connection refused"
        );
    }
}
