//! Credential Error Types
//!
//! Error hierarchy for the credential cache and refresh coordinator.
//!
//! Errors are layered the way requests flow through the crate:
//!
//! - [`CredentialError`]: raised by transports and renewal strategies.
//! - [`RefreshError`]: the single classification produced by the refresh executor.
//! - [`AuthError`]: returned by the coordinator to its callers.
//! - [`AccessError`]: the shape exposed to adapters through the access facade.

use std::time::Duration;
use thiserror::Error;

/// Root error type for renewal-path operations.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Response error: {0}")]
    Response(#[from] ResponseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// How a renewal strategy should treat a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry the same strategy with backoff.
    Retryable,
    /// Give up on this strategy and move to the next one.
    Exhausted,
    /// Stop the chain; the credentials are no longer usable.
    Terminal,
}

impl CredentialError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CREDENTIALS_CONFIG",
            Self::Network(_) => "CREDENTIALS_NETWORK",
            Self::Provider(_) => "CREDENTIALS_PROVIDER",
            Self::Response(_) => "CREDENTIALS_RESPONSE",
            Self::Storage(_) => "CREDENTIALS_STORAGE",
        }
    }

    /// Classify the error for the renewal chain.
    pub fn classify(&self) -> FailureClass {
        match self {
            Self::Network(e) if e.is_retryable() => FailureClass::Retryable,
            Self::Network(_) => FailureClass::Exhausted,
            Self::Provider(e) if e.is_terminal() => FailureClass::Terminal,
            Self::Provider(e) if e.is_retryable() => FailureClass::Retryable,
            Self::Provider(_) => FailureClass::Exhausted,
            Self::Configuration(_) | Self::Response(_) | Self::Storage(_) => {
                FailureClass::Exhausted
            }
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.classify() == FailureClass::Retryable
    }

    /// Check if error requires re-authentication.
    pub fn needs_reauth(&self) -> bool {
        self.classify() == FailureClass::Terminal
    }

    /// Get retry-after duration if applicable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider(ProviderError::TemporarilyUnavailable { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

/// Configuration error.
#[derive(Error, Debug, Clone)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid endpoint URL: {url}")]
    InvalidEndpoint { url: String },
}

/// Network/transport error.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Connection refused: {message}")]
    ConnectionRefused { message: String },

    #[error("Connection reset: {message}")]
    ConnectionReset { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("TLS error: {message}")]
    TlsError { message: String },
}

impl NetworkError {
    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::TlsError { .. })
    }
}

/// Provider (token endpoint) error.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Invalid client credentials")]
    InvalidClient { error_description: Option<String> },

    #[error("Invalid grant: {message}")]
    InvalidGrant { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Invalid scope: {scope}")]
    InvalidScope { scope: String },

    #[error("Unauthorized client for this grant type")]
    UnauthorizedClient { error_description: Option<String> },

    #[error("Unsupported grant type: {grant_type}")]
    UnsupportedGrantType { grant_type: String },

    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Server temporarily unavailable")]
    TemporarilyUnavailable { retry_after: Option<Duration> },
}

impl ProviderError {
    /// OAuth protocol rejections that no amount of retrying will fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidClient { .. }
                | Self::InvalidGrant { .. }
                | Self::InvalidScope { .. }
                | Self::UnauthorizedClient { .. }
                | Self::UnsupportedGrantType { .. }
        )
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError { .. } | Self::TemporarilyUnavailable { .. }
        )
    }
}

/// Malformed or unexpected renewal response.
#[derive(Error, Debug, Clone)]
pub enum ResponseError {
    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Unexpected HTTP status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Unexpected redirect to: {location}")]
    UnexpectedRedirect { location: String },

    #[error("Response too large: {size} bytes")]
    TooLarge { size: usize },
}

/// Durable store error.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Read failed: {message}")]
    ReadFailed { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("No token record for instance {instance_id}")]
    RecordNotFound { instance_id: String },

    #[error("Token record already exists for instance {instance_id}")]
    RecordExists { instance_id: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

/// Classification returned by the refresh executor.
///
/// The coordinator acts on this value and never re-interprets the
/// underlying network or protocol error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Re-authentication required: {reason}")]
    RequiresReauth {
        strategy: Option<String>,
        reason: String,
    },

    #[error("Transient refresh failure: {reason}")]
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
}

impl RefreshError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RequiresReauth { .. })
    }
}

/// Error returned by the refresh coordinator.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("Instance {instance_id} requires re-authentication: {reason}")]
    ReauthRequired { instance_id: String, reason: String },

    #[error("Instance {instance_id} exceeded {attempts} refresh attempts")]
    AttemptCeilingExceeded { instance_id: String, attempts: u32 },

    #[error("Instance {instance_id} has not completed authorization")]
    AuthorizationPending { instance_id: String },

    #[error("Token refresh for {instance_id} failed (attempt {attempts}): {reason}")]
    TransientFailure {
        instance_id: String,
        attempts: u32,
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("Durable store error for {instance_id}: {source}")]
    DurableStore {
        instance_id: String,
        #[source]
        source: StorageError,
    },
}

impl AuthError {
    /// Get error code for telemetry.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::ReauthRequired { .. } => "REAUTH_REQUIRED",
            Self::AttemptCeilingExceeded { .. } => "ATTEMPT_CEILING_EXCEEDED",
            Self::AuthorizationPending { .. } => "AUTHORIZATION_PENDING",
            Self::TransientFailure { .. } => "TRANSIENT_FAILURE",
            Self::DurableStore { .. } => "DURABLE_STORE",
        }
    }

    /// Instance the error refers to.
    pub fn instance_id(&self) -> &str {
        match self {
            Self::InstanceNotFound { instance_id }
            | Self::ReauthRequired { instance_id, .. }
            | Self::AttemptCeilingExceeded { instance_id, .. }
            | Self::AuthorizationPending { instance_id }
            | Self::TransientFailure { instance_id, .. }
            | Self::DurableStore { instance_id, .. } => instance_id,
        }
    }

    /// The end user has to go through authorization again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReauthRequired { .. }
                | Self::AttemptCeilingExceeded { .. }
                | Self::AuthorizationPending { .. }
        )
    }

    /// The caller may retry later without user interaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure { .. } | Self::DurableStore { .. })
    }

    /// Get retry-after duration if applicable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientFailure { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Error shape handed to adapters by the access facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Re-authentication required for {instance_id}: {reason}")]
    ReauthRequired { instance_id: String, reason: String },

    #[error("Credentials for {instance_id} temporarily unavailable: {message}")]
    Retryable {
        instance_id: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Unknown instance: {instance_id}")]
    NotFound { instance_id: String },
}

impl AccessError {
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::ReauthRequired { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

impl From<AuthError> for AccessError {
    fn from(error: AuthError) -> Self {
        let instance_id = error.instance_id().to_string();
        match error {
            AuthError::InstanceNotFound { .. } => Self::NotFound { instance_id },
            AuthError::ReauthRequired { reason, .. } => Self::ReauthRequired {
                instance_id,
                reason,
            },
            AuthError::AttemptCeilingExceeded { attempts, .. } => Self::ReauthRequired {
                instance_id,
                reason: format!("token refresh failed {} times", attempts),
            },
            AuthError::AuthorizationPending { .. } => Self::ReauthRequired {
                instance_id,
                reason: "authorization has not been completed".to_string(),
            },
            AuthError::TransientFailure {
                reason,
                retry_after,
                ..
            } => Self::Retryable {
                instance_id,
                message: reason,
                retry_after,
            },
            AuthError::DurableStore { source, .. } => Self::Retryable {
                instance_id,
                message: source.to_string(),
                retry_after: None,
            },
        }
    }
}

/// Result type for renewal-path operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

/// OAuth2 error response from a token endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuth2ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error_uri: Option<String>,
}

/// Map token error response to error type.
pub fn map_token_error(response: &OAuth2ErrorResponse, status: u16) -> ProviderError {
    let description = |fallback: &str| {
        response
            .error_description
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    };

    match response.error.as_str() {
        "invalid_client" => ProviderError::InvalidClient {
            error_description: response.error_description.clone(),
        },
        "invalid_grant" => ProviderError::InvalidGrant {
            message: description("Invalid grant"),
        },
        "invalid_request" => ProviderError::InvalidRequest {
            message: description("Invalid request"),
        },
        "invalid_scope" => ProviderError::InvalidScope {
            scope: response.error_description.clone().unwrap_or_default(),
        },
        "unauthorized_client" => ProviderError::UnauthorizedClient {
            error_description: response.error_description.clone(),
        },
        "unsupported_grant_type" => ProviderError::UnsupportedGrantType {
            grant_type: response.error_description.clone().unwrap_or_default(),
        },
        "server_error" => ProviderError::ServerError {
            status,
            message: description("Server error"),
        },
        "temporarily_unavailable" => ProviderError::TemporarilyUnavailable { retry_after: None },
        _ => ProviderError::InvalidRequest {
            message: description(&response.error),
        },
    }
}

/// Parse error response from HTTP body.
pub fn parse_error_response(body: &str) -> Option<OAuth2ErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Create error from a non-success HTTP response.
///
/// 5xx and 429 are always transient, even when the body carries an OAuth
/// error code; a gateway in front of the token endpoint may echo one back.
pub fn create_error_from_response(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> CredentialError {
    match status {
        429 => {
            return CredentialError::Provider(ProviderError::TemporarilyUnavailable {
                retry_after: retry_after.or(Some(Duration::from_secs(60))),
            })
        }
        500..=599 => {
            let message = parse_error_response(body)
                .and_then(|r| r.error_description.or(Some(r.error)))
                .unwrap_or_else(|| format!("HTTP {}", status));
            return CredentialError::Provider(ProviderError::ServerError { status, message });
        }
        _ => {}
    }

    if let Some(response) = parse_error_response(body) {
        return CredentialError::Provider(map_token_error(&response, status));
    }

    match status {
        401 => CredentialError::Provider(ProviderError::InvalidClient {
            error_description: Some("Unauthorized".to_string()),
        }),
        _ => CredentialError::Response(ResponseError::UnexpectedStatus { status }),
    }
}

/// Get user-friendly error message.
pub fn get_user_message(error: &AccessError) -> String {
    match error {
        AccessError::ReauthRequired { .. } => {
            "This connection needs to be re-authorized. Please reconnect the account.".to_string()
        }
        AccessError::Retryable { .. } => {
            "The service is temporarily unavailable. Please try again shortly.".to_string()
        }
        AccessError::NotFound { .. } => {
            "This connection no longer exists. Please set it up again.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_terminal() {
        let error = CredentialError::Provider(ProviderError::InvalidGrant {
            message: "revoked".to_string(),
        });
        assert_eq!(error.classify(), FailureClass::Terminal);
        assert!(error.needs_reauth());

        let error = CredentialError::Provider(ProviderError::InvalidClient {
            error_description: None,
        });
        assert_eq!(error.classify(), FailureClass::Terminal);
    }

    #[test]
    fn test_network_errors_are_retryable() {
        let error = CredentialError::Network(NetworkError::Timeout {
            timeout: Duration::from_secs(30),
        });
        assert!(error.is_retryable());

        let error = CredentialError::Network(NetworkError::ConnectionReset {
            message: "reset by peer".to_string(),
        });
        assert!(error.is_retryable());

        let error = CredentialError::Network(NetworkError::TlsError {
            message: "bad certificate".to_string(),
        });
        assert_eq!(error.classify(), FailureClass::Exhausted);
    }

    #[test]
    fn test_server_errors_are_retryable_even_with_oauth_body() {
        let body = r#"{"error":"invalid_grant"}"#;
        let error = create_error_from_response(502, body, None);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let error = create_error_from_response(429, "", Some(Duration::from_secs(7)));
        assert!(error.is_retryable());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_oauth_body_is_mapped() {
        let body = r#"{"error":"invalid_grant","error_description":"Token has been revoked"}"#;
        let error = create_error_from_response(400, body, None);
        match error {
            CredentialError::Provider(ProviderError::InvalidGrant { message }) => {
                assert_eq!(message, "Token has been revoked");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_status_without_body_is_exhausted() {
        let error = create_error_from_response(404, "not found", None);
        assert_eq!(error.classify(), FailureClass::Exhausted);
    }

    #[test]
    fn test_auth_error_translation() {
        let error = AuthError::AttemptCeilingExceeded {
            instance_id: "inst-1".to_string(),
            attempts: 5,
        };
        assert!(error.is_terminal());
        let access: AccessError = error.into();
        assert!(access.requires_reauth());

        let error = AuthError::DurableStore {
            instance_id: "inst-1".to_string(),
            source: StorageError::Unavailable {
                message: "pool exhausted".to_string(),
            },
        };
        assert!(error.is_retryable());
        let access: AccessError = error.into();
        assert!(access.is_retryable());

        let access: AccessError = AuthError::InstanceNotFound {
            instance_id: "gone".to_string(),
        }
        .into();
        assert_eq!(
            access,
            AccessError::NotFound {
                instance_id: "gone".to_string()
            }
        );
    }
}
