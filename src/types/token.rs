//! Token Types
//!
//! Token responses, renewal outcomes and the access token handed to callers.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Token type used in the Authorization header.
pub const BEARER: &str = "Bearer";

/// Token response from a renewal endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expires in seconds.
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    pub expires_in: Option<u64>,
    /// Refresh token, present when the provider rotates it.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    BEARER.to_string()
}

// Some providers send `expires_in` as a string.
fn deserialize_expires_in<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(secs)) => Ok(Some(secs)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Result of a successful token exchange.
#[derive(Clone, Debug)]
pub struct RefreshedTokens {
    /// New access token.
    pub access_token: SecretString,
    /// Token type reported by the endpoint.
    pub token_type: String,
    /// Lifetime of the new access token.
    pub expires_in: Option<Duration>,
    /// Rotated refresh token; `None` means keep the current one.
    pub refresh_token: Option<SecretString>,
    /// Granted scopes, when the endpoint reports them.
    pub scopes: Option<Vec<String>>,
    /// Renewal strategy that produced the tokens.
    pub strategy: &'static str,
}

impl RefreshedTokens {
    /// Bearer tokens without a rotated refresh token.
    pub fn new(
        access_token: impl Into<String>,
        expires_in: Option<Duration>,
        strategy: &'static str,
    ) -> Self {
        Self {
            access_token: SecretString::new(access_token.into()),
            token_type: BEARER.to_string(),
            expires_in,
            refresh_token: None,
            scopes: None,
            strategy,
        }
    }

    /// Attach a rotated refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(SecretString::new(refresh_token.into()));
        self
    }

    /// Create from token response.
    pub fn from_response(response: TokenResponse, strategy: &'static str) -> Self {
        let scopes = response
            .scope
            .as_ref()
            .map(|s| s.split_whitespace().map(String::from).collect());

        Self {
            access_token: SecretString::new(response.access_token),
            token_type: response.token_type,
            expires_in: response.expires_in.map(Duration::from_secs),
            refresh_token: response
                .refresh_token
                .filter(|token| !token.is_empty())
                .map(SecretString::new),
            scopes,
            strategy,
        }
    }
}

/// Access token wrapper for safe handling.
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    /// Expiration time.
    pub expires_at: Option<DateTime<Utc>>,
    /// Associated scopes.
    pub scopes: Vec<String>,
}

impl AccessToken {
    /// Create new access token.
    pub fn new(value: SecretString, expires_at: Option<DateTime<Utc>>, scopes: Vec<String>) -> Self {
        Self {
            value,
            expires_at,
            scopes,
        }
    }

    /// Get token value (for Authorization header).
    pub fn secret(&self) -> &str {
        self.value.expose_secret()
    }

    /// Get time until expiration.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_at.and_then(|exp| (exp - Utc::now()).to_std().ok())
    }

    /// Format as Authorization header value.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", BEARER, self.value.expose_secret())
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{
            "access_token": "test-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "test-refresh",
            "scope": "files.read files.write"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.access_token, "test-token");
        assert_eq!(response.expires_in, Some(3600));
        assert_eq!(response.refresh_token, Some("test-refresh".to_string()));

        let tokens = RefreshedTokens::from_response(response, "direct_provider");
        assert_eq!(tokens.expires_in, Some(Duration::from_secs(3600)));
        assert_eq!(
            tokens.scopes,
            Some(vec!["files.read".to_string(), "files.write".to_string()])
        );
        assert!(tokens.refresh_token.is_some());
    }

    #[test]
    fn test_expires_in_as_string() {
        let json = r#"{"access_token": "t", "expires_in": "1800"}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.expires_in, Some(1800));
        assert_eq!(response.token_type, "Bearer");
    }

    #[test]
    fn test_empty_refresh_token_is_not_a_rotation() {
        let json = r#"{"access_token": "t", "refresh_token": ""}"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let tokens = RefreshedTokens::from_response(response, "primary");
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn test_access_token_redacts_debug() {
        let token = AccessToken::new(SecretString::new("abc123".to_string()), None, Vec::new());
        assert_eq!(token.authorization_header(), "Bearer abc123");
        assert!(!format!("{:?}", token).contains("abc123"));
    }
}
