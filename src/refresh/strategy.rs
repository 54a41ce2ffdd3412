//! Renewal Strategies
//!
//! Each strategy is one way of exchanging an instance's credentials for a
//! fresh access token. The executor tries them in order.

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{
    create_error_from_response, map_token_error, ConfigurationError, CredentialError,
    OAuth2ErrorResponse, ResponseError,
};
use crate::types::{
    ClientAuthMethod, ClientCredentials, CredentialEntry, GrantType, RefreshedTokens,
    RenewalServiceConfig, TokenResponse,
};

/// Name reported by [`PrimaryRenewalStrategy`].
pub const PRIMARY_STRATEGY: &str = "primary";
/// Name reported by [`DirectProviderStrategy`].
pub const DIRECT_PROVIDER_STRATEGY: &str = "direct_provider";

/// Everything a strategy may need to renew one instance.
#[derive(Clone, Debug)]
pub struct RefreshRequest {
    pub instance_id: String,
    pub owner_id: String,
    pub provider: String,
    pub refresh_token: Option<SecretString>,
    pub client: Option<ClientCredentials>,
    pub scopes: Vec<String>,
}

impl From<&CredentialEntry> for RefreshRequest {
    fn from(entry: &CredentialEntry) -> Self {
        Self {
            instance_id: entry.instance_id.clone(),
            owner_id: entry.owner_id.clone(),
            provider: entry.provider.clone(),
            refresh_token: entry.refresh_token.clone(),
            client: entry.client.clone(),
            scopes: entry.scopes.clone(),
        }
    }
}

/// One renewal path.
#[async_trait]
pub trait RenewalStrategy: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Whether this strategy can run for the request at all.
    fn applies_to(&self, request: &RefreshRequest) -> bool;

    /// Perform a single exchange. Retries are the executor's job.
    async fn exchange(&self, request: &RefreshRequest) -> Result<RefreshedTokens, CredentialError>;
}

/// Turn an HTTP response from either renewal endpoint into tokens.
///
/// Non-2xx responses go through the shared error mapping. A 2xx body that
/// carries an OAuth `error` instead of a token is mapped the same way.
pub fn parse_token_response(
    response: &HttpResponse,
    strategy: &'static str,
) -> Result<RefreshedTokens, CredentialError> {
    if !response.is_success() {
        return Err(create_error_from_response(
            response.status,
            &response.body,
            response.retry_after(),
        ));
    }

    let value: serde_json::Value = serde_json::from_str(&response.body).map_err(|e| {
        CredentialError::Response(ResponseError::InvalidJson {
            message: e.to_string(),
        })
    })?;

    let has_token = value
        .get("access_token")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);

    if !has_token {
        if let Ok(error) = serde_json::from_value::<OAuth2ErrorResponse>(value) {
            return Err(CredentialError::Provider(map_token_error(
                &error,
                response.status,
            )));
        }
        return Err(CredentialError::Response(ResponseError::MissingField {
            field: "access_token".to_string(),
        }));
    }

    let token_response: TokenResponse = serde_json::from_value(value).map_err(|e| {
        CredentialError::Response(ResponseError::InvalidJson {
            message: e.to_string(),
        })
    })?;

    Ok(RefreshedTokens::from_response(token_response, strategy))
}

/// Internal token-exchange service that holds the refresh tokens itself.
pub struct PrimaryRenewalStrategy<T: HttpTransport> {
    config: RenewalServiceConfig,
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: HttpTransport> PrimaryRenewalStrategy<T> {
    pub fn new(config: RenewalServiceConfig, transport: Arc<T>, timeout: Duration) -> Self {
        Self {
            config,
            transport,
            timeout,
        }
    }

    fn build_request(&self, request: &RefreshRequest) -> HttpRequest {
        let body = serde_json::json!({
            "instance_id": request.instance_id,
            "owner_id": request.owner_id,
            "provider": request.provider,
            "grant_type": GrantType::RefreshToken.as_str(),
        });

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("accept".to_string(), "application/json".to_string());
        if let Some(key) = &self.config.service_key {
            headers.insert(
                "authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            );
        }

        HttpRequest {
            method: HttpMethod::Post,
            url: self.config.endpoint.clone(),
            headers,
            body: Some(body.to_string()),
            timeout: Some(self.timeout),
        }
    }
}

#[async_trait]
impl<T: HttpTransport + 'static> RenewalStrategy for PrimaryRenewalStrategy<T> {
    fn name(&self) -> &'static str {
        PRIMARY_STRATEGY
    }

    fn applies_to(&self, _request: &RefreshRequest) -> bool {
        true
    }

    async fn exchange(&self, request: &RefreshRequest) -> Result<RefreshedTokens, CredentialError> {
        let response = self.transport.send(self.build_request(request)).await?;
        parse_token_response(&response, PRIMARY_STRATEGY)
    }
}

/// Standard `refresh_token` grant against the provider's token endpoint.
pub struct DirectProviderStrategy<T: HttpTransport> {
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: HttpTransport> DirectProviderStrategy<T> {
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    fn build_request_body(
        client: &ClientCredentials,
        refresh_token: &SecretString,
    ) -> Result<String, CredentialError> {
        let mut params = vec![
            ("grant_type", GrantType::RefreshToken.as_str()),
            ("refresh_token", refresh_token.expose_secret().as_str()),
        ];

        match client.auth_method {
            ClientAuthMethod::ClientSecretPost => {
                params.push(("client_id", client.client_id.as_str()));
                if let Some(secret) = &client.client_secret {
                    params.push(("client_secret", secret.expose_secret().as_str()));
                }
            }
            ClientAuthMethod::None => params.push(("client_id", client.client_id.as_str())),
            ClientAuthMethod::ClientSecretBasic => {}
        }

        serde_urlencoded::to_string(&params).map_err(|e| {
            CredentialError::Configuration(ConfigurationError::InvalidConfig {
                message: format!("failed to encode refresh request: {}", e),
            })
        })
    }

    fn build_request_headers(client: &ClientCredentials) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert("accept".to_string(), "application/json".to_string());

        if client.auth_method == ClientAuthMethod::ClientSecretBasic {
            if let Some(secret) = &client.client_secret {
                let credentials = format!("{}:{}", client.client_id, secret.expose_secret());
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                headers.insert("authorization".to_string(), format!("Basic {}", encoded));
            }
        }

        headers
    }
}

#[async_trait]
impl<T: HttpTransport + 'static> RenewalStrategy for DirectProviderStrategy<T> {
    fn name(&self) -> &'static str {
        DIRECT_PROVIDER_STRATEGY
    }

    fn applies_to(&self, request: &RefreshRequest) -> bool {
        request.client.is_some() && request.refresh_token.is_some()
    }

    async fn exchange(&self, request: &RefreshRequest) -> Result<RefreshedTokens, CredentialError> {
        let (client, refresh_token) = match (&request.client, &request.refresh_token) {
            (Some(client), Some(token)) => (client, token),
            (None, _) => {
                return Err(CredentialError::Configuration(
                    ConfigurationError::MissingRequired {
                        field: "client".to_string(),
                    },
                ))
            }
            (_, None) => {
                return Err(CredentialError::Configuration(
                    ConfigurationError::MissingRequired {
                        field: "refresh_token".to_string(),
                    },
                ))
            }
        };

        let http_request = HttpRequest {
            method: HttpMethod::Post,
            url: client.token_endpoint.clone(),
            headers: Self::build_request_headers(client),
            body: Some(Self::build_request_body(client, refresh_token)?),
            timeout: Some(self.timeout),
        };

        let response = self.transport.send(http_request).await?;
        parse_token_response(&response, DIRECT_PROVIDER_STRATEGY)
    }
}
