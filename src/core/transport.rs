//! HTTP Transport
//!
//! HTTP client interface and implementations for renewal requests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::{ConfigurationError, CredentialError, NetworkError, ResponseError};

/// Maximum accepted response body.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// HTTP request definition.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Request URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub body: Option<String>,
    /// Request timeout.
    pub timeout: Option<Duration>,
}

/// HTTP method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// HTTP response definition.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers (lowercase names).
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// JSON response with the given status.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: [("content-type".to_string(), "application/json".to_string())]
                .into_iter()
                .collect(),
            body: body.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `Retry-After` header in seconds, if present.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// HTTP transport interface (for dependency injection).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send an HTTP request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CredentialError>;
}

/// Default reqwest-based HTTP transport.
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
    default_timeout: Duration,
    max_response_size: usize,
}

impl ReqwestHttpTransport {
    /// Create new transport with default settings.
    pub fn new() -> Result<Self, CredentialError> {
        Self::with_options(Duration::from_secs(30), DEFAULT_MAX_RESPONSE_SIZE)
    }

    /// Create transport with custom options.
    pub fn with_options(timeout: Duration, max_response_size: usize) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                CredentialError::Configuration(ConfigurationError::InvalidConfig {
                    message: format!("failed to build HTTP client: {}", e),
                })
            })?;

        Ok(Self {
            client,
            default_timeout: timeout,
            max_response_size,
        })
    }
}

/// Map a reqwest failure onto the network taxonomy.
fn classify_send_error(error: &reqwest::Error, timeout: Duration) -> NetworkError {
    if error.is_timeout() {
        return NetworkError::Timeout { timeout };
    }

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return NetworkError::ConnectionRefused {
                        message: error.to_string(),
                    }
                }
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    return NetworkError::ConnectionReset {
                        message: error.to_string(),
                    }
                }
                std::io::ErrorKind::TimedOut => return NetworkError::Timeout { timeout },
                _ => {}
            }
        }
        source = cause.source();
    }

    NetworkError::ConnectionFailed {
        message: error.to_string(),
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CredentialError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut req_builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (key, value) in &request.headers {
            req_builder = req_builder.header(key, value);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CredentialError::Network(classify_send_error(&e, timeout)))?;

        let status = response.status().as_u16();

        if (300..400).contains(&status) {
            let location = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(CredentialError::Response(ResponseError::UnexpectedRedirect {
                location,
            }));
        }

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.as_str().to_lowercase(), v.to_string());
            }
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_response_size {
                return Err(CredentialError::Response(ResponseError::TooLarge {
                    size: len as usize,
                }));
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| CredentialError::Network(classify_send_error(&e, timeout)))?;

        if body.len() > self.max_response_size {
            return Err(CredentialError::Response(ResponseError::TooLarge {
                size: body.len(),
            }));
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Mock HTTP transport for testing.
///
/// Replies are served in the order they were queued; once the queue is
/// empty the default reply (if any) is returned.
#[derive(Default)]
pub struct MockHttpTransport {
    replies: Mutex<VecDeque<Result<HttpResponse, NetworkError>>>,
    default_reply: Mutex<Option<HttpResponse>>,
    request_history: Mutex<Vec<HttpRequest>>,
}

impl MockHttpTransport {
    /// Create new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to return.
    pub fn queue_response(&self, response: HttpResponse) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response));
        self
    }

    /// Queue a JSON response.
    pub fn queue_json_response(&self, status: u16, body: serde_json::Value) -> &Self {
        self.queue_response(HttpResponse::json(status, &body))
    }

    /// Queue a network failure.
    pub fn queue_network_error(&self, error: NetworkError) -> &Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
        self
    }

    /// Set default response when queue is empty.
    pub fn set_default_response(&self, response: HttpResponse) -> &Self {
        *self
            .default_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(response);
        self
    }

    /// Get request history.
    pub fn get_requests(&self) -> Vec<HttpRequest> {
        self.request_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.request_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CredentialError> {
        self.request_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let queued = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match queued {
            Some(Ok(response)) => Ok(response),
            Some(Err(error)) => Err(CredentialError::Network(error)),
            None => self
                .default_reply
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or_else(|| {
                    CredentialError::Network(NetworkError::ConnectionRefused {
                        message: "No mock response available".to_string(),
                    })
                }),
        }
    }
}
