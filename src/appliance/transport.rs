//! Appliance Transport
//!
//! The seam between the session client and the wire. [`HttpTransport`]
//! talks to a real appliance over HTTPS; the simulator implements the same
//! trait in memory.

use crate::config::ApplianceConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// API prefix on the appliance
pub const API_PREFIX: &str = "/api/v2.0/";

// =============================================================================
// Request/Response Types
// =============================================================================

/// HTTP method of an appliance request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// A request against the appliance API, relative to [`API_PREFIX`]
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path relative to the API prefix, with identifiers already encoded
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Raw response from the appliance
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authorization presented with a request
#[derive(Clone, PartialEq, Eq)]
pub enum Authorization {
    /// API key
    Bearer(String),
    /// Username and password
    Basic { username: String, password: String },
    /// Session token issued by `auth/generate_token`
    Token(String),
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authorization::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Authorization::Basic { username, .. } => write!(f, "Basic({}, <redacted>)", username),
            Authorization::Token(_) => write!(f, "Token(<redacted>)"),
        }
    }
}

// =============================================================================
// Transport Port
// =============================================================================

/// Sends requests to the appliance.
///
/// Implementations report connection failures and timeouts as
/// [`Error::TransientNetwork`]; every HTTP response, whatever its status, is
/// returned as an [`ApiResponse`].
#[async_trait]
pub trait ApplianceTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest, auth: &Authorization) -> Result<ApiResponse>;
}

pub type ApplianceTransportRef = Arc<dyn ApplianceTransport>;

// =============================================================================
// HTTP Transport
// =============================================================================

/// reqwest-based transport with connection reuse
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    /// Create a transport for the configured appliance
    pub fn new(config: &ApplianceConfig) -> Result<Self> {
        let base_url = api_base_url(&config.url)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// Base URL all request paths are joined onto
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl ApplianceTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest, auth: &Authorization) -> Result<ApiResponse> {
        let url = self.base_url.join(&request.path).map_err(|e| {
            Error::Internal(format!("invalid request path {:?}: {}", request.path, e))
        })?;

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder = match auth {
            Authorization::Bearer(key) => builder.bearer_auth(key),
            Authorization::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Authorization::Token(token) => builder.header(AUTHORIZATION, format!("Token {}", token)),
        };

        debug!("{} {}", request.method, request.path);

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(ApiResponse { status, body })
    }
}

/// Resolve the API base URL from the configured appliance URL
pub fn api_base_url(url: &str) -> Result<Url> {
    let url = Url::parse(url)
        .map_err(|e| Error::Configuration(format!("invalid appliance url {:?}: {}", url, e)))?;
    url.join(API_PREFIX)
        .map_err(|e| Error::Configuration(format!("invalid appliance url: {}", e)))
}

fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_builder() {
        Error::Internal(format!("failed to build request: {}", err))
    } else {
        Error::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_base_url() {
        let url = api_base_url("https://nas.example.com").unwrap();
        assert_eq!(url.as_str(), "https://nas.example.com/api/v2.0/");

        let url = api_base_url("https://nas.example.com:8443/ignored/path").unwrap();
        assert_eq!(url.as_str(), "https://nas.example.com:8443/api/v2.0/");
    }

    #[test]
    fn test_encoded_paths_survive_join() {
        let base = api_base_url("https://nas.example.com").unwrap();
        let url = base.join("pool/dataset/id/tank%2Fcinder%2Fvolume-a").unwrap();
        assert_eq!(
            url.as_str(),
            "https://nas.example.com/api/v2.0/pool/dataset/id/tank%2Fcinder%2Fvolume-a"
        );
    }

    #[test]
    fn test_authorization_debug_is_redacted() {
        let auth = Authorization::Token("secret-token".into());
        assert!(!format!("{:?}", auth).contains("secret"));
    }

    #[test]
    fn test_http_transport_rejects_bad_url() {
        let config = ApplianceConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        assert!(HttpTransport::new(&config).is_err());
    }
}
