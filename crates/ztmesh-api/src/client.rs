//! Bearer-authenticated REST client

use crate::models::{
    CreateTunnelRequest, ErrorBody, ListResponse, MeshNode, PingNodeRequest, RegisterNodeRequest,
    RelayToken, TunnelRecord,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// API client errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}

/// Connection settings for the backend
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://api.example.com`
    pub base_url: String,
    pub session_token: String,
    pub session_id: Option<String>,
    pub org_id: Option<String>,
    pub timeout: Duration,
    /// Accept invalid TLS certificates
    pub insecure: bool,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_token: session_token.into(),
            session_id: None,
            org_id: None,
            timeout: Duration::from_secs(30),
            insecure: false,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_org_id(mut self, org_id: Option<String>) -> Self {
        self.org_id = org_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// REST client for tunnel records, relay tokens and the mesh registry
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(ApiError::InvalidUrl(format!(
                "{}: expected http:// or https://",
                config.base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .user_agent(concat!("ztmesh/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, base, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `POST /tunnels`
    pub async fn create_tunnel(&self, req: &CreateTunnelRequest) -> Result<TunnelRecord, ApiError> {
        let response = self
            .request(Method::POST, "tunnels")?
            .json(req)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// `GET /tunnels[?device_id=]`
    pub async fn list_tunnels(&self, device_id: Option<&str>) -> Result<Vec<TunnelRecord>, ApiError> {
        let mut builder = self.request(Method::GET, "tunnels")?;
        if let Some(device_id) = device_id {
            builder = builder.query(&[("device_id", device_id)]);
        }
        let list: ListResponse<TunnelRecord> = Self::decode(builder.send().await?).await?;
        Ok(list.into_vec())
    }

    /// `DELETE /tunnels/{id}`
    pub async fn delete_tunnel(&self, id: i64) -> Result<(), ApiError> {
        let response = self
            .request(Method::DELETE, &format!("tunnels/{}", id))?
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    /// `GET /auth/derp-tunnel-token?device_id=`
    pub async fn relay_token(&self, device_id: &str) -> Result<RelayToken, ApiError> {
        let response = self
            .request(Method::GET, "auth/derp-tunnel-token")?
            .query(&[("device_id", device_id)])
            .send()
            .await?;
        Self::decode(response).await
    }

    /// `POST /mesh/nodes/register`
    pub async fn register_mesh_node(&self, req: &RegisterNodeRequest) -> Result<(), ApiError> {
        let response = self
            .request(Method::POST, "mesh/nodes/register")?
            .json(req)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    /// `GET /mesh/nodes`
    pub async fn list_mesh_nodes(&self) -> Result<Vec<MeshNode>, ApiError> {
        let response = self.request(Method::GET, "mesh/nodes")?.send().await?;
        let list: ListResponse<MeshNode> = Self::decode(response).await?;
        Ok(list.into_vec())
    }

    /// `POST /mesh/nodes/ping`
    pub async fn ping_mesh_node(&self, device_id: &str) -> Result<(), ApiError> {
        let response = self
            .request(Method::POST, "mesh/nodes/ping")?
            .json(&PingNodeRequest {
                device_id: device_id.to_string(),
            })
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self.endpoint(path)?;
        debug!("{} {}", method, url);

        let mut builder = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.session_token);
        if let Some(session_id) = &self.config.session_id {
            builder = builder.header("X-Session-ID", session_id);
        }
        if let Some(org_id) = &self.config.org_id {
            builder = builder.header("X-Org-ID", org_id);
        }
        Ok(builder)
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| {
                if body.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("unknown error")
                        .to_string()
                } else {
                    body
                }
            });

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            _ => ApiError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let response = Self::check(response).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
