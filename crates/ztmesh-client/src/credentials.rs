//! Relay credential selection
//!
//! A short-lived relay token bound to this device and organisation is
//! preferred. When the backend cannot issue one in time, the long-lived
//! session token is used instead. A relay token may come pinned to a relay
//! endpoint, which then replaces the configured one.

use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use ztmesh_api::ApiClient;

/// Default time allowed for the relay token request
pub const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Bearer credential presented to the relay
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    RelayToken(String),
    SessionToken(String),
}

impl Credential {
    pub fn token(&self) -> &str {
        match self {
            Credential::RelayToken(t) | Credential::SessionToken(t) => t,
        }
    }

    pub fn is_relay_token(&self) -> bool {
        matches!(self, Credential::RelayToken(_))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Credential::RelayToken(_) => "relay token",
            Credential::SessionToken(_) => "session token",
        }
    }
}

// Never print token material
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.describe())
    }
}

/// A credential and the relay endpoint the backend bound it to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAccess {
    pub credential: Credential,
    pub endpoint: Option<Url>,
}

pub struct CredentialSource<'a> {
    api: &'a ApiClient,
    timeout: Duration,
}

impl<'a> CredentialSource<'a> {
    pub fn new(api: &'a ApiClient) -> Self {
        Self {
            api,
            timeout: TOKEN_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the best available credential for `device_id`
    pub async fn acquire(&self, device_id: &str) -> Credential {
        self.acquire_access(device_id).await.credential
    }

    /// Like [`acquire`](Self::acquire), keeping any relay endpoint pinned to
    /// the token
    pub async fn acquire_access(&self, device_id: &str) -> RelayAccess {
        let credential = match tokio::time::timeout(self.timeout, self.api.relay_token(device_id))
            .await
        {
            Ok(Ok(token)) if !token.token.is_empty() => {
                info!("Using relay token for device {}", device_id);
                if let Some(expires_at) = token.expires_at {
                    debug!("Relay token expires at {}", expires_at);
                }
                let endpoint = token.relay_url.as_deref().and_then(|raw| match Url::parse(raw) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!("Ignoring invalid pinned relay URL {}: {}", raw, e);
                        None
                    }
                });
                return RelayAccess {
                    credential: Credential::RelayToken(token.token),
                    endpoint,
                };
            }
            Ok(Ok(_)) => {
                warn!("Backend returned an empty relay token, falling back to session token");
                self.fallback()
            }
            Ok(Err(e)) => {
                warn!(
                    "Failed to get relay token ({}), falling back to session token",
                    e
                );
                self.fallback()
            }
            Err(_) => {
                warn!(
                    "Relay token request timed out after {}s, falling back to session token",
                    self.timeout.as_secs()
                );
                self.fallback()
            }
        };

        RelayAccess {
            credential,
            endpoint: None,
        }
    }

    fn fallback(&self) -> Credential {
        Credential::SessionToken(self.api.config().session_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use ztmesh_api::ApiConfig;

    async fn token_backend(body: serde_json::Value) -> ApiClient {
        let app = Router::new().route(
            "/auth/derp-tunnel-token",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        ApiClient::new(ApiConfig::new(format!("http://{}", addr), "session-token")).unwrap()
    }

    #[tokio::test]
    async fn test_pinned_relay_endpoint() {
        let api = token_backend(serde_json::json!({
            "token": "relay-dev-a",
            "relay_url": "wss://relay-2.ztmesh.test/derp"
        }))
        .await;

        let access = CredentialSource::new(&api).acquire_access("dev-a").await;
        assert_eq!(
            access.credential,
            Credential::RelayToken("relay-dev-a".to_string())
        );
        assert_eq!(
            access.endpoint.map(|u| u.to_string()),
            Some("wss://relay-2.ztmesh.test/derp".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_pinned_endpoint_is_ignored() {
        let api = token_backend(serde_json::json!({
            "token": "relay-dev-a",
            "relay_url": "not a url"
        }))
        .await;

        let access = CredentialSource::new(&api).acquire_access("dev-a").await;
        assert!(access.credential.is_relay_token());
        assert!(access.endpoint.is_none());
    }

    #[test]
    fn test_debug_hides_token() {
        let credential = Credential::RelayToken("secret-value".to_string());
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("secret-value"));
        assert!(printed.contains("relay token"));
        assert_eq!(credential.token(), "secret-value");
    }

    #[tokio::test]
    async fn test_falls_back_when_backend_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let api = ApiClient::new(ApiConfig::new(
            format!("http://127.0.0.1:{}", port),
            "session-token",
        ))
        .unwrap();

        let credential = CredentialSource::new(&api)
            .with_timeout(Duration::from_secs(2))
            .acquire("dev-a")
            .await;

        assert_eq!(
            credential,
            Credential::SessionToken("session-token".to_string())
        );
        assert!(!credential.is_relay_token());
    }
}
