//! Everything a command handler needs, resolved once in `main`

use anyhow::{Context, Result};
use std::sync::Arc;
use url::Url;
use ztmesh_api::{ApiClient, ApiConfig};
use ztmesh_client::TunnelContext;
use ztmesh_transport::WebSocketConnector;

use crate::config::ZtmeshConfig;
use crate::device::DeviceIdentity;

pub struct CommandContext {
    pub config: ZtmeshConfig,
    pub device: DeviceIdentity,
}

impl CommandContext {
    pub fn new(config: ZtmeshConfig, device: DeviceIdentity) -> Self {
        Self { config, device }
    }

    pub fn session_token(&self) -> Result<&str> {
        self.config
            .session_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .context("No session token configured. Run `ztmesh config set --token <TOKEN>` or set ZTMESH_TOKEN")
    }

    pub fn api_client(&self) -> Result<ApiClient> {
        let config = ApiConfig::new(self.config.api_url(), self.session_token()?)
            .with_session_id(self.config.session_id.clone())
            .with_org_id(self.config.org_id.clone())
            .with_insecure(self.config.tls_insecure);

        ApiClient::new(config).context("Failed to create API client")
    }

    pub fn relay_url(&self) -> Result<Url> {
        self.config.relay_url()
    }

    pub fn tunnel_context(&self) -> Result<TunnelContext> {
        Ok(TunnelContext::new(
            self.api_client()?,
            Arc::new(WebSocketConnector::default()),
            self.relay_url()?,
            self.device.device_id.clone(),
            self.device.hostname.clone(),
        )
        .with_insecure(self.config.tls_insecure))
    }
}
