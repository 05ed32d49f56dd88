//! Global CLI configuration
//!
//! Stored as JSON in ~/.ztmesh/config.json. Every field can be overridden per
//! invocation by a flag or environment variable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.ztmesh.dev";
const RELAY_PATH: &str = "/derp";

/// Persisted CLI settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZtmeshConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Relay endpoint, derived from `api_url` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default)]
    pub tls_insecure: bool,
}

impl ZtmeshConfig {
    /// Apply non-empty values from `other` on top of this config
    pub fn merge(mut self, other: ZtmeshConfig) -> Self {
        fn pick(current: &mut Option<String>, new: Option<String>) {
            if let Some(value) = new.filter(|v| !v.trim().is_empty()) {
                *current = Some(value);
            }
        }
        pick(&mut self.api_url, other.api_url);
        pick(&mut self.relay_url, other.relay_url);
        pick(&mut self.session_token, other.session_token);
        pick(&mut self.session_id, other.session_id);
        pick(&mut self.org_id, other.org_id);
        self.tls_insecure |= other.tls_insecure;
        self
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_API_URL)
    }

    /// Configured relay URL, or `wss://<api host>/derp`
    pub fn relay_url(&self) -> Result<Url> {
        match &self.relay_url {
            Some(relay) => Url::parse(relay).context(format!("Invalid relay URL: {}", relay)),
            None => derive_relay_url(self.api_url()),
        }
    }
}

/// Map an API base URL onto the relay endpoint on the same host
pub fn derive_relay_url(api_url: &str) -> Result<Url> {
    let api = Url::parse(api_url).context(format!("Invalid API URL: {}", api_url))?;
    let scheme = match api.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => anyhow::bail!("Unsupported API URL scheme: {}", other),
    };
    if api.host().is_none() {
        anyhow::bail!("API URL has no host: {}", api_url);
    }

    // Host and port carry over as parsed, so IPv6 literals keep their brackets
    let mut relay = api;
    relay
        .set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot derive a relay URL from {}", api_url))?;
    let _ = relay.set_username("");
    let _ = relay.set_password(None);
    relay.set_path(RELAY_PATH);
    relay.set_query(None);
    relay.set_fragment(None);
    Ok(relay)
}

/// Loads and saves [`ZtmeshConfig`]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for ~/.ztmesh/config.json
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: crate::ztmesh_dir()?.join("config.json"),
        })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ZtmeshConfig> {
        if !self.path.exists() {
            return Ok(ZtmeshConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;
        serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", self.path))
    }

    pub fn save(&self, config: &ZtmeshConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))
    }

    /// Merge `update` into the stored config and save it
    pub fn update(&self, update: ZtmeshConfig) -> Result<ZtmeshConfig> {
        let merged = self.load()?.merge(update);
        self.save(&merged)?;
        Ok(merged)
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("Failed to remove config file: {:?}", self.path)),
        }
    }
}
