//! Signaling configuration: relay endpoint, rendezvous servers, stream defaults.

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::helpers::{env_bool, env_string, split_list};

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_STREAM_NAME: &str = "default";

pub const RELAY_URL_ENV: &str = "CINECAST_RELAY_URL";
pub const ICE_SERVERS_ENV: &str = "CINECAST_ICE_SERVERS";
pub const ENVIRONMENT_ENV: &str = "CINECAST_ENVIRONMENT";
pub const ALLOW_INSECURE_ENV: &str = "CINECAST_ALLOW_INSECURE_SIGNALING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay that forwards session descriptions.
    pub relay_url: String,
    /// STUN/TURN URLs handed to the media engine.
    pub ice_servers: Vec<String>,
    /// Stream name used when the caller does not supply one.
    pub default_stream_name: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            default_stream_name: DEFAULT_STREAM_NAME.to_string(),
        }
    }
}

impl SignalingConfig {
    /// Defaults overlaid with `CINECAST_RELAY_URL` and `CINECAST_ICE_SERVERS`.
    pub fn from_env() -> Result<Self> {
        let relay_url = env_string(RELAY_URL_ENV)?;
        let ice_servers = env_string(ICE_SERVERS_ENV)?;
        let config = Self::default().with_overrides(relay_url, ice_servers.as_deref());
        debug!(
            "Signaling config: relay={} ice_servers={:?}",
            config.relay_url, config.ice_servers
        );
        Ok(config)
    }

    fn with_overrides(mut self, relay_url: Option<String>, ice_servers: Option<&str>) -> Self {
        if let Some(url) = relay_url {
            self.relay_url = url;
        }
        if let Some(list) = ice_servers {
            let servers = split_list(list);
            if !servers.is_empty() {
                self.ice_servers = servers;
            }
        }
        self
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
        self
    }

    /// Resolves a caller-supplied stream name, falling back to the configured default.
    pub fn stream_name_or_default(&self, name: Option<&str>) -> String {
        match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.default_stream_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let production = std::env::var(ENVIRONMENT_ENV)
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);
        let allow_insecure = env_bool(ALLOW_INSECURE_ENV, false);
        self.validate_with(production, allow_insecure)
    }

    fn validate_with(&self, production: bool, allow_insecure: bool) -> Result<()> {
        let url = Url::parse(self.relay_url.trim())
            .map_err(|e| Error::config(format!("invalid relay URL {:?}: {e}", self.relay_url)))?;

        match url.scheme() {
            "wss" => {}
            "ws" if production && !allow_insecure => {
                return Err(Error::config(format!(
                    "refusing insecure ws:// relay URL in production; \
                     use wss:// or set {ALLOW_INSECURE_ENV}=1"
                )));
            }
            "ws" => {}
            other => {
                return Err(Error::config(format!(
                    "relay URL must use ws:// or wss://, got {other}://"
                )));
            }
        }

        if self.ice_servers.is_empty() {
            return Err(Error::config("at least one ICE server is required"));
        }
        if self.ice_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::config("ICE server URLs must not be blank"));
        }
        if self.default_stream_name.trim().is_empty() {
            return Err(Error::config("default stream name must not be blank"));
        }

        Ok(())
    }
}
