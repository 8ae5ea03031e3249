// Session configuration.
// Logging defaults to on in debug builds and off in release builds.

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            filter: "manual_call=debug,webrtc=warn".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// Needed for two peers inside one host without any other interface
    pub include_loopback_candidates: bool,
    pub gather_timeout_secs: u64,
    /// Remote candidates held back while the caller waits for the answer
    pub max_pending_candidates: usize,
    pub peer_label: String,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 10,
            include_loopback_candidates: false,
            gather_timeout_secs: 10,
            max_pending_candidates: 32,
            peer_label: "manual-peer".into(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(s).map_err(|e| CallError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for peers that live in the same process, no STUN.
    pub fn local_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback_candidates: true,
            ..Self::default()
        }
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::InvalidConfig(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn"
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.gather_timeout(), Duration::from_secs(10));
        assert_eq!(config.peer_label, "manual-peer");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = Config::from_json_str(r#"{"max_pending_candidates": 4}"#).unwrap();
        assert_eq!(config.max_pending_candidates, 4);
        assert_eq!(config.ice_candidate_pool_size, 10);
    }

    #[test]
    fn test_turn_requires_credentials() {
        let json = r#"{"ice_servers":[{"id":"t","type":"turn","url":"relay.example.org"}]}"#;
        assert!(matches!(
            Config::from_json_str(json),
            Err(CallError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rtc_servers_get_scheme() {
        let json = r#"{"ice_servers":[{"id":"t","type":"turn","url":"relay.example.org","username":"u","credential":"c"}]}"#;
        let servers = Config::from_json_str(json).unwrap().rtc_ice_servers();
        assert_eq!(servers[0].urls, vec!["turn:relay.example.org".to_string()]);
        assert_eq!(servers[0].username, "u");
    }
}
