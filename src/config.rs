use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{Error, Result};

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay_url: String,
    pub room: Option<String>,
    pub display_name: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub reconnect: ReconnectConfig,
    pub join_timeout_ms: u64,
    /// How many times a peer session may be torn down and rebuilt after a
    /// failed negotiation step, structural mismatches included, before
    /// negotiation is abandoned.
    pub max_structural_recoveries: u32,
    pub recovery_delay_ms: u64,
    /// How long an offer may go unanswered before it is rolled back and sent
    /// again.
    pub answer_timeout_ms: u64,
    pub max_answer_timeouts: u32,
    pub media: MediaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            room: None,
            display_name: format!("user-{}", rand::random::<u32>()),
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                username: None,
                credential: None,
            }],
            reconnect: ReconnectConfig::default(),
            join_timeout_ms: 5_000,
            max_structural_recoveries: 2,
            recovery_delay_ms: 250,
            answer_timeout_ms: 10_000,
            max_answer_timeouts: 2,
            media: MediaConfig::default(),
        }
    }
}

impl Config {
    /// Reads the TOML file at `path` if given, then applies `MESHCALL_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MESHCALL_RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(room) = lookup("MESHCALL_ROOM") {
            self.room = Some(room);
        }
        if let Some(name) = lookup("MESHCALL_DISPLAY_NAME") {
            self.display_name = name;
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            relay_url = "wss://relay.example.org/ws"
            display_name = "clinic-2"

            [reconnect]
            max_attempts = 9

            [[ice_servers]]
            urls = ["turn:turn.example.org:3478"]
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay_url, "wss://relay.example.org/ws");
        assert_eq!(config.reconnect.max_attempts, 9);
        assert_eq!(config.reconnect.initial_backoff_ms, 1_000);
        assert_eq!(config.max_structural_recoveries, 2);
        assert_eq!(config.answer_timeout(), Duration::from_secs(10));
        assert!(config.media.audio && config.media.video);

        let servers = config.rtc_ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "u");
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "MESHCALL_RELAY_URL" => Some("ws://10.0.0.2:9000".to_string()),
            "MESHCALL_ROOM" => Some("consult-42".to_string()),
            _ => None,
        });
        assert_eq!(config.relay_url, "ws://10.0.0.2:9000");
        assert_eq!(config.room.as_deref(), Some("consult-42"));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        assert!(matches!(Config::from_toml("relay_url = ["), Err(Error::Config(_))));
    }
}
