use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub containerd: ContainerdConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub servers: Vec<ManagedServerConfig>,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub node_id: String,
    /// Shared secret used to sign websocket tokens.
    pub secret: String,
    pub data_dir: PathBuf,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("node_id", &self.node_id)
            .field("secret", &"[REDACTED]")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub http_bind: String,
    pub websocket_bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:8080".to_string(),
            websocket_bind: "0.0.0.0:8443".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerdConfig {
    pub namespace: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            namespace: "catalyst".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_disk_check_interval")]
    pub disk_check_interval_secs: u64,
    #[serde(default = "default_state_poll_interval")]
    pub state_poll_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
            disk_check_interval_secs: default_disk_check_interval(),
            state_poll_interval_secs: default_state_poll_interval(),
        }
    }
}

fn default_stats_interval() -> u64 {
    5
}

fn default_disk_check_interval() -> u64 {
    150
}

fn default_state_poll_interval() -> u64 {
    2
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagedServerConfig {
    pub uuid: String,
    /// Container name, when it differs from the server uuid.
    pub container: Option<String>,
}

impl ManagedServerConfig {
    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.uuid)
    }
}

impl AgentConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        let defaults = ApiConfig::default();
        Ok(Self {
            server: ServerConfig {
                node_id: std::env::var("NODE_ID").unwrap_or_else(|_| "local".to_string()),
                secret: std::env::var("NODE_SECRET")
                    .map_err(|_| "NODE_SECRET not set".to_string())?,
                data_dir: PathBuf::from(
                    std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/catalyst".to_string()),
                ),
            },
            api: ApiConfig {
                http_bind: std::env::var("HTTP_BIND").unwrap_or(defaults.http_bind),
                websocket_bind: std::env::var("WEBSOCKET_BIND").unwrap_or(defaults.websocket_bind),
            },
            containerd: ContainerdConfig {
                namespace: std::env::var("CONTAINERD_NAMESPACE")
                    .unwrap_or_else(|_| "catalyst".to_string()),
            },
            stats: StatsConfig::default(),
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: "json".to_string(),
            },
            servers: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = AgentConfig::from_toml(
            r#"
            [server]
            node_id = "node-1"
            secret = "hunter2"
            data_dir = "/srv/catalyst"

            [logging]
            level = "debug"
            format = "text"

            [[servers]]
            uuid = "8d3f0c2e"

            [[servers]]
            uuid = "a1b2c3d4"
            container = "mc-lobby"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.node_id, "node-1");
        assert_eq!(config.api.websocket_bind, "0.0.0.0:8443");
        assert_eq!(config.stats.interval_secs, 5);
        assert_eq!(config.stats.disk_check_interval_secs, 150);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].container_name(), "8d3f0c2e");
        assert_eq!(config.servers[1].container_name(), "mc-lobby");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let server = ServerConfig {
            node_id: "node-1".to_string(),
            secret: "hunter2".to_string(),
            data_dir: PathBuf::from("/srv"),
        };
        let rendered = format!("{:?}", server);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_missing_server_section_fails() {
        let err = AgentConfig::from_toml("[logging]\nlevel = \"info\"\nformat = \"json\"\n");
        assert!(err.is_err());
    }
}
