//! Configuration management for mesh nodes

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use self::file::MeshConfigFile;
use crate::{Error, Result};

/// Server section that carries the transport endpoint and call timeout
pub const TRANSPORT_SERVER: &str = "transport_server";

const DEFAULT_COORDINATION_HOST: &str = "localhost";
const DEFAULT_COORDINATION_PORT: u16 = 2181;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MESSAGE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 3;

/// Mesh node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordination service connection
    pub coordination: CoordinationConfig,

    /// This instance's identity
    pub identity: IdentityConfig,

    /// Server sections mirrored from `/system/<name>`
    pub servers: Vec<String>,

    /// Local snapshot file
    pub snapshot_path: PathBuf,

    /// RPC behaviour
    pub rpc: RpcConfig,

    /// Delay before reconnecting a dropped transport
    pub reconnect_delay: Duration,
}

/// Coordination service connection
///
/// `host` and `port` address a networked [`crate::coordination::CoordinationClient`];
/// the in-process store ignores them and they are only logged at startup.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub host: String,
    pub port: u16,
    /// How long `ensure_connected` waits for a session
    pub connect_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_COORDINATION_HOST.to_string(),
            port: DEFAULT_COORDINATION_PORT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl CoordinationConfig {
    /// `host:port` connect string
    #[must_use]
    pub fn connect_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// This instance's identity in the mesh
#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    /// Service name registered under `/system/services`
    pub service: String,
    /// Device uuid; generated on first start when absent
    pub uuid: Option<String>,
    /// Device token; generated on first start when absent
    pub token: Option<String>,
    /// Extra metadata leaves, serialized as JSON
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// RPC behaviour
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Call timeout used when the snapshot has no `message_timeout`
    pub message_timeout: Duration,
    /// Statistics sampling interval
    pub stats_interval: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(DEFAULT_MESSAGE_TIMEOUT_SECS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
        }
    }
}

impl Config {
    /// Load configuration from the TOML file and `MESH_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if no service name is configured or a duration is zero
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_file(file::load_config_file(path));
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Check values that defaults cannot repair
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending setting
    pub fn validate(&self) -> Result<()> {
        if self.identity.service.is_empty() {
            return Err(Error::Config(
                "service name not set (identity.service or MESH_SERVICE)".to_string(),
            ));
        }

        let durations = [
            ("coordination.connect_timeout_secs", self.coordination.connect_timeout),
            ("rpc.message_timeout_secs", self.rpc.message_timeout),
            ("rpc.stats_interval_secs", self.rpc.stats_interval),
            ("transport.reconnect_delay_secs", self.reconnect_delay),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }

        Ok(())
    }

    /// Build configuration from a parsed file overlaid on defaults
    #[must_use]
    pub fn from_file(file: MeshConfigFile) -> Self {
        let coordination = CoordinationConfig {
            host: file
                .coordination
                .host
                .unwrap_or_else(|| DEFAULT_COORDINATION_HOST.to_string()),
            port: file
                .coordination
                .port
                .unwrap_or(DEFAULT_COORDINATION_PORT),
            connect_timeout: Duration::from_secs(
                file.coordination
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
        };

        let extra = file
            .identity
            .extra
            .map(|table| {
                table
                    .into_iter()
                    .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k, v)))
                    .collect()
            })
            .unwrap_or_default();

        let identity = IdentityConfig {
            service: file.identity.service.unwrap_or_default(),
            uuid: file.identity.uuid,
            token: file.identity.token,
            extra,
        };

        let rpc = RpcConfig {
            message_timeout: Duration::from_secs(
                file.rpc
                    .message_timeout_secs
                    .unwrap_or(DEFAULT_MESSAGE_TIMEOUT_SECS),
            ),
            stats_interval: Duration::from_secs(
                file.rpc
                    .stats_interval_secs
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
            ),
        };

        Self {
            coordination,
            identity,
            servers: file
                .servers
                .unwrap_or_else(|| vec![TRANSPORT_SERVER.to_string()]),
            snapshot_path: file
                .snapshot_path
                .map_or_else(default_snapshot_path, PathBuf::from),
            rpc,
            reconnect_delay: Duration::from_secs(
                file.transport
                    .reconnect_delay_secs
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
            ),
        }
    }

    /// Apply `MESH_*` environment overrides
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("MESH_COORDINATION_HOST") {
            self.coordination.host = host;
        }
        if let Some(port) = std::env::var("MESH_COORDINATION_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.coordination.port = port;
        }
        if let Ok(service) = std::env::var("MESH_SERVICE") {
            self.identity.service = service;
        }
        if let Ok(uuid) = std::env::var("MESH_UUID") {
            self.identity.uuid = Some(uuid);
        }
        if let Ok(token) = std::env::var("MESH_TOKEN") {
            self.identity.token = Some(token);
        }
        if let Ok(path) = std::env::var("MESH_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(path);
        }
    }
}

/// Default snapshot location: `<data dir>/device-mesh/snapshot.json`
#[must_use]
pub fn default_snapshot_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("snapshot.json"),
        |d| d.data_dir().join("device-mesh").join("snapshot.json"),
    )
}
