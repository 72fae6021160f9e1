//! TOML configuration file loading
//!
//! Supports `~/.config/device-mesh/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MeshConfigFile {
    /// Coordination service connection
    #[serde(default)]
    pub coordination: CoordinationFileConfig,

    /// This instance's identity in the mesh
    #[serde(default)]
    pub identity: IdentityFileConfig,

    /// Server sections to mirror from `/system/<name>`
    pub servers: Option<Vec<String>>,

    /// RPC behaviour
    #[serde(default)]
    pub rpc: RpcFileConfig,

    /// Transport reconnect behaviour
    #[serde(default)]
    pub transport: TransportFileConfig,

    /// Where the local snapshot is persisted
    pub snapshot_path: Option<String>,
}

/// Coordination service connection
#[derive(Debug, Default, Deserialize)]
pub struct CoordinationFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_secs: Option<u64>,
}

/// Instance identity
#[derive(Debug, Default, Deserialize)]
pub struct IdentityFileConfig {
    /// Service name this instance registers under (e.g. "device_manager")
    pub service: Option<String>,
    pub uuid: Option<String>,
    pub token: Option<String>,
    /// Extra metadata leaves published next to `online`
    pub extra: Option<toml::Table>,
}

/// RPC behaviour
#[derive(Debug, Default, Deserialize)]
pub struct RpcFileConfig {
    /// Fallback when the coordination tree has no `message_timeout`
    pub message_timeout_secs: Option<u64>,
    /// Statistics sampling interval
    pub stats_interval_secs: Option<u64>,
}

/// Transport reconnect behaviour
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    pub reconnect_delay_secs: Option<u64>,
}

/// Load the TOML config file from `path`, or the standard location
///
/// Returns `MeshConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> MeshConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return MeshConfigFile::default();
    };

    if !path.exists() {
        return MeshConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            MeshConfigFile::default()
        }
    }
}

/// Read and parse a config file strictly
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML for this schema
pub fn read_config_file(path: &Path) -> Result<MeshConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/device-mesh/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("device-mesh").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: MeshConfigFile = toml::from_str(
            r#"
            servers = ["transport_server", "flow_server"]

            [coordination]
            host = "zk.internal"

            [identity]
            service = "device_manager"

            [identity.extra]
            listen_port = 8080
            "#,
        )
        .unwrap();

        assert_eq!(file.coordination.host.as_deref(), Some("zk.internal"));
        assert_eq!(file.coordination.port, None);
        assert_eq!(file.identity.service.as_deref(), Some("device_manager"));
        assert_eq!(file.servers.unwrap().len(), 2);
        assert!(file.identity.extra.unwrap().contains_key("listen_port"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let file = load_config_file(Some(Path::new("/nonexistent/device-mesh.toml")));
        assert!(file.identity.service.is_none());
    }

    #[test]
    fn invalid_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "servers = 3 = 4").unwrap();

        let file = load_config_file(Some(&path));
        assert!(file.servers.is_none());
        assert!(matches!(
            read_config_file(&path),
            Err(crate::Error::Toml(_))
        ));
    }
}
