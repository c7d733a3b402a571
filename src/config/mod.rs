//! Configuration management for Veles.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Extension IPC surface configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "veles", "veles").map_or_else(
            || PathBuf::from("veles.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}

/// Default data directory for runtime state (peer file, signal drops).
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "veles", "veles").map_or_else(
        || PathBuf::from(".veles"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Tunnel listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Admin HTTP surface address; `None` disables it.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: Option<SocketAddr>,

    /// Wrap the tunnel in TLS so the flow resembles HTTPS.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Path to the TLS certificate (PEM).
    #[serde(default = "default_tls_cert")]
    pub tls_cert: PathBuf,

    /// Path to the TLS private key (PEM).
    #[serde(default = "default_tls_key")]
    pub tls_key: PathBuf,

    /// Path to the 32-byte pre-shared key.
    pub key_file: Option<PathBuf>,

    /// TUN device name to request.
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT))
}
fn default_admin_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([127, 0, 0, 1], 9000)))
}
fn default_tls_cert() -> PathBuf {
    PathBuf::from("certs/server.crt")
}
fn default_tls_key() -> PathBuf {
    PathBuf::from("certs/server.key")
}
fn default_tun_name() -> String {
    "veles0".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            tls: true,
            tls_cert: default_tls_cert(),
            tls_key: default_tls_key(),
            key_file: None,
            tun_name: default_tun_name(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server endpoint (`host:port`). The `VELES_SERVER` environment
    /// variable supplies the default.
    pub server_addr: Option<String>,

    /// Request per-record encryption during the handshake.
    #[serde(default)]
    pub encrypt: bool,

    /// Wrap the tunnel in TLS.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Path to the 32-byte pre-shared key.
    pub key_file: Option<PathBuf>,

    /// TUN device name to request (Linux only; macOS assigns utunN).
    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// Development safety timeout; the client shuts itself down after this
    /// long. `None` runs indefinitely (production).
    #[serde(default = "default_dev_timeout", with = "humantime_serde")]
    pub dev_timeout: Option<Duration>,
}

fn default_dev_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: None,
            encrypt: false,
            tls: true,
            key_file: None,
            tun_name: default_tun_name(),
            dev_timeout: default_dev_timeout(),
        }
    }
}

/// Local IPC surface configuration. Loopback only; loopback is the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Listen address for the extension HTTP API.
    #[serde(default = "default_ipc_addr")]
    pub listen_addr: SocketAddr,

    /// Directory watched for outbound signal drops (`out-<peer>` files).
    #[serde(default = "default_signal_dir")]
    pub signal_dir: PathBuf,

    /// Well-known path the current peer directory is published to.
    #[serde(default = "default_peers_file")]
    pub peers_file: PathBuf,

    /// Well-known path update tokens are written to for the supervisor.
    #[serde(default = "default_update_file")]
    pub update_signal_file: PathBuf,
}

fn default_ipc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8889))
}
fn default_signal_dir() -> PathBuf {
    data_dir().join("signals")
}
fn default_peers_file() -> PathBuf {
    data_dir().join("peers.json")
}
fn default_update_file() -> PathBuf {
    data_dir().join("update-signal")
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_ipc_addr(),
            signal_dir: default_signal_dir(),
            peers_file: default_peers_file(),
            update_signal_file: default_update_file(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "veles=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable ANSI colors.
    #[serde(default = "default_true")]
    pub color: bool,

    /// Output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: true,
            format: default_log_format(),
        }
    }
}

/// Initialize the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr.port(), crate::DEFAULT_PORT);
        assert!(config.client.tls);
        assert!(!config.client.encrypt);
        assert_eq!(config.ipc.listen_addr.ip().to_string(), "127.0.0.1");
        assert_eq!(config.client.dev_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.listen_addr, config.server.listen_addr);
        assert_eq!(parsed.ipc.signal_dir, config.ipc.signal_dir);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: Config = toml::from_str("[client]\nencrypt = true\n").unwrap();
        assert!(parsed.client.encrypt);
        assert_eq!(parsed.server.tun_name, "veles0");
    }
}
