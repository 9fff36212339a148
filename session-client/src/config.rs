//! Configuration loading for the session runtime.
//!
//! Configuration is loaded from a TOML file. Every field has a default, so
//! an empty file (or a missing section) is valid.

use serde::{Deserialize, Serialize};
use session_core::{ChannelKind, SessionPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    /// Session behaviour.
    #[serde(default)]
    pub session: SessionConfig,
    /// Channel negotiation and transfers.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Coalescing window for outgoing activities (default: 20ms).
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    /// Maximum activities per envelope (default: 64).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long a timestamp gap may stall before retransmission (default: 2000ms).
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
    /// How long an invitation waits for an answer (default: 60s).
    #[serde(default = "default_invitation_timeout_secs")]
    pub invitation_timeout_secs: u64,
    /// Sequenced activities the host keeps for retransmission (default: 1024).
    #[serde(default = "default_replay_buffer_capacity")]
    pub replay_buffer_capacity: usize,
    /// Whether drivers may invite (default: true).
    #[serde(default = "default_allow_driver_invites")]
    pub allow_driver_invites: bool,
    /// Accept every invitation as soon as it arrives (default: false).
    #[serde(default)]
    pub auto_accept_invitations: bool,
    /// Where reference points of joined sessions are materialized
    /// (default: `workspace`).
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-candidate connect timeout (default: 3000ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Channel kinds in preference order (default: direct, relayed).
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelKind>,
    /// Retries for a failed send before the peer is reported lost (default: 3).
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    /// Transfer progress polling interval (default: 200ms).
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Bytes per transfer chunk (default: 16 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

// Default value functions
fn default_batch_window_ms() -> u64 {
    20
}

fn default_max_batch_size() -> usize {
    64
}

fn default_gap_timeout_ms() -> u64 {
    2000
}

fn default_invitation_timeout_secs() -> u64 {
    60
}

fn default_replay_buffer_capacity() -> usize {
    1024
}

fn default_allow_driver_invites() -> bool {
    true
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_channels() -> Vec<ChannelKind> {
    vec![ChannelKind::Direct, ChannelKind::Relayed]
}

fn default_send_retries() -> u32 {
    3
}

fn default_monitor_interval_ms() -> u64 {
    200
}

fn default_chunk_size() -> usize {
    16 * 1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            gap_timeout_ms: default_gap_timeout_ms(),
            invitation_timeout_secs: default_invitation_timeout_secs(),
            replay_buffer_capacity: default_replay_buffer_capacity(),
            allow_driver_invites: default_allow_driver_invites(),
            auto_accept_invitations: false,
            workspace_dir: default_workspace_dir(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            channels: default_channels(),
            send_retries: default_send_retries(),
            monitor_interval_ms: default_monitor_interval_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl SessionConfig {
    /// Batch window as a duration.
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Gap timeout as a duration.
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    /// Invitation timeout as a duration.
    pub fn invitation_timeout(&self) -> Duration {
        Duration::from_secs(self.invitation_timeout_secs)
    }

    /// The session policy these settings describe.
    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            allow_driver_invites: self.allow_driver_invites,
        }
    }
}

impl TransportConfig {
    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Monitor interval as a duration.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = ClientConfig::default();
        assert_eq!(config.session.batch_window_ms, 20);
        assert_eq!(config.session.max_batch_size, 64);
        assert_eq!(config.session.gap_timeout_ms, 2000);
        assert_eq!(config.session.invitation_timeout_secs, 60);
        assert_eq!(config.session.replay_buffer_capacity, 1024);
        assert!(config.session.allow_driver_invites);
        assert!(!config.session.auto_accept_invitations);
        assert_eq!(config.transport.connect_timeout_ms, 3000);
        assert_eq!(
            config.transport.channels,
            vec![ChannelKind::Direct, ChannelKind::Relayed]
        );
        assert_eq!(config.transport.send_retries, 3);
        assert_eq!(config.transport.monitor_interval_ms, 200);
        assert_eq!(config.transport.chunk_size, 16384);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[session]
batch_window_ms = 5
gap_timeout_ms = 250
allow_driver_invites = false

[transport]
channels = ["hole-punched", "relayed"]
chunk_size = 1024
"#;

        let config: ClientConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.session.batch_window(), Duration::from_millis(5));
        assert_eq!(config.session.gap_timeout(), Duration::from_millis(250));
        assert!(!config.session.policy().allow_driver_invites);
        assert_eq!(config.session.max_batch_size, 64);
        assert_eq!(
            config.transport.channels,
            vec![ChannelKind::HolePunched, ChannelKind::Relayed]
        );
        assert_eq!(config.transport.chunk_size, 1024);
        assert_eq!(config.transport.send_retries, 3);
    }

    #[test]
    fn unknown_channel_kind_rejected() {
        let toml = r#"
[transport]
channels = ["smoke-signals"]
"#;
        assert!(toml::from_str::<ClientConfig>(toml).is_err());
    }

    #[test]
    fn from_file_reads_and_reports_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nmax_batch_size = 8").unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.session.max_batch_size, 8);

        let missing = ClientConfig::from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "[session\nbroken").unwrap();
        assert!(matches!(
            ClientConfig::from_file(bad.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn toml_rendering_roundtrips() {
        let config = ClientConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
