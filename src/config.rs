use crate::supervisor::Tunables;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from traywatch.toml.
///
/// Every section falls back to its defaults, so a missing or partial config
/// file is always usable; operators only override what they tune.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct TraywatchConfig {
    pub supervisor: SupervisorConfig,
    pub agent: AgentConfig,
    pub log: LogConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Liveness poll period while the agent is running, in seconds.
    pub poll_interval_secs: u64,
    /// Delay before retrying after a failed launch, in seconds.
    pub restart_delay_secs: u64,
    /// Delay between session checks while nobody is logged in, in seconds.
    pub session_wait_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable: an absolute path, or a name resolved against the
    /// supervisor's own install directory.
    pub executable: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Rotate the log file when it would exceed this many bytes.
    pub max_bytes: u64,
    /// Number of rotated backups to keep (supervisor.log.1, .2, ...).
    pub backup_count: usize,
    /// Default log level when RUST_LOG is not set.
    pub level: String,
    /// Override the data directory holding the log and lock files.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

impl SupervisorConfig {
    pub fn tunables(&self) -> Tunables {
        Tunables {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            restart_delay: Duration::from_secs(self.restart_delay_secs),
            session_wait: Duration::from_secs(self.session_wait_secs),
        }
    }
}

// --- Default implementations ---

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            restart_delay_secs: 5,
            session_wait_secs: 10,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: if cfg!(windows) {
                "helpdesk-agent.exe".to_string()
            } else {
                "helpdesk-agent".to_string()
            },
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            backup_count: 3,
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "TrayWatch".to_string(),
            display_name: "TrayWatch Agent Supervisor".to_string(),
            description: "Keeps the helpdesk tray agent running in the active user session."
                .to_string(),
        }
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load configuration from `path`. A missing file yields the defaults; a
/// present-but-invalid file is an error rather than a silent fallback.
pub fn load(path: &Path) -> Result<TraywatchConfig, ConfigError> {
    if !path.exists() {
        return Ok(TraywatchConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
