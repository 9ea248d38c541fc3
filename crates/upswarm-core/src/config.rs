// ABOUTME: Configuration for the upswarm supervisor.
// ABOUTME: Loaded from TOML with every field defaulted; CLI flags override on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpswarmError};
use crate::process::WorkerCommand;

/// Default port the supervisor listens on.
pub const DEFAULT_PORT: u16 = 8300;

/// Floor for periodic timers.
const MIN_PERIOD_MS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interface to bind. Also the host spawned workers dial back to.
    pub host: String,

    pub port: u16,

    /// Topology file to watch (TOML, or JSON with a `.json` extension)
    pub topology_path: Option<String>,

    pub topology_poll_ms: u64,

    /// Delay before the first periodic reconciliation pass
    pub reconcile_initial_delay_ms: u64,

    pub reconcile_interval_ms: u64,

    /// Gap between consecutive spawns or stops of one service in a pass
    pub spawn_stagger_ms: u64,

    /// Command line that runs one service instance
    pub worker: WorkerCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            topology_path: None,
            topology_poll_ms: 1000,
            reconcile_initial_delay_ms: 5000,
            reconcile_interval_ms: 2000,
            spawn_stagger_ms: 1000,
            worker: WorkerCommand::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| UpswarmError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| UpswarmError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_err = |message: String| UpswarmError::ConfigWrite {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }

    /// Get the default config file path (~/.config/upswarm/upswarm.toml)
    pub fn default_path() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("upswarm")
            .join("upswarm.toml")
    }

    /// Topology path with `~` expanded
    pub fn topology_path_expanded(&self) -> Option<PathBuf> {
        self.topology_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Never zero; a zero period would make the ticker panic.
    pub fn topology_poll(&self) -> Duration {
        Duration::from_millis(self.topology_poll_ms.max(MIN_PERIOD_MS))
    }

    pub fn reconcile_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconcile_initial_delay_ms)
    }

    /// Never zero, like [`SupervisorConfig::topology_poll`].
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(MIN_PERIOD_MS))
    }

    pub fn spawn_stagger(&self) -> Duration {
        Duration::from_millis(self.spawn_stagger_ms)
    }
}
