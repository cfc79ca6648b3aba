mod overrides;
mod paths;

pub use overrides::Overrides;
pub use paths::CompanionPaths;

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::SupervisorConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/companion.toml";
pub const DEFAULT_SETTINGS_PATH: &str = "companion-settings.json";
pub const DEFAULT_INSTALL_ID_PATH: &str = "companion-install-id";

/// Host configuration read from `config/companion.toml`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub settings_path: Option<PathBuf>,
    pub install_id_path: Option<PathBuf>,
    pub binary: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    /// Version reported in the init handshake; defaults to this crate's version.
    pub version: Option<String>,
    pub supervision: SupervisionConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisionConfig {
    pub liveness_interval_secs: u64,
    pub health_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub kill_grace_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            liveness_interval_secs: 5,
            health_interval_secs: 60,
            request_timeout_secs: 10,
            kill_grace_secs: 2,
        }
    }
}

impl GlobalConfig {
    /// Loads the TOML file at `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    pub fn install_id_path(&self) -> PathBuf {
        self.install_id_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_ID_PATH))
    }

    pub fn version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    /// Builds the supervisor settings from this file plus the command line.
    pub fn supervisor_config(&self, overrides: &Overrides) -> SupervisorConfig {
        let paths = CompanionPaths::resolve(overrides, self);
        let s = &self.supervision;
        SupervisorConfig {
            binary: paths.binary,
            resources_dir: paths.resources_dir,
            disabled: overrides.disable_companion,
            version: self.version(),
            liveness_interval: Duration::from_secs(s.liveness_interval_secs.max(1)),
            health_interval: Duration::from_secs(s.health_interval_secs.max(1)),
            request_timeout: Duration::from_secs(s.request_timeout_secs.max(1)),
            kill_grace: Duration::from_secs(s.kill_grace_secs),
        }
    }
}
