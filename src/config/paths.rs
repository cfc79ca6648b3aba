//! Where the companion binary and its resources live.

use std::path::{Path, PathBuf};

use super::{GlobalConfig, Overrides};

const COMPANION_DIR: &str = "CompanionServer";

#[cfg(target_os = "windows")]
const BINARY_NAME: &str = "companion_server.exe";
#[cfg(not(target_os = "windows"))]
const BINARY_NAME: &str = "companion_server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionPaths {
    pub binary: PathBuf,
    pub resources_dir: PathBuf,
}

impl CompanionPaths {
    /// Resolution order for the resources directory:
    /// 1. explicit resources dir (command line, then config file)
    /// 2. derived from an explicit binary: `.../resources/bin/<binary>` -> `.../resources`
    /// 3. the platform default next to the host executable
    pub fn resolve(overrides: &Overrides, config: &GlobalConfig) -> Self {
        let explicit_binary = overrides.binary.clone().or_else(|| config.binary.clone());
        let explicit_resources = overrides
            .resources_dir
            .clone()
            .or_else(|| config.resources_dir.clone());

        let resources_dir = match (&explicit_resources, &explicit_binary) {
            (Some(dir), _) => {
                tracing::info!("Using custom resources dir: {}", dir.display());
                dir.clone()
            }
            (None, Some(binary)) => {
                tracing::info!("Deriving resources dir from custom binary location");
                derive_resources_from_binary(binary)
            }
            (None, None) => default_resources_dir(&config.version()),
        };

        let binary = match explicit_binary {
            Some(binary) => {
                tracing::info!("Using custom server binary: {}", binary.display());
                binary
            }
            None => binary_in(&resources_dir),
        };

        Self {
            binary,
            resources_dir,
        }
    }
}

pub fn binary_in(resources_dir: &Path) -> PathBuf {
    resources_dir.join("bin").join(BINARY_NAME)
}

fn derive_resources_from_binary(binary: &Path) -> PathBuf {
    binary
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

fn default_resources_dir(version: &str) -> PathBuf {
    let exe_dir = match std::env::current_exe() {
        Ok(exe) => exe.parent().map(Path::to_path_buf).unwrap_or_default(),
        Err(e) => {
            tracing::error!("Failed to get executable directory: {}", e);
            return PathBuf::new();
        }
    };
    platform_root(exe_dir, version)
        .join(COMPANION_DIR)
        .join("default")
        .join("resources")
}

#[cfg(target_os = "macos")]
fn platform_root(exe_dir: PathBuf, _version: &str) -> PathBuf {
    // App.app/Contents/MacOS -> App.app/Contents/Resources
    exe_dir
        .parent()
        .map(|contents| contents.join("Resources"))
        .unwrap_or(exe_dir)
}

#[cfg(target_os = "windows")]
fn platform_root(exe_dir: PathBuf, version: &str) -> PathBuf {
    exe_dir.join(version)
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn platform_root(exe_dir: PathBuf, _version: &str) -> PathBuf {
    exe_dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_resources_win() {
        let overrides = Overrides {
            resources_dir: Some(PathBuf::from("/srv/res")),
            binary: Some(PathBuf::from("/elsewhere/bin/server")),
            ..Default::default()
        };
        let paths = CompanionPaths::resolve(&overrides, &GlobalConfig::default());
        assert_eq!(paths.resources_dir, PathBuf::from("/srv/res"));
        assert_eq!(paths.binary, PathBuf::from("/elsewhere/bin/server"));
    }

    #[test]
    fn resources_derived_from_binary() {
        let overrides = Overrides {
            binary: Some(PathBuf::from("/opt/app/resources/bin/server")),
            ..Default::default()
        };
        let paths = CompanionPaths::resolve(&overrides, &GlobalConfig::default());
        assert_eq!(paths.resources_dir, PathBuf::from("/opt/app/resources"));
    }

    #[test]
    fn command_line_beats_config_file() {
        let overrides = Overrides {
            resources_dir: Some(PathBuf::from("/cli/res")),
            ..Default::default()
        };
        let config = GlobalConfig {
            resources_dir: Some(PathBuf::from("/file/res")),
            ..Default::default()
        };
        let paths = CompanionPaths::resolve(&overrides, &config);
        assert_eq!(paths.resources_dir, PathBuf::from("/cli/res"));
        assert_eq!(paths.binary, binary_in(Path::new("/cli/res")));
    }

    #[test]
    fn default_layout_ends_with_resources() {
        let paths = CompanionPaths::resolve(&Overrides::default(), &GlobalConfig::default());
        assert!(paths.resources_dir.ends_with("CompanionServer/default/resources"));
        assert!(paths.binary.ends_with(Path::new("bin").join(BINARY_NAME)));
    }
}
