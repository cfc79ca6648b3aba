//! Command-line switches that override persisted companion settings.

use std::path::PathBuf;

use crate::ports::allocator::{is_restricted, is_well_known};
use crate::ports::PortRole;

pub const DEBUG_PORT_SWITCH: &str = "--companion-debug-port";
pub const CONTROL_PORT_SWITCH: &str = "--companion-control-port";
pub const AGENT_PORT_SWITCH: &str = "--companion-agent-port";
pub const EXTENSION_PORT_SWITCH: &str = "--companion-extension-port";
pub const DISABLE_SWITCH: &str = "--disable-companion";
pub const BINARY_SWITCH: &str = "--companion-binary";
pub const RESOURCES_DIR_SWITCH: &str = "--companion-resources-dir";

const VALUE_SWITCHES: [&str; 6] = [
    DEBUG_PORT_SWITCH,
    CONTROL_PORT_SWITCH,
    AGENT_PORT_SWITCH,
    EXTENSION_PORT_SWITCH,
    BINARY_SWITCH,
    RESOURCES_DIR_SWITCH,
];

/// Raw override values. Port values stay unparsed until resolution so that
/// an invalid value can be reported and ignored there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub debug_port: Option<String>,
    pub control_port: Option<String>,
    pub agent_port: Option<String>,
    pub extension_port: Option<String>,
    pub disable_companion: bool,
    pub binary: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
}

impl Overrides {
    /// Picks the companion switches out of the host's argument list.
    /// Accepts `--switch=value` and `--switch value`; unknown arguments are left alone.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = Self::default();
        let mut args = args.into_iter().peekable();

        while let Some(arg) = args.next() {
            let (name, inline) = match arg.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (arg.clone(), None),
            };

            if name == DISABLE_SWITCH {
                overrides.disable_companion = true;
                continue;
            }

            if !VALUE_SWITCHES.contains(&name.as_str()) {
                continue;
            }

            let value = match inline {
                Some(value) => value,
                None => match args.next_if(|next| !next.starts_with("--")) {
                    Some(value) => value,
                    None => {
                        tracing::warn!("Switch {} given without a value", name);
                        continue;
                    }
                },
            };

            match name.as_str() {
                DEBUG_PORT_SWITCH => overrides.debug_port = Some(value),
                CONTROL_PORT_SWITCH => overrides.control_port = Some(value),
                AGENT_PORT_SWITCH => overrides.agent_port = Some(value),
                EXTENSION_PORT_SWITCH => overrides.extension_port = Some(value),
                BINARY_SWITCH => overrides.binary = Some(PathBuf::from(value)),
                RESOURCES_DIR_SWITCH => overrides.resources_dir = Some(PathBuf::from(value)),
                _ => {}
            }
        }

        overrides
    }

    pub fn raw_port(&self, role: PortRole) -> Option<&str> {
        match role {
            PortRole::Debug => self.debug_port.as_deref(),
            PortRole::Control => self.control_port.as_deref(),
            PortRole::Agent => self.agent_port.as_deref(),
            PortRole::Extension => self.extension_port.as_deref(),
        }
    }

    /// Parsed override for `role`, or `None` when absent or invalid.
    pub fn port(&self, role: PortRole) -> Option<u16> {
        self.raw_port(role)
            .and_then(|raw| parse_port_override(raw, role.label()))
    }
}

/// Validates an override value. Out-of-range or non-numeric values are
/// ignored with a warning; well-known and restricted ports are accepted
/// because an explicit choice wins, but they are flagged.
pub fn parse_port_override(raw: &str, port_name: &str) -> Option<u16> {
    let port = match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            tracing::warn!(
                "Invalid {} specified on command line: {} (must be 1-65535)",
                port_name,
                raw
            );
            return None;
        }
    };

    if is_well_known(port) {
        tracing::warn!(
            "{} {} is well-known (0-1023) and may require elevated privileges",
            port_name,
            port
        );
    }
    if is_restricted(port) {
        tracing::warn!(
            "{} {} is on the restricted port list and may interfere with system services",
            port_name,
            port
        );
    }

    tracing::info!("{} overridden via command line: {}", port_name, port);
    Some(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_inline_and_separate_values() {
        let o = Overrides::from_args(args(&[
            "--companion-debug-port=9333",
            "--companion-control-port",
            "9444",
            "--companion-binary=/tmp/bin/server",
            "--unrelated",
            "--companion-resources-dir",
            "/tmp/res",
        ]));
        assert_eq!(o.debug_port.as_deref(), Some("9333"));
        assert_eq!(o.control_port.as_deref(), Some("9444"));
        assert_eq!(o.binary, Some(PathBuf::from("/tmp/bin/server")));
        assert_eq!(o.resources_dir, Some(PathBuf::from("/tmp/res")));
        assert!(!o.disable_companion);
        assert_eq!(o.port(PortRole::Debug), Some(9333));
        assert_eq!(o.port(PortRole::Agent), None);
    }

    #[test]
    fn disable_switch_is_a_flag() {
        let o = Overrides::from_args(args(&["--disable-companion"]));
        assert!(o.disable_companion);
    }

    #[test]
    fn missing_value_is_skipped() {
        let o = Overrides::from_args(args(&["--companion-agent-port", "--disable-companion"]));
        assert!(o.agent_port.is_none());
        assert!(o.disable_companion);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_eq!(parse_port_override("0", "debug port"), None);
        assert_eq!(parse_port_override("65536", "debug port"), None);
        assert_eq!(parse_port_override("-1", "debug port"), None);
        assert_eq!(parse_port_override("abc", "debug port"), None);
        assert_eq!(parse_port_override("", "debug port"), None);
    }

    #[test]
    fn edge_values_are_accepted() {
        assert_eq!(parse_port_override("1", "agent port"), Some(1));
        assert_eq!(parse_port_override("65535", "agent port"), Some(65535));
        // Restricted but explicit
        assert_eq!(parse_port_override("6000", "agent port"), Some(6000));
    }
}
