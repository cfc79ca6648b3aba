//! Logical companion ports: the data model, discovery of free loopback ports
//! and resolution of persisted/overridden values.

pub mod allocator;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use allocator::PortAllocator;
pub use resolver::{PortConfig, Resolution};

pub const DEFAULT_DEBUG_PORT: u16 = 9222;
pub const DEFAULT_CONTROL_PORT: u16 = 9100;
pub const DEFAULT_AGENT_PORT: u16 = 9200;
pub const DEFAULT_EXTENSION_PORT: u16 = 9300;

/// One of the four ports handed to the companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRole {
    Debug,
    Control,
    Agent,
    Extension,
}

impl PortRole {
    /// Negotiation order on `Start`.
    pub const ALL: [PortRole; 4] = [
        PortRole::Debug,
        PortRole::Control,
        PortRole::Agent,
        PortRole::Extension,
    ];

    pub fn default_port(self) -> u16 {
        match self {
            Self::Debug => DEFAULT_DEBUG_PORT,
            Self::Control => DEFAULT_CONTROL_PORT,
            Self::Agent => DEFAULT_AGENT_PORT,
            Self::Extension => DEFAULT_EXTENSION_PORT,
        }
    }

    /// Human readable name used in diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Debug => "debug port",
            Self::Control => "control port",
            Self::Agent => "agent port",
            Self::Extension => "extension port",
        }
    }

    /// Name of the companion launch switch (`--<flag>=<port>`).
    pub fn launch_flag(self) -> &'static str {
        match self {
            Self::Debug => "debug-port",
            Self::Control => "control-port",
            Self::Agent => "agent-port",
            Self::Extension => "extension-port",
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The four ports of a companion instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub debug: u16,
    pub control: u16,
    pub agent: u16,
    pub extension: u16,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            debug: DEFAULT_DEBUG_PORT,
            control: DEFAULT_CONTROL_PORT,
            agent: DEFAULT_AGENT_PORT,
            extension: DEFAULT_EXTENSION_PORT,
        }
    }
}

impl PortSet {
    pub fn get(&self, role: PortRole) -> u16 {
        match role {
            PortRole::Debug => self.debug,
            PortRole::Control => self.control,
            PortRole::Agent => self.agent,
            PortRole::Extension => self.extension,
        }
    }

    pub fn set(&mut self, role: PortRole, port: u16) {
        match role {
            PortRole::Debug => self.debug = port,
            PortRole::Control => self.control = port,
            PortRole::Agent => self.agent = port,
            PortRole::Extension => self.extension = port,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortRole, u16)> + '_ {
        PortRole::ALL.into_iter().map(move |role| (role, self.get(role)))
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "debug: {}, control: {}, agent: {}, extension: {}",
            self.debug, self.control, self.agent, self.extension
        )
    }
}
