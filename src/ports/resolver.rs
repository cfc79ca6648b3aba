//! Port resolution: persisted values, defaults and command-line overrides.

use std::sync::Arc;
use tokio::sync::watch;

use super::{PortAllocator, PortRole, PortSet};
use crate::config::Overrides;
use crate::settings::{PersistedSettings, SettingsStore};

/// Control comes first because its override also turns the feature on.
const OVERRIDE_ORDER: [PortRole; 4] = [
    PortRole::Control,
    PortRole::Debug,
    PortRole::Agent,
    PortRole::Extension,
];

/// Result of [`PortConfig::resolve`].
#[derive(Debug)]
pub struct Resolution {
    pub ports: PortSet,
    pub feature_enabled: bool,
    /// Flag change notifications; only handed out by the first resolution.
    pub flag_changes: Option<watch::Receiver<bool>>,
}

pub struct PortConfig {
    store: Arc<dyn SettingsStore>,
    overrides: Overrides,
    allocator: PortAllocator,
    watching: bool,
}

impl PortConfig {
    pub fn new(store: Arc<dyn SettingsStore>, overrides: Overrides) -> Self {
        Self {
            store,
            overrides,
            allocator: PortAllocator::default(),
            watching: false,
        }
    }

    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Reads the store, applies defaults and overrides, then writes the
    /// result back so the next resolution is stable.
    pub fn resolve(&mut self) -> Resolution {
        let stored = match self.store.load() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to read companion settings, using defaults: {}", e);
                PersistedSettings::default()
            }
        };

        let mut ports = PortSet {
            debug: stored_port(stored.debug_port, PortRole::Debug),
            control: stored_port(stored.control_port, PortRole::Control),
            agent: stored_port(stored.agent_port, PortRole::Agent),
            extension: stored_port(stored.extension_port, PortRole::Extension),
        };
        let mut feature_enabled = stored.feature_enabled.unwrap_or(true);

        for role in OVERRIDE_ORDER {
            if let Some(port) = self.overrides.port(role) {
                ports.set(role, port);
                if role == PortRole::Control {
                    feature_enabled = true;
                }
            }
        }

        if let Err(e) = self.store.save_ports(&ports) {
            tracing::warn!("Failed to persist companion ports: {}", e);
        }
        if let Err(e) = self.store.set_feature_enabled(feature_enabled) {
            tracing::warn!("Failed to persist companion feature flag: {}", e);
        }
        tracing::info!("Ports initialized and saved to settings - {}", ports);

        let flag_changes = if self.watching {
            None
        } else {
            self.watching = true;
            Some(self.store.subscribe_feature_enabled())
        };

        Resolution {
            ports,
            feature_enabled,
            flag_changes,
        }
    }

    /// Moves every port to the nearest free one. Ports stay pairwise distinct,
    /// and anything that moved is written back for external consumers.
    pub fn negotiate(&self, resolved: PortSet) -> PortSet {
        let mut negotiated = resolved;
        let mut claimed = Vec::with_capacity(PortRole::ALL.len());

        for role in PortRole::ALL {
            let port = self
                .allocator
                .find_available_excluding(resolved.get(role), &claimed);
            negotiated.set(role, port);
            claimed.push(port);
        }

        if negotiated != resolved {
            tracing::info!("Negotiated ports - {}", negotiated);
            if let Err(e) = self.store.save_ports(&negotiated) {
                tracing::warn!("Failed to persist negotiated ports: {}", e);
            }
        }
        negotiated
    }
}

fn stored_port(value: Option<i64>, role: PortRole) -> u16 {
    match value.map(u16::try_from) {
        Some(Ok(port)) if port > 0 => port,
        Some(_) => {
            tracing::warn!(
                "Stored {} {:?} is invalid, using default {}",
                role,
                value,
                role.default_port()
            );
            role.default_port()
        }
        None => role.default_port(),
    }
}
