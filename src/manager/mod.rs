//! Public entry point: a cloneable handle to the task that owns the
//! supervisor.

mod task;

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::Overrides;
use crate::control::{ControlChannel, InstallIdSource};
use crate::health::HealthMonitor;
use crate::http::{build_client, RequestError};
use crate::ports::{PortAllocator, PortConfig, PortSet};
use crate::settings::SettingsStore;
use crate::supervisor::{
    DebugEndpoint, LoopbackDebugEndpoint, ProcessSupervisor, SupervisionState, SupervisorConfig,
};

use task::{Command, OwnerTask};

const COMMAND_QUEUE: usize = 32;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("supervisor task is no longer running")]
    Closed,
    #[error(transparent)]
    Client(#[from] RequestError),
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    #[serde(serialize_with = "display")]
    pub state: SupervisionState,
    pub ports: Option<PortSet>,
    pub debug_addr: Option<SocketAddr>,
    pub feature_enabled: bool,
    pub pid: Option<u32>,
    pub launch_count: u64,
    pub restart_count: u64,
    pub init_sent: bool,
}

impl ManagerStatus {
    pub fn is_running(&self) -> bool {
        self.state == SupervisionState::Running && self.pid.is_some()
    }
}

fn display<S: serde::Serializer>(state: &SupervisionState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}

pub struct ManagerBuilder {
    config: SupervisorConfig,
    store: Arc<dyn SettingsStore>,
    overrides: Overrides,
    allocator: PortAllocator,
    debug_endpoint: Option<Box<dyn DebugEndpoint>>,
    install_id: Option<Arc<dyn InstallIdSource>>,
}

impl ManagerBuilder {
    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn debug_endpoint(mut self, endpoint: impl DebugEndpoint + 'static) -> Self {
        self.debug_endpoint = Some(Box::new(endpoint));
        self
    }

    pub fn install_id_source(mut self, source: Arc<dyn InstallIdSource>) -> Self {
        self.install_id = Some(source);
        self
    }

    /// Spawns the owner task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> Result<ServerManager, ManagerError> {
        let timeout = self.config.request_timeout;
        let client = build_client(timeout)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);

        let port_config = PortConfig::new(self.store, self.overrides).with_allocator(self.allocator);
        let debug = self
            .debug_endpoint
            .unwrap_or_else(|| Box::new(LoopbackDebugEndpoint::default()));
        let supervisor = ProcessSupervisor::new(self.config, port_config, debug, events_tx.clone());

        let owner = OwnerTask::new(
            supervisor,
            HealthMonitor::new(client.clone(), timeout),
            ControlChannel::new(client, timeout),
            self.install_id,
            events_tx,
        );
        tokio::spawn(owner.run(commands_rx, events_rx));

        Ok(ServerManager {
            commands: commands_tx,
        })
    }
}

/// Handle to the supervisor. Dropping every clone stops the companion.
#[derive(Clone)]
pub struct ServerManager {
    commands: mpsc::Sender<Command>,
}

impl ServerManager {
    pub fn builder(config: SupervisorConfig, store: Arc<dyn SettingsStore>) -> ManagerBuilder {
        ManagerBuilder {
            config,
            store,
            overrides: Overrides::default(),
            allocator: PortAllocator::default(),
            debug_endpoint: None,
            install_id: None,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    /// Begins a start cycle. Returns once the launch is under way; the launch
    /// result shows up in [`status`](Self::status).
    pub async fn start(&self) -> Result<(), ManagerError> {
        self.request(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.request(Command::Stop).await
    }

    pub async fn status(&self) -> Result<ManagerStatus, ManagerError> {
        self.request(Command::Status).await
    }

    pub async fn is_running(&self) -> Result<bool, ManagerError> {
        Ok(self.status().await?.is_running())
    }

    /// Stops the companion and ends the owner task.
    pub async fn shutdown(self) -> Result<(), ManagerError> {
        self.request(Command::Shutdown).await
    }
}
