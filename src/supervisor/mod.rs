pub mod debug_endpoint;
pub mod process;
pub mod state_machine;

pub use debug_endpoint::{DebugEndpoint, DebugEndpointError, LoopbackDebugEndpoint};
pub use process::{CompanionProcess, ExitOutcome, LaunchSpec, ProcessError};
pub use state_machine::{StateMachine, SupervisionState, TransitionError};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::control::ControlKind;
use crate::health::HealthOutcome;
use crate::http::RequestError;
use crate::ports::{PortConfig, PortSet};

/// Everything that reaches the owner task from outside its own call stack.
#[derive(Debug)]
pub enum Event {
    LaunchCompleted {
        generation: u64,
        result: Result<CompanionProcess, ProcessError>,
    },
    HealthChecked {
        generation: u64,
        outcome: HealthOutcome,
    },
    ControlCompleted {
        generation: u64,
        kind: ControlKind,
        result: Result<(), RequestError>,
    },
    FeatureFlagChanged(bool),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub binary: PathBuf,
    pub resources_dir: PathBuf,
    /// Resolve ports but never launch.
    pub disabled: bool,
    /// Version reported in the init handshake.
    pub version: String,
    pub liveness_interval: Duration,
    pub health_interval: Duration,
    pub request_timeout: Duration,
    pub kill_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(binary: impl Into<PathBuf>, resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            resources_dir: resources_dir.into(),
            disabled: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
            liveness_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// What [`ProcessSupervisor::on_launch_completed`] did with a launch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started,
    Failed,
    /// Result of a launch the supervisor no longer waits for.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited(ExitOutcome),
    NotRunning,
}

/// Drives the companion lifecycle. Owned by a single task; every method
/// runs on that task, and results of offloaded work come back as [`Event`]s.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    machine: StateMachine,
    port_config: PortConfig,
    debug: Box<dyn DebugEndpoint>,
    process: Option<CompanionProcess>,
    ports: Option<PortSet>,
    feature_enabled: bool,
    init_sent: bool,
    generation: u64,
    launch_count: u64,
    restart_count: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        port_config: PortConfig,
        debug: Box<dyn DebugEndpoint>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            machine: StateMachine::new(),
            port_config,
            debug,
            process: None,
            ports: None,
            feature_enabled: true,
            init_sent: false,
            generation: 0,
            launch_count: 0,
            restart_count: 0,
            events,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisionState {
        self.machine.state()
    }

    pub fn ports(&self) -> Option<PortSet> {
        self.ports
    }

    pub fn feature_enabled(&self) -> bool {
        self.feature_enabled
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(CompanionProcess::pid)
    }

    /// Where the debug socket listens, while it is open.
    pub fn debug_addr(&self) -> Option<SocketAddr> {
        self.debug.local_addr()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn launch_count(&self) -> u64 {
        self.launch_count
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count
    }

    pub fn init_sent(&self) -> bool {
        self.init_sent
    }

    pub fn is_running(&self) -> bool {
        self.machine.is(SupervisionState::Running) && self.process.is_some()
    }

    /// True when a result tagged with `generation` still applies.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.is_running()
    }

    /// Resolves ports, opens the debug socket and launches the companion in
    /// the background. Does nothing unless stopped.
    pub async fn start(&mut self) {
        if !self.machine.is(SupervisionState::Stopped) {
            tracing::debug!("Start ignored, supervisor is {}", self.machine.state());
            return;
        }
        self.set_state(SupervisionState::Starting);

        let resolution = self.port_config.resolve();
        self.feature_enabled = resolution.feature_enabled;
        if let Some(changes) = resolution.flag_changes {
            self.forward_flag_changes(changes);
        }

        if self.config.disabled {
            tracing::info!("Companion disabled on the command line, not launching");
            self.ports = Some(resolution.ports);
            self.set_state(SupervisionState::Stopped);
            return;
        }

        let ports = self.port_config.negotiate(resolution.ports);
        self.ports = Some(ports);

        if let Err(e) = self.debug.open(ports.debug) {
            tracing::warn!("Debug socket unavailable: {}", e);
        }

        self.launch(ports);
    }

    fn launch(&mut self, ports: PortSet) {
        self.generation += 1;
        let generation = self.generation;
        let spec = LaunchSpec {
            binary: self.config.binary.clone(),
            resources_dir: self.config.resources_dir.clone(),
            ports,
        };
        let events = self.events.clone();

        tracing::info!("Launching companion {}", spec.binary.display());
        tokio::spawn(async move {
            let result = CompanionProcess::launch(spec).await;
            let _ = events.send(Event::LaunchCompleted { generation, result });
        });
    }

    fn forward_flag_changes(&self, mut changes: watch::Receiver<bool>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let enabled = *changes.borrow_and_update();
                if events.send(Event::FeatureFlagChanged(enabled)).is_err() {
                    break;
                }
            }
        });
    }

    pub async fn on_launch_completed(
        &mut self,
        generation: u64,
        result: Result<CompanionProcess, ProcessError>,
    ) -> LaunchOutcome {
        if generation != self.generation || !self.machine.is(SupervisionState::Starting) {
            if let Ok(process) = result {
                tracing::info!(
                    "Launch finished after the supervisor moved on, stopping pid {}",
                    process.pid()
                );
                process.terminate(self.config.kill_grace);
            }
            return LaunchOutcome::Stale;
        }

        match result {
            Ok(process) => {
                tracing::info!("Companion running (pid {})", process.pid());
                self.process = Some(process);
                self.init_sent = false;
                self.launch_count += 1;
                self.set_state(SupervisionState::Running);
                LaunchOutcome::Started
            }
            Err(e) => {
                tracing::error!("Failed to launch companion: {}", e);
                self.debug.close().await;
                self.set_state(SupervisionState::Stopped);
                LaunchOutcome::Failed
            }
        }
    }

    /// Non-blocking exit check. An abnormal exit relaunches the companion.
    pub async fn poll_liveness(&mut self) -> Liveness {
        if !self.machine.is(SupervisionState::Running) {
            return Liveness::NotRunning;
        }
        let Some(process) = self.process.as_mut() else {
            return Liveness::NotRunning;
        };

        match process.try_exit() {
            Ok(None) => Liveness::Alive,
            Ok(Some(outcome)) => {
                self.on_process_exited(outcome).await;
                Liveness::Exited(outcome)
            }
            Err(e) => {
                tracing::warn!("Liveness check failed: {}", e);
                Liveness::Alive
            }
        }
    }

    async fn on_process_exited(&mut self, outcome: ExitOutcome) {
        let pid = self.pid().unwrap_or_default();
        self.process = None;
        self.init_sent = false;
        self.generation += 1;
        self.set_state(SupervisionState::Stopped);
        self.debug.close().await;

        if outcome.is_abnormal() {
            match outcome.code {
                Some(code) => tracing::warn!("Companion (pid {}) crashed with exit code {}", pid, code),
                None => tracing::warn!("Companion (pid {}) was killed by a signal", pid),
            }
            self.restart_count += 1;
            tracing::info!("Relaunching companion after crash");
            self.start().await;
        } else {
            tracing::info!("Companion (pid {}) exited normally", pid);
        }
    }

    /// Terminates the running companion and launches a new one on the same
    /// ports. The debug socket stays open.
    pub async fn restart(&mut self, reason: &str) {
        if !self.machine.is(SupervisionState::Running) {
            tracing::debug!("Restart ignored, supervisor is {}", self.machine.state());
            return;
        }
        tracing::warn!("Restarting companion: {}", reason);
        self.set_state(SupervisionState::Restarting);
        self.restart_count += 1;
        self.terminate_process();

        let Some(ports) = self.ports else {
            self.debug.close().await;
            self.set_state(SupervisionState::Stopped);
            return;
        };
        self.set_state(SupervisionState::Starting);
        self.launch(ports);
    }

    /// Terminates the companion and closes the debug socket. Does nothing
    /// when already stopped.
    pub async fn stop(&mut self) {
        if self.machine.is(SupervisionState::Stopped) {
            return;
        }
        // Anything still in flight belongs to the old lifetime.
        self.generation += 1;
        self.terminate_process();
        self.debug.close().await;
        self.set_state(SupervisionState::Stopped);
        tracing::info!("Companion stopped");
    }

    fn terminate_process(&mut self) {
        self.init_sent = false;
        if let Some(process) = self.process.take() {
            process.terminate(self.config.kill_grace);
        }
    }

    /// Marks the init handshake as sent. Returns false if it already was for
    /// this process lifetime, or if nothing is running.
    pub fn claim_init_handshake(&mut self) -> bool {
        if !self.is_running() || self.init_sent {
            return false;
        }
        self.init_sent = true;
        true
    }

    /// Records a flag change. Returns true when the companion should be told.
    pub fn set_feature_enabled(&mut self, enabled: bool) -> bool {
        self.feature_enabled = enabled;
        self.is_running()
    }

    fn set_state(&mut self, to: SupervisionState) {
        if let Err(e) = self.machine.transition(to) {
            tracing::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::settings::{JsonSettingsStore, PersistedSettings, SettingsStore};
    use std::sync::Arc;

    fn free_ports() -> PortSet {
        let listeners: Vec<_> = (0..4)
            .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let port = |i: usize| listeners[i].local_addr().unwrap().port();
        PortSet {
            debug: port(0),
            control: port(1),
            agent: port(2),
            extension: port(3),
        }
    }

    fn store_for(ports: PortSet, enabled: bool) -> Arc<JsonSettingsStore> {
        Arc::new(JsonSettingsStore::with_settings(
            None,
            PersistedSettings {
                debug_port: Some(ports.debug.into()),
                control_port: Some(ports.control.into()),
                agent_port: Some(ports.agent.into()),
                extension_port: Some(ports.extension.into()),
                feature_enabled: Some(enabled),
            },
        ))
    }

    fn supervisor(
        config: SupervisorConfig,
        store: Arc<JsonSettingsStore>,
    ) -> (ProcessSupervisor, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(
            config,
            PortConfig::new(store, Overrides::default()),
            Box::new(LoopbackDebugEndpoint::default()),
            tx,
        );
        (sup, rx)
    }

    async fn next_launch(rx: &mut mpsc::UnboundedReceiver<Event>) -> (u64, Result<CompanionProcess, ProcessError>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Event::LaunchCompleted { generation, result } = event {
                return (generation, result);
            }
        }
    }

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("bin").join("companion_server");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn missing_binary_fails_and_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let ports = free_ports();
        let config = SupervisorConfig::new(dir.path().join("bin/absent"), dir.path());
        let (mut sup, mut rx) = supervisor(config, store_for(ports, true));

        sup.start().await;
        assert_eq!(sup.state(), SupervisionState::Starting);
        let (generation, result) = next_launch(&mut rx).await;
        assert!(matches!(result, Err(ProcessError::BinaryNotFound(_))));
        assert_eq!(sup.on_launch_completed(generation, result).await, LaunchOutcome::Failed);
        assert_eq!(sup.state(), SupervisionState::Stopped);
        assert!(!sup.is_running());
        assert_eq!(sup.launch_count(), 0);
    }

    #[tokio::test]
    async fn disabled_resolves_ports_without_launching() {
        let dir = tempfile::tempdir().unwrap();
        let ports = free_ports();
        let store = store_for(ports, false);
        let mut config = SupervisorConfig::new(dir.path().join("bin/absent"), dir.path());
        config.disabled = true;
        let (mut sup, mut rx) = supervisor(config, store.clone());

        sup.start().await;
        assert_eq!(sup.state(), SupervisionState::Stopped);
        assert_eq!(sup.ports(), Some(ports));
        assert!(!sup.feature_enabled());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.load().unwrap().control_port, Some(ports.control.into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lifecycle_start_restart_stop() {
        let dir = tempfile::tempdir().unwrap();
        let ports = free_ports();
        let config = SupervisorConfig::new(script(dir.path(), "exec sleep 30"), dir.path());
        let (mut sup, mut rx) = supervisor(config, store_for(ports, true));

        sup.start().await;
        // Second start while starting must not launch again
        sup.start().await;
        let (generation, result) = next_launch(&mut rx).await;
        assert_eq!(sup.on_launch_completed(generation, result).await, LaunchOutcome::Started);
        assert!(sup.is_running());
        assert!(sup.is_current(generation));
        assert_eq!(sup.ports(), Some(ports));
        assert_eq!(sup.poll_liveness().await, Liveness::Alive);
        assert_eq!(sup.debug_addr().map(|a| a.port()), Some(ports.debug));

        assert!(sup.claim_init_handshake());
        assert!(!sup.claim_init_handshake());

        let first_pid = sup.pid().unwrap();
        sup.restart("health check failed").await;
        assert_eq!(sup.state(), SupervisionState::Starting);
        assert!(!sup.init_sent());
        assert!(!sup.is_current(generation));
        let (generation, result) = next_launch(&mut rx).await;
        assert_eq!(sup.on_launch_completed(generation, result).await, LaunchOutcome::Started);
        assert_ne!(sup.pid(), Some(first_pid));
        assert_eq!(sup.ports(), Some(ports));
        assert_eq!(sup.restart_count(), 1);
        assert_eq!(sup.launch_count(), 2);
        assert!(sup.claim_init_handshake());

        sup.stop().await;
        assert_eq!(sup.state(), SupervisionState::Stopped);
        assert!(!sup.is_running());
        assert_eq!(sup.poll_liveness().await, Liveness::NotRunning);
        assert!(sup.debug_addr().is_none());
        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_finishing_after_stop_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::new(script(dir.path(), "exec sleep 30"), dir.path());
        let (mut sup, mut rx) = supervisor(config, store_for(free_ports(), true));

        sup.start().await;
        sup.stop().await;
        let (generation, result) = next_launch(&mut rx).await;
        assert!(result.is_ok());
        assert_eq!(sup.on_launch_completed(generation, result).await, LaunchOutcome::Stale);
        assert_eq!(sup.state(), SupervisionState::Stopped);
        assert!(sup.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_relaunches_and_clean_exit_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::new(script(dir.path(), "sleep 0.2\nexit 1"), dir.path());
        let (mut sup, mut rx) = supervisor(config, store_for(free_ports(), true));

        sup.start().await;
        let (generation, result) = next_launch(&mut rx).await;
        sup.on_launch_completed(generation, result).await;

        let liveness = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sup.poll_liveness().await {
                    Liveness::Alive => tokio::time::sleep(Duration::from_millis(50)).await,
                    other => return other,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(liveness, Liveness::Exited(ExitOutcome { code: Some(1) }));
        assert_eq!(sup.state(), SupervisionState::Starting);
        assert_eq!(sup.restart_count(), 1);

        let (generation, result) = next_launch(&mut rx).await;
        assert_eq!(sup.on_launch_completed(generation, result).await, LaunchOutcome::Started);
        sup.stop().await;

        let clean = SupervisorConfig::new(script(dir.path(), "exit 0"), dir.path());
        let (mut sup, mut rx) = supervisor(clean, store_for(free_ports(), true));
        sup.start().await;
        let (generation, result) = next_launch(&mut rx).await;
        sup.on_launch_completed(generation, result).await;
        let liveness = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sup.poll_liveness().await {
                    Liveness::Alive => tokio::time::sleep(Duration::from_millis(50)).await,
                    other => return other,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(liveness, Liveness::Exited(ExitOutcome { code: Some(0) }));
        assert_eq!(sup.state(), SupervisionState::Stopped);
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test]
    async fn flag_changes_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_for(free_ports(), true);
        let mut config = SupervisorConfig::new(dir.path().join("absent"), dir.path());
        config.disabled = true;
        let (mut sup, mut rx) = supervisor(config, store.clone());
        sup.start().await;

        store.set_feature_enabled(false).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::FeatureFlagChanged(false)));
        assert!(!sup.set_feature_enabled(false));
        assert!(!sup.feature_enabled());
    }
}
