use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::ManagerStatus;
use crate::control::{ControlChannel, ControlKind, InitPayload, InstallIdSource};
use crate::health::{HealthMonitor, HealthOutcome};
use crate::supervisor::{Event, LaunchOutcome, Liveness, ProcessSupervisor};

pub(super) enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Status(oneshot::Sender<ManagerStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Single owner of the supervisor. Commands, completion events and timer
/// ticks are handled one at a time, so no field here needs a lock.
pub(super) struct OwnerTask {
    supervisor: ProcessSupervisor,
    health: HealthMonitor,
    control: ControlChannel,
    install_id: Option<Arc<dyn InstallIdSource>>,
    events: mpsc::UnboundedSender<Event>,
    liveness_timer: Option<Interval>,
    health_timer: Option<Interval>,
    health_in_flight: bool,
}

impl OwnerTask {
    pub(super) fn new(
        supervisor: ProcessSupervisor,
        health: HealthMonitor,
        control: ControlChannel,
        install_id: Option<Arc<dyn InstallIdSource>>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            supervisor,
            health,
            control,
            install_id,
            events,
            liveness_timer: None,
            health_timer: None,
            health_in_flight: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        tracing::debug!("Supervisor task started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All manager handles dropped");
                        self.supervisor.stop().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = tick(&mut self.liveness_timer) => self.on_liveness_tick().await,
                _ = tick(&mut self.health_timer) => self.on_health_tick().await,
            }
            self.sync_timers();
        }
        tracing::debug!("Supervisor task finished");
    }

    /// Returns false once the task should end.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                self.supervisor.start().await;
                let _ = reply.send(());
            }
            Command::Stop(reply) => {
                self.supervisor.stop().await;
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(reply) => {
                self.supervisor.stop().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::LaunchCompleted { generation, result } => {
                let outcome = self.supervisor.on_launch_completed(generation, result).await;
                if outcome == LaunchOutcome::Started && !self.supervisor.feature_enabled() {
                    // The companion starts with the feature on.
                    self.send_feature_toggle(false);
                }
            }
            Event::HealthChecked { generation, outcome } => {
                self.health_in_flight = false;
                if !self.supervisor.is_current(generation) {
                    tracing::debug!("Ignoring health result from an earlier launch");
                    return;
                }
                match outcome {
                    HealthOutcome::Healthy => {
                        tracing::debug!("Companion healthy");
                        if self.supervisor.claim_init_handshake() {
                            self.send_init();
                        }
                    }
                    HealthOutcome::Unhealthy(reason) => {
                        self.supervisor
                            .restart(&format!("health check failed: {}", reason))
                            .await;
                    }
                }
            }
            Event::ControlCompleted {
                generation,
                kind,
                result,
            } => match (kind, result) {
                (ControlKind::FeatureToggle { enabled }, Ok(())) => {
                    tracing::info!("Companion acknowledged enabled={}", enabled)
                }
                (ControlKind::FeatureToggle { enabled }, Err(e)) => {
                    tracing::warn!("Control request enabled={} failed: {}", enabled, e)
                }
                (ControlKind::Init, Ok(())) => tracing::info!("Init handshake accepted"),
                (ControlKind::Init, Err(e)) => {
                    tracing::error!("Init handshake failed (launch {}): {}", generation, e)
                }
            },
            Event::FeatureFlagChanged(enabled) => {
                tracing::info!("Companion feature flag changed to {}", enabled);
                if self.supervisor.set_feature_enabled(enabled) {
                    self.send_feature_toggle(enabled);
                }
            }
        }
    }

    async fn on_liveness_tick(&mut self) {
        tracing::debug!("Liveness poll");
        self.supervisor.poll_liveness().await;
    }

    async fn on_health_tick(&mut self) {
        // An exited process would only make the HTTP probe time out.
        if self.supervisor.poll_liveness().await != Liveness::Alive {
            return;
        }
        if self.health_in_flight {
            tracing::debug!("Previous health check still running, skipping");
            return;
        }
        let Some(ports) = self.supervisor.ports() else {
            return;
        };
        self.health_in_flight = true;
        self.health
            .spawn_check(ports.control, self.supervisor.generation(), self.events.clone());
    }

    fn send_feature_toggle(&self, enabled: bool) {
        let Some(ports) = self.supervisor.ports() else {
            return;
        };
        self.control.spawn_feature_toggle(
            ports.control,
            enabled,
            self.supervisor.generation(),
            self.events.clone(),
        );
    }

    fn send_init(&self) {
        let Some(ports) = self.supervisor.ports() else {
            return;
        };
        let Some(client_id) = self.install_id.as_ref().and_then(|s| s.install_id()) else {
            tracing::warn!("No install id available, skipping init handshake");
            return;
        };
        let payload = InitPayload::for_host(client_id, self.supervisor.config().version.clone());
        self.control.spawn_init(
            ports.control,
            payload,
            self.supervisor.generation(),
            self.events.clone(),
        );
    }

    /// Timers exist only while the companion runs; a fresh start gets fresh
    /// timers whose first tick is one full period away.
    fn sync_timers(&mut self) {
        if self.supervisor.is_running() {
            let config = self.supervisor.config();
            let (liveness, health) = (config.liveness_interval, config.health_interval);
            self.liveness_timer.get_or_insert_with(|| periodic(liveness));
            self.health_timer.get_or_insert_with(|| periodic(health));
        } else if self.liveness_timer.is_some() || self.health_timer.is_some() {
            tracing::debug!("Cancelling supervision timers");
            self.liveness_timer = None;
            self.health_timer = None;
        }
    }

    fn status(&self) -> ManagerStatus {
        let sup = &self.supervisor;
        ManagerStatus {
            state: sup.state(),
            ports: sup.ports(),
            debug_addr: sup.debug_addr(),
            feature_enabled: sup.feature_enabled(),
            pid: sup.pid(),
            launch_count: sup.launch_count(),
            restart_count: sup.restart_count(),
            init_sent: sup.init_sent(),
        }
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
