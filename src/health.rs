//! Periodic `/health` probe against the companion's control port.

use std::time::Duration;
use tokio::sync::mpsc;

use crate::http::{loopback_url, RequestError};
use crate::supervisor::Event;

pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Unhealthy(String),
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// `GET /health`; only a 200 counts as healthy.
    pub async fn check(&self, control_port: u16) -> HealthOutcome {
        let url = loopback_url(control_port, HEALTH_PATH);
        tracing::debug!("Health check GET {}", url);

        match self.client.get(&url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => HealthOutcome::Healthy,
            Ok(resp) => {
                HealthOutcome::Unhealthy(RequestError::Status(resp.status().as_u16()).to_string())
            }
            Err(e) => HealthOutcome::Unhealthy(RequestError::from_reqwest(e, self.timeout).to_string()),
        }
    }

    /// Runs [`check`](Self::check) in the background and reports the outcome
    /// on the owner's event queue.
    pub fn spawn_check(
        &self,
        control_port: u16,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let outcome = monitor.check(control_port).await;
            let _ = events.send(Event::HealthChecked { generation, outcome });
        });
    }
}
