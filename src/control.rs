//! Runtime control requests sent to the companion: the feature toggle and
//! the one-time init handshake.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::http::{loopback_url, RequestError};
use crate::supervisor::Event;

pub const CONTROL_PATH: &str = "/mcp/control";
pub const INIT_PATH: &str = "/init";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    pub client_id: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl InitPayload {
    /// Payload describing this host.
    pub fn for_host(client_id: String, version: String) -> Self {
        Self {
            client_id,
            version,
            os: host_os_name(),
            arch: host_arch(),
        }
    }
}

fn host_os_name() -> String {
    sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string())
}

fn host_arch() -> String {
    sysinfo::System::cpu_arch().unwrap_or_else(|| std::env::consts::ARCH.to_string())
}

/// Which control request completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    FeatureToggle { enabled: bool },
    Init,
}

/// Source of the installation identifier sent with the init handshake.
pub trait InstallIdSource: Send + Sync {
    fn install_id(&self) -> Option<String>;
}

/// Install id kept in a small text file, generated on first use.
pub struct FileInstallId {
    path: PathBuf,
}

impl FileInstallId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InstallIdSource for FileInstallId {
    fn install_id(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) if !content.trim().is_empty() => return Some(content.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!("Failed to read install id from {}: {}", self.path.display(), e);
                return None;
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::error!("Failed to create {}: {}", parent.display(), e);
                return None;
            }
        }
        match fs::write(&self.path, &id) {
            Ok(()) => {
                tracing::info!("Generated new install id at {}", self.path.display());
                Some(id)
            }
            Err(e) => {
                tracing::error!("Failed to store install id at {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlChannel {
    client: reqwest::Client,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// `POST /mcp/control` with `{"enabled": <bool>}`.
    pub async fn send_feature_toggle(
        &self,
        control_port: u16,
        enabled: bool,
    ) -> Result<(), RequestError> {
        self.post_json(control_port, CONTROL_PATH, &ControlRequest { enabled })
            .await
    }

    /// `POST /init` with the host description.
    pub async fn send_init(&self, control_port: u16, payload: &InitPayload) -> Result<(), RequestError> {
        self.post_json(control_port, INIT_PATH, payload).await
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        port: u16,
        path: &str,
        body: &T,
    ) -> Result<(), RequestError> {
        let url = loopback_url(port, path);
        tracing::debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RequestError::from_reqwest(e, self.timeout))?;

        if resp.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(RequestError::Status(resp.status().as_u16()))
        }
    }

    /// Fire-and-forget toggle; completion arrives as [`Event::ControlCompleted`].
    pub fn spawn_feature_toggle(
        &self,
        control_port: u16,
        enabled: bool,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let channel = self.clone();
        tracing::info!("Sending control request: {{\"enabled\": {}}}", enabled);
        tokio::spawn(async move {
            let result = channel.send_feature_toggle(control_port, enabled).await;
            let _ = events.send(Event::ControlCompleted {
                generation,
                kind: ControlKind::FeatureToggle { enabled },
                result,
            });
        });
    }

    /// Fire-and-forget init handshake; completion arrives as [`Event::ControlCompleted`].
    pub fn spawn_init(
        &self,
        control_port: u16,
        payload: InitPayload,
        generation: u64,
        events: mpsc::UnboundedSender<Event>,
    ) {
        let channel = self.clone();
        tracing::info!("Sending init request to companion");
        tokio::spawn(async move {
            let result = channel.send_init(control_port, &payload).await;
            let _ = events.send(Event::ControlCompleted {
                generation,
                kind: ControlKind::Init,
                result,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_client;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn serve(status: StatusCode) -> (u16, Seen) {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route(
                "/mcp/control",
                post(|State((seen, status)): State<(Seen, StatusCode)>, Json(body): Json<Value>| async move {
                    seen.lock().unwrap().push(body);
                    status
                }),
            )
            .route(
                "/init",
                post(|State((seen, status)): State<(Seen, StatusCode)>, Json(body): Json<Value>| async move {
                    seen.lock().unwrap().push(body);
                    status
                }),
            )
            .with_state((seen.clone(), status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (port, seen)
    }

    fn channel() -> ControlChannel {
        let timeout = Duration::from_secs(5);
        ControlChannel::new(build_client(timeout).unwrap(), timeout)
    }

    #[test]
    fn control_body_shape() {
        let body = serde_json::to_value(ControlRequest { enabled: false }).unwrap();
        assert_eq!(body, json!({"enabled": false}));
    }

    #[test]
    fn init_payload_fields() {
        let payload = InitPayload::for_host("abc".into(), "1.0.0".into());
        let body = serde_json::to_value(&payload).unwrap();
        assert_eq!(body["client_id"], "abc");
        assert_eq!(body["version"], "1.0.0");
        assert!(!payload.os.is_empty());
        assert!(!payload.arch.is_empty());
    }

    #[tokio::test]
    async fn toggle_posts_enabled_flag() {
        let (port, seen) = serve(StatusCode::OK).await;
        channel().send_feature_toggle(port, false).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[json!({"enabled": false})]);
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let (port, _) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
        let err = channel().send_feature_toggle(port, true).await.unwrap_err();
        assert!(matches!(err, RequestError::Status(500)));
    }

    #[tokio::test]
    async fn init_posts_payload() {
        let (port, seen) = serve(StatusCode::OK).await;
        let payload = InitPayload {
            client_id: "id-1".into(),
            version: "2.0".into(),
            os: "Linux".into(),
            arch: "x86_64".into(),
        };
        channel().send_init(port, &payload).await.unwrap();
        let bodies = seen.lock().unwrap();
        assert_eq!(
            bodies[0],
            json!({"client_id": "id-1", "version": "2.0", "os": "Linux", "arch": "x86_64"})
        );
    }

    #[test]
    fn install_id_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileInstallId::new(dir.path().join("ids").join("install-id"));
        let first = source.install_id().unwrap();
        let second = source.install_id().unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn unreadable_install_id_location_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be
        let path = dir.path().join("install-id");
        fs::create_dir(&path).unwrap();
        assert!(FileInstallId::new(path).install_id().is_none());
    }
}
