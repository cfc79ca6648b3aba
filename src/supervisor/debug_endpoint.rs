//! Local listening socket on the debug port.
//!
//! The protocol spoken on it belongs to the host; the supervisor only opens
//! the socket before launching the companion and releases it when the
//! companion goes away.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const LISTEN_BACKLOG: i32 = 10;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DebugEndpointError {
    #[error("failed to bind debug port {port} on loopback: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

pub type Closing<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// The "expose a local listening socket on a given port" capability.
pub trait DebugEndpoint: Send {
    fn open(&mut self, port: u16) -> Result<SocketAddr, DebugEndpointError>;

    /// Releases the socket. Closing an endpoint that is not open does nothing.
    fn close(&mut self) -> Closing<'_>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

struct Serving {
    addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Serves a host-supplied router on `127.0.0.1`, or `::1` when IPv4
/// loopback is unavailable.
pub struct LoopbackDebugEndpoint {
    router: Router,
    serving: Option<Serving>,
}

impl Default for LoopbackDebugEndpoint {
    fn default() -> Self {
        Self::new(Router::new())
    }
}

impl LoopbackDebugEndpoint {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            serving: None,
        }
    }

    fn bind(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        #[cfg(unix)]
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
}

impl DebugEndpoint for LoopbackDebugEndpoint {
    fn open(&mut self, port: u16) -> Result<SocketAddr, DebugEndpointError> {
        if let Some(serving) = &self.serving {
            return Ok(serving.addr);
        }

        let v4 = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let std_listener = match Self::bind(v4) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::debug!("Debug socket bind on {} failed ({}), trying ::1", v4, e);
                Self::bind(SocketAddr::from((Ipv6Addr::LOCALHOST, port)))
                    .map_err(|source| DebugEndpointError::Bind { port, source })?
            }
        };
        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|source| DebugEndpointError::Bind { port, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| DebugEndpointError::Bind { port, source })?;

        let token = CancellationToken::new();
        let shutdown = token.clone().cancelled_owned();
        let app = self.router.clone().layer(TraceLayer::new_for_http());
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Debug endpoint stopped with error: {}", e);
            }
        });

        tracing::info!("Debug socket listening on {}", addr);
        self.serving = Some(Serving { addr, token, task });
        Ok(addr)
    }

    fn close(&mut self) -> Closing<'_> {
        Box::pin(async move {
            let Some(Serving { addr, token, mut task }) = self.serving.take() else {
                return;
            };
            token.cancel();
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                // Open connections hold graceful shutdown; drop them.
                task.abort();
                let _ = task.await;
            }
            tracing::info!("Debug socket on {} closed", addr);
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.serving.as_ref().map(|s| s.addr)
    }
}
