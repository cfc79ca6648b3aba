//! HTTP plumbing shared by the health monitor and the control channel.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl RequestError {
    pub(crate) fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Transport(e)
        }
    }
}

/// Client for loopback calls: bounded timeout, no proxy, no cookies.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, RequestError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
        .map_err(|e| RequestError::Client(e.to_string()))
}

pub fn loopback_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_url_format() {
        assert_eq!(loopback_url(9100, "/health"), "http://127.0.0.1:9100/health");
    }

    #[test]
    fn client_builds() {
        assert!(build_client(Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn status_error_message() {
        assert_eq!(RequestError::Status(503).to_string(), "HTTP 503");
    }
}
