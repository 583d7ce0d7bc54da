//! Client side of the control plane: one HTTP/1 request per connection over
//! the daemon's Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::UnixStream;
use url::form_urlencoded;
use warden_types::{CollectionResult, HealthReport, WardenError};

#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn health(&self) -> Result<HealthReport, WardenError> {
        self.request(Method::GET, "/health").await
    }

    /// File-scoped when `file` is given, project-wide otherwise.
    pub async fn diagnostics(&self, file: Option<&Path>) -> Result<CollectionResult, WardenError> {
        let uri = match file {
            Some(file) => {
                let query = form_urlencoded::Serializer::new(String::new())
                    .append_pair("file", &file.to_string_lossy())
                    .finish();
                format!("/diagnostics?{query}")
            }
            None => "/diagnostics/all".to_string(),
        };
        self.request(Method::GET, &uri).await
    }

    pub async fn shutdown(&self) -> Result<(), WardenError> {
        self.request::<Value>(Method::POST, "/shutdown").await?;
        Ok(())
    }

    pub async fn reset_dedup(&self) -> Result<(), WardenError> {
        self.request::<Value>(Method::POST, "/reset-dedup").await?;
        Ok(())
    }

    async fn request<T: DeserializeOwned>(&self, method: Method, uri: &str) -> Result<T, WardenError> {
        let (status, body) = tokio::time::timeout(self.timeout, self.send(method, uri))
            .await
            .map_err(|_| {
                WardenError::control_plane(format!("{uri} timed out after {:?}", self.timeout))
            })?
            .map_err(|e| WardenError::control_plane(format!("{e:#}")))?;
        if !status.is_success() {
            return Err(WardenError::control_plane(format!(
                "{uri} answered {status}: {}",
                error_message(&body)
            )));
        }
        serde_json::from_slice(&body)
            .map_err(|e| WardenError::control_plane(format!("{uri} sent an unreadable body: {e}")))
    }

    async fn send(&self, method: Method, uri: &str) -> Result<(StatusCode, Bytes)> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to {}", self.socket.display()))?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake failed")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("Control connection closed with error: {e}");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "warden")
            .body(Empty::<Bytes>::new())
            .context("Failed to build request")?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| anyhow!("request failed: {e}"))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .context("Failed to read response body")?
            .to_bytes();
        Ok((status, body))
    }
}

/// The `error` field of a JSON error body, else the raw text.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}
