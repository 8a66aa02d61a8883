//! Raw REST transport for the local LXD daemon.
//!
//! LXD listens on a Unix socket, which reqwest cannot dial; each call
//! opens a fresh http1 connection instead — handshake, drive the
//! connection in the background, send one request — over a `UnixStream`.
//!
//! Every JSON endpoint wraps its payload in the standard LXD envelope
//! (`type` = `sync` | `async` | `error`); mutating calls come back as
//! background operations that are polled separately.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

use kiln_core::{BackendError, BackendResult};

/// Response envelope every LXD JSON endpoint uses.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub struct LxdClient {
    socket: PathBuf,
}

impl LxdClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn send(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<hyper::Response<hyper::body::Incoming>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| BackendError::api(op, e))?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| BackendError::api(op, e))?;

        // Drive the connection in the background for the single exchange.
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let payload = match body {
            Some(value) => {
                Bytes::from(serde_json::to_vec(&value).map_err(|e| BackendError::api(op, e))?)
            }
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header("host", "lxd")
            .header("user-agent", concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .header("content-type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| BackendError::api(op, e))?;

        sender
            .send_request(request)
            .await
            .map_err(|e| BackendError::api(op, e))
    }

    async fn envelope(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<Envelope> {
        let response = self.send(op, method, path, body).await?;
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BackendError::api(op, e))?
            .to_bytes();
        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::api(op, e))?;

        if envelope.kind == "error" {
            return Err(BackendError::api(
                op,
                format!("lxd returned {}: {}", envelope.error_code, envelope.error),
            ));
        }
        Ok(envelope)
    }

    /// GET a sync endpoint and decode its metadata payload.
    pub async fn get<T: DeserializeOwned>(&self, op: &'static str, path: &str) -> BackendResult<T> {
        let envelope = self.envelope(op, Method::GET, path, None).await?;
        serde_json::from_value(envelope.metadata).map_err(|e| BackendError::api(op, e))
    }

    /// Like [`get`](Self::get), but a 404 becomes `None`.
    pub async fn get_opt<T: DeserializeOwned>(
        &self,
        op: &'static str,
        path: &str,
    ) -> BackendResult<Option<T>> {
        let response = self.send(op, Method::GET, path, None).await?;
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BackendError::api(op, e))?
            .to_bytes();
        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::api(op, e))?;

        if envelope.kind == "error" {
            if envelope.error_code == 404 {
                return Ok(None);
            }
            return Err(BackendError::api(
                op,
                format!("lxd returned {}: {}", envelope.error_code, envelope.error),
            ));
        }
        let value = serde_json::from_value(envelope.metadata).map_err(|e| BackendError::api(op, e))?;
        Ok(Some(value))
    }

    /// Issue a mutating call that starts a background operation; returns
    /// the operation's path for polling.
    pub async fn start(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<String> {
        let envelope = self.envelope(op, method, path, body).await?;
        if envelope.operation.is_empty() {
            return Err(BackendError::api(op, "expected a background operation"));
        }
        Ok(envelope.operation)
    }

    /// Issue a mutating call that completes synchronously.
    pub async fn sync(
        &self,
        op: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<()> {
        self.envelope(op, method, path, body).await.map(|_| ())
    }

    /// Read a file from inside an instance. `None` when the instance or
    /// the file is unreachable — the caller treats that as "not reported
    /// yet", never as a listing failure.
    pub async fn read_instance_file(
        &self,
        instance: &str,
        path: &str,
    ) -> BackendResult<Option<String>> {
        let op = "read instance file";
        let uri = format!("/1.0/instances/{instance}/files?path={path}");
        let response = self.send(op, Method::GET, &uri, None).await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BackendError::api(op, e))?
            .to_bytes();
        Ok(Some(String::from_utf8_lossy(&bytes).trim().to_string()))
    }
}

// ── Wire models ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LxdInstance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LxdImage {
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LxdAlias {
    pub name: String,
    pub target: String,
}

/// Metadata payload of `GET /1.0/operations/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct LxdOperation {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_envelope_decodes() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"type": "sync", "status": "Success", "status_code": 200,
                "metadata": [{"name": "kiln-runner-abcde", "status": "Running",
                              "config": {"user.kiln-runner": "true"}}]}"#,
        )
        .unwrap();

        assert_eq!(envelope.kind, "sync");
        let instances: Vec<LxdInstance> = serde_json::from_value(envelope.metadata).unwrap();
        assert_eq!(instances[0].name, "kiln-runner-abcde");
        assert_eq!(instances[0].config["user.kiln-runner"], "true");
    }

    #[test]
    fn async_envelope_carries_the_operation_path() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"type": "async", "status": "Operation created", "status_code": 100,
                "operation": "/1.0/operations/b43f2e1c", "metadata": {"id": "b43f2e1c"}}"#,
        )
        .unwrap();

        assert_eq!(envelope.kind, "async");
        assert_eq!(envelope.operation, "/1.0/operations/b43f2e1c");
    }

    #[test]
    fn error_envelope_decodes() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"type": "error", "error": "not found", "error_code": 404}"#,
        )
        .unwrap();

        assert_eq!(envelope.kind, "error");
        assert_eq!(envelope.error_code, 404);
    }

    #[test]
    fn image_created_at_parses_rfc3339() {
        let image: LxdImage = serde_json::from_str(
            r#"{"fingerprint": "a1b2c3", "created_at": "2026-08-07T10:30:00Z",
                "properties": {"type": "kiln-runner"}}"#,
        )
        .unwrap();

        assert_eq!(image.fingerprint, "a1b2c3");
        assert_eq!(image.created_at.to_rfc3339(), "2026-08-07T10:30:00+00:00");
    }

    #[test]
    fn operation_metadata_decodes() {
        let operation: LxdOperation = serde_json::from_str(
            r#"{"id": "b43f2e1c", "status": "Success", "status_code": 200,
                "err": "", "metadata": {"fingerprint": "a1b2c3"}}"#,
        )
        .unwrap();

        assert_eq!(operation.status_code, 200);
        assert_eq!(operation.metadata["fingerprint"], "a1b2c3");
    }
}
