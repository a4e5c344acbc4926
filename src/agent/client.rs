use crate::agent::{AgentError, CoordinatorConfig};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

const HEALTHY_PATH: &str = "/v1/ipam/healthy";
const COORDINATOR_CONFIG_PATH: &str = "/v1/coordinator/config";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP/1.1 client for the agent's Unix socket. One connection per request;
/// a plugin invocation makes at most a couple of calls.
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket: PathBuf,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub async fn healthy(&self) -> Result<(), AgentError> {
        self.get(HEALTHY_PATH).await.map(|_| ())
    }

    pub async fn coordinator_config(
        &self,
        pod_namespace: &str,
        pod_name: &str,
    ) -> Result<CoordinatorConfig, AgentError> {
        // Kubernetes object names are DNS labels, nothing to escape.
        let path = format!(
            "{}?podNamespace={}&podName={}",
            COORDINATOR_CONFIG_PATH, pod_namespace, pod_name
        );
        self.get_json(&path).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AgentError> {
        let body = self.get(path).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get(&self, path: &str) -> Result<Bytes, AgentError> {
        match tokio::time::timeout(self.timeout, self.request(Method::GET, path)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<Bytes, AgentError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| AgentError::Connect {
                path: self.socket.display().to_string(),
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "agent connection closed");
            }
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "localhost")
            .body(Empty::<Bytes>::new())?;

        tracing::debug!(path, "agent request");
        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(AgentError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Ok(body)
    }
}
