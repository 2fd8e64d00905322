//! HTTP client for the node agent API.

use std::time::Duration;

use corral_reconcile::ReportedWorkload;
use reqwest::{Method, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AgentError, ContainerCreated, NodeSpec, ReqSuccess, VolumeSpec, WorkloadSpec};

/// Shared HTTP connection pool for talking to every node agent.
#[derive(Debug, Clone)]
pub struct AgentConnector {
    http: reqwest::Client,
    timeout: Duration,
}

impl AgentConnector {
    /// `timeout` bounds each individual request.
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Client for the agent at `addr` (`host:port`).
    pub fn node(&self, addr: &str) -> NodeAgentClient {
        NodeAgentClient {
            http: self.http.clone(),
            addr: addr.to_string(),
            timeout: self.timeout,
        }
    }
}

/// Client bound to one node agent.
#[derive(Debug, Clone)]
pub struct NodeAgentClient {
    http: reqwest::Client,
    addr: String,
    timeout: Duration,
}

impl NodeAgentClient {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// `GET /node`: hardware spec and attributes.
    pub async fn node_spec(&self, cancel: &CancellationToken) -> Result<NodeSpec, AgentError> {
        self.get(&["node"], cancel).await
    }

    /// `GET /alta`: workloads the agent currently knows about.
    pub async fn list_workloads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReportedWorkload>, AgentError> {
        self.get(&["alta"], cancel).await
    }

    /// `POST /alta/create`. Returns the new container id.
    pub async fn create_workload(
        &self,
        spec: &WorkloadSpec,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let created: ContainerCreated = self.post(&["alta", "create"], Some(spec), cancel).await?;
        Ok(created.container_id)
    }

    pub async fn start_workload(
        &self,
        workload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["alta", workload_id, "start"], None::<&()>, cancel)
            .await
    }

    pub async fn stop_workload(
        &self,
        workload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["alta", workload_id, "stop"], None::<&()>, cancel)
            .await
    }

    /// `POST /alta/{containerId}/update`: re-attach a workload's spec to a
    /// container the agent lost track of.
    pub async fn update_workload(
        &self,
        container_id: &str,
        spec: &WorkloadSpec,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["alta", container_id, "update"], Some(spec), cancel)
            .await
    }

    pub async fn image_present(
        &self,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError> {
        let reply: ReqSuccess = self
            .post(&["image", image, "ispresent"], None::<&()>, cancel)
            .await?;
        Ok(reply.success)
    }

    pub async fn pull_image(&self, image: &str, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.command(&["image", image, "pull"], None::<&()>, cancel)
            .await
    }

    pub async fn create_volume(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["volume", "create"], Some(spec), cancel).await
    }

    pub async fn mount_volume(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["volume", "mount"], Some(spec), cancel).await
    }

    pub async fn unmount_volume(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["volume", "unmount"], Some(spec), cancel).await
    }

    pub async fn create_network(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.command(&["network", name, "create"], None::<&()>, cancel)
            .await
    }

    /// `POST /peer/{addr}`: tell this node's dataplane about another node.
    pub async fn add_peer(&self, peer: &str, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.command(&["peer", peer], None::<&()>, cancel).await
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    fn url(&self, segments: &[&str]) -> Result<Url, AgentError> {
        let mut url = Url::parse(&format!("http://{}/", self.addr))
            .map_err(|_| AgentError::InvalidAddress(self.addr.clone()))?;
        url.path_segments_mut()
            .map_err(|_| AgentError::InvalidAddress(self.addr.clone()))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        cancel: &CancellationToken,
    ) -> Result<T, AgentError> {
        self.request(Method::GET, segments, None::<&()>, cancel)
            .await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> Result<T, AgentError> {
        self.request(Method::POST, segments, body, cancel).await
    }

    /// A POST answered with `{"success": bool}`; `false` is an error.
    async fn command<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let reply: ReqSuccess = self.post(segments, body, cancel).await?;
        if reply.success {
            Ok(())
        } else {
            Err(AgentError::Rejected {
                addr: self.addr.clone(),
                path: format!("/{}", segments.join("/")),
            })
        }
    }

    async fn request<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        cancel: &CancellationToken,
    ) -> Result<T, AgentError> {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        debug!(node = %self.addr, method = %method, path = %path, "Node agent request");

        let mut builder = self
            .http
            .request(method.clone(), url)
            .timeout(self.timeout);
        if method == Method::POST {
            builder = match body {
                Some(body) => builder.json(body),
                None => builder.json(&serde_json::json!({})),
            };
        }

        let call = async {
            let response = builder.send().await.map_err(|e| self.transport(&path, e))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| self.transport(&path, e))?;
            if status != reqwest::StatusCode::OK {
                return Err(AgentError::Status {
                    addr: self.addr.clone(),
                    path: path.clone(),
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            serde_json::from_slice(&bytes).map_err(|source| AgentError::Decode {
                path: path.clone(),
                source,
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = call => result,
        }
    }

    fn transport(&self, path: &str, source: reqwest::Error) -> AgentError {
        if source.is_timeout() {
            AgentError::Timeout {
                addr: self.addr.clone(),
                path: path.to_string(),
            }
        } else {
            AgentError::Http {
                addr: self.addr.clone(),
                source,
            }
        }
    }
}
