//! etcd v2 keys API client.
//!
//! Maps [`CoordStore`] onto `/v2/keys`: create is `prevExist=false`,
//! compare operations use `prevIndex`, listing is `recursive=true` and
//! watches long-poll with `wait=true&waitIndex=N`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    normalize_key, CoordStore, KeyValue, StoreError, Watch, WatchAction, WatchEvent, WATCH_BUFFER,
};

const ERR_KEY_NOT_FOUND: u32 = 100;
const ERR_TEST_FAILED: u32 = 101;
const ERR_NODE_EXIST: u32 = 105;
const ERR_EVENT_INDEX_CLEARED: u32 = 401;

const INDEX_CLEARED: &str = "etcd watch index cleared";

/// Pause before re-polling after a failed watch request.
const WATCH_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct Response {
    action: String,
    node: Option<Node>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
}

/// [`CoordStore`] backed by an etcd v2 endpoint.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    watch_client: reqwest::Client,
    endpoint: String,
}

impl EtcdStore {
    /// `endpoint` is the base URL, e.g. `http://127.0.0.1:2379`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        // Long polls must outlive the request timeout.
        let watch_client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            watch_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v2/keys/{}", self.endpoint, normalize_key(key))
    }

    async fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<Response, StoreError> {
        let mut req = self.client.request(method, self.url(key)).query(query);
        if let Some(form) = form {
            req = req.form(form);
        }
        let response = req.send().await?;
        decode(key, response).await
    }
}

async fn decode(key: &str, response: reqwest::Response) -> Result<Response, StoreError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(StoreError::from);
    }

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) => Err(match err.error_code {
            ERR_KEY_NOT_FOUND => StoreError::KeyNotFound(key.to_string()),
            ERR_NODE_EXIST => StoreError::KeyExists(key.to_string()),
            ERR_TEST_FAILED => StoreError::CompareFailed {
                key: key.to_string(),
                expected: 0,
            },
            ERR_EVENT_INDEX_CLEARED => StoreError::Transport(INDEX_CLEARED.to_string()),
            code => StoreError::Transport(format!("etcd error {code}: {}", err.message)),
        }),
        Err(_) => {
            error!(status = %status, body = %body, "Unexpected etcd response");
            Err(StoreError::Transport(format!("{status}: {body}")))
        }
    }
}

fn ttl_param(ttl: Option<Duration>) -> Option<(&'static str, String)> {
    // etcd TTLs are whole seconds; never round a lease down to zero.
    ttl.map(|t| ("ttl", t.as_secs().max(1).to_string()))
}

fn write_form(value: &str, ttl: Option<Duration>) -> Vec<(&'static str, String)> {
    let mut form = vec![("value", value.to_string())];
    form.extend(ttl_param(ttl));
    form
}

fn leaves(node: Node, out: &mut Vec<KeyValue>) {
    if node.dir {
        for child in node.nodes {
            leaves(child, out);
        }
    } else if let (Some(key), Some(value)) = (node.key, node.value) {
        out.push(KeyValue {
            key: normalize_key(&key).to_string(),
            value,
            revision: node.modified_index,
        });
    }
}

fn revision_of(resp: &Response) -> Result<u64, StoreError> {
    resp.node
        .as_ref()
        .map(|n| n.modified_index)
        .ok_or_else(|| StoreError::Decode(format!("{} response without node", resp.action)))
}

#[async_trait]
impl CoordStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        match self.request(Method::GET, key, &[], None).await {
            Ok(resp) => Ok(resp.node.and_then(|n| {
                let value = n.value?;
                Some(KeyValue {
                    key: normalize_key(key).to_string(),
                    value,
                    revision: n.modified_index,
                })
            })),
            Err(StoreError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let resp = self
            .request(Method::PUT, key, &[], Some(write_form(value, ttl).as_slice()))
            .await?;
        revision_of(&resp)
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let resp = self
            .request(
                Method::PUT,
                key,
                &[("prevExist", "false".to_string())],
                Some(write_form(value, ttl).as_slice()),
            )
            .await?;
        revision_of(&resp)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_revision: u64,
    ) -> Result<u64, StoreError> {
        let resp = self
            .request(
                Method::PUT,
                key,
                &[("prevIndex", prev_revision.to_string())],
                Some(write_form(value, ttl).as_slice()),
            )
            .await
            .map_err(|e| with_expected(e, prev_revision))?;
        revision_of(&resp)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.request(Method::DELETE, key, &[], None).await?;
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, prev_revision: u64) -> Result<(), StoreError> {
        self.request(
            Method::DELETE,
            key,
            &[("prevIndex", prev_revision.to_string())],
            None,
        )
        .await
        .map_err(|e| with_expected(e, prev_revision))?;
        Ok(())
    }

    async fn list_dir(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let resp = match self
            .request(
                Method::GET,
                prefix,
                &[("recursive", "true".to_string())],
                None,
            )
            .await
        {
            Ok(resp) => resp,
            Err(StoreError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        if let Some(node) = resp.node {
            if node.dir {
                leaves(node, &mut out);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<Watch, StoreError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let token = CancellationToken::new();
        let poller = WatchPoller {
            client: self.watch_client.clone(),
            url: self.url(key),
            key: normalize_key(key).to_string(),
            recursive,
            tx,
            stop: token.clone(),
        };
        tokio::spawn(poller.run());
        Ok(Watch::new(rx, token))
    }
}

fn with_expected(e: StoreError, expected: u64) -> StoreError {
    match e {
        StoreError::CompareFailed { key, .. } => StoreError::CompareFailed { key, expected },
        other => other,
    }
}

struct WatchPoller {
    client: reqwest::Client,
    url: String,
    key: String,
    recursive: bool,
    tx: mpsc::Sender<WatchEvent>,
    stop: CancellationToken,
}

impl WatchPoller {
    async fn run(self) {
        let mut wait_index: Option<u64> = None;
        loop {
            let mut query = vec![("wait", "true".to_string())];
            if self.recursive {
                query.push(("recursive", "true".to_string()));
            }
            if let Some(index) = wait_index {
                query.push(("waitIndex", index.to_string()));
            }

            let poll = async {
                let response = self.client.get(&self.url).query(&query).send().await?;
                decode(&self.key, response).await
            };

            let result = tokio::select! {
                _ = self.stop.cancelled() => break,
                result = poll => result,
            };

            match result {
                Ok(resp) => {
                    let Some(action) = WatchAction::parse(&resp.action) else {
                        debug!(action = %resp.action, "Ignoring etcd watch action");
                        continue;
                    };
                    let Some(node) = resp.node else {
                        continue;
                    };
                    wait_index = Some(node.modified_index + 1);
                    let event = WatchEvent {
                        action,
                        key: node
                            .key
                            .as_deref()
                            .map(normalize_key)
                            .unwrap_or(&self.key)
                            .to_string(),
                        value: if action.is_removal() { None } else { node.value },
                        revision: node.modified_index,
                    };
                    if self.tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(StoreError::Transport(msg)) if msg == INDEX_CLEARED => {
                    warn!(key = %self.key, "Watch index cleared, resuming from now");
                    wait_index = None;
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Watch poll failed, retrying");
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(WATCH_RETRY) => {}
                    }
                }
            }
        }
        debug!(key = %self.key, "Watch stopped");
    }
}
