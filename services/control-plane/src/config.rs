use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use corral_reconcile::MismatchPolicy;

use crate::scheduler::SchedulerPolicy;

/// Where the coordination store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    /// In-process store; state does not outlive the process.
    Memory,
    /// etcd v2 endpoint.
    Etcd(String),
}

impl FromStr for StoreUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "memory://" || s == "memory" {
            Ok(Self::Memory)
        } else if s.starts_with("http://") || s.starts_with("https://") {
            Ok(Self::Etcd(s.trim_end_matches('/').to_string()))
        } else {
            bail!("unsupported store url {s:?}; expected memory:// or http(s)://host:port")
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub holder_id: String,
    pub store_url: StoreUrl,
    pub leader_lock: String,
    pub leader_ttl: Duration,
    pub agent_service: String,
    pub agent_port: u16,
    pub agent_timeout: Duration,
    pub node_tick: Duration,
    pub schedule_retry: Duration,
    pub volume_mount_timeout: Duration,
    pub mismatch_policy: MismatchPolicy,
    pub default_scheduler: SchedulerPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CORRAL_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            .parse()
            .context("CORRAL_LISTEN_ADDR")?;

        let log_level = std::env::var("CORRAL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let holder_id = std::env::var("CORRAL_HOLDER_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("corral-{}", std::process::id()));

        let store_url = std::env::var("CORRAL_STORE_URL")
            .unwrap_or_else(|_| "memory://".to_string())
            .parse()?;

        let leader_lock =
            std::env::var("CORRAL_LEADER_LOCK").unwrap_or_else(|_| "master".to_string());

        let agent_service =
            std::env::var("CORRAL_AGENT_SERVICE").unwrap_or_else(|_| "node-agent".to_string());

        let agent_port = std::env::var("CORRAL_AGENT_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .context("CORRAL_AGENT_PORT")?;

        let mismatch_policy = std::env::var("CORRAL_MISMATCH_POLICY")
            .unwrap_or_else(|_| "log".to_string())
            .parse()?;

        let default_scheduler = std::env::var("CORRAL_DEFAULT_SCHEDULER")
            .unwrap_or_else(|_| "leastUsed".to_string())
            .parse()?;

        Ok(Self {
            listen_addr,
            log_level,
            holder_id,
            store_url,
            leader_lock,
            leader_ttl: secs("CORRAL_LEADER_TTL_SECS", 10)?,
            agent_service,
            agent_port,
            agent_timeout: secs("CORRAL_AGENT_TIMEOUT_SECS", 30)?,
            node_tick: secs("CORRAL_NODE_TICK_SECS", 5)?,
            schedule_retry: secs("CORRAL_SCHEDULE_RETRY_SECS", 15)?,
            volume_mount_timeout: secs("CORRAL_VOLUME_MOUNT_TIMEOUT_SECS", 15)?,
            mismatch_policy,
            default_scheduler,
        })
    }
}

fn secs(var: &str, default: u64) -> Result<Duration> {
    let secs = match std::env::var(var) {
        Ok(v) => v.parse::<u64>().with_context(|| format!("{var}={v:?}"))?,
        Err(_) => default,
    };
    if secs == 0 {
        bail!("{var} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_url() {
        assert_eq!("memory://".parse::<StoreUrl>().unwrap(), StoreUrl::Memory);
        assert_eq!(
            "http://etcd:2379/".parse::<StoreUrl>().unwrap(),
            StoreUrl::Etcd("http://etcd:2379".into())
        );
        assert!("redis://localhost".parse::<StoreUrl>().is_err());
    }
}
