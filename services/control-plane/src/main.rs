//! corral control plane
//!
//! Every replica contends for the leader lock. The holder runs the
//! controllers and serves the HTTP API; the others wait for the lock to
//! become free. Losing the lock tears the leader's controllers down and the
//! replica goes back to contending.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use corral_control_plane::{
    api,
    config::{Config, StoreUrl},
    resources::ResourceManager,
    state::{ControlPlane, ControlPlaneOptions},
};
use corral_store::{CoordStore, DistributedLock, EtcdStore, LockEvent, MemoryStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STORE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CORRAL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting corral control plane");
    info!(
        listen_addr = %config.listen_addr,
        holder = %config.holder_id,
        store = ?config.store_url,
        "Configuration loaded"
    );

    let store: Arc<dyn CoordStore> = match &config.store_url {
        StoreUrl::Memory => Arc::new(MemoryStore::new()),
        StoreUrl::Etcd(endpoint) => Arc::new(EtcdStore::new(endpoint, STORE_TIMEOUT)?),
    };

    let mut lock = DistributedLock::new(
        store.clone(),
        config.leader_lock.clone(),
        config.holder_id.clone(),
        config.leader_ttl,
    );
    let mut lock_events = lock.events().context("lock event channel already taken")?;
    lock.acquire(None)?;
    info!(lock = %config.leader_lock, "Contending for leadership");

    let root = CancellationToken::new();
    let mut leader: Option<Leader> = None;

    let outcome = loop {
        let resources = leader.as_ref().map(|l| l.resources.clone());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break Ok(());
            }
            event = lock_events.recv() => match event {
                Some(LockEvent::Acquired) => {
                    if leader.is_some() {
                        continue;
                    }
                    info!(holder = %config.holder_id, "Acquired leadership");
                    match Leader::start(store.clone(), &config, &root).await {
                        Ok(l) => leader = Some(l),
                        Err(e) => break Err(e.context("starting control plane")),
                    }
                }
                Some(LockEvent::Lost) => {
                    warn!("Lost leadership");
                    if let Some(l) = leader.take() {
                        l.stop().await;
                    }
                }
                Some(LockEvent::AcquireTimeout) => {
                    warn!("Leader lock acquisition timed out");
                }
                None => break Err(anyhow!("leader lock stopped")),
            },
            reason = resource_fatal(resources) => {
                error!(reason = %reason, "Resource accounting invariant violated");
                break Err(anyhow!("resource accounting invariant violated: {reason}"));
            }
            result = server_exit(&mut leader) => {
                match result {
                    Ok(Ok(())) => info!("Server exited normally"),
                    Ok(Err(e)) => error!(error = %e, "Server error"),
                    Err(e) => error!(error = %e, "Server task panicked"),
                }
                // The server task has been consumed; only the controllers remain.
                if let Some(l) = leader.take() {
                    l.plane.shutdown().await;
                }
                break Err(anyhow!("HTTP server stopped"));
            }
        }
    };

    if let Some(l) = leader.take() {
        l.stop().await;
    }
    root.cancel();
    lock.release().await;

    info!("Control plane shutdown complete");
    outcome
}

/// What this replica runs while it holds the lock.
struct Leader {
    plane: ControlPlane,
    resources: ResourceManager,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<io::Result<()>>,
}

impl Leader {
    async fn start(
        store: Arc<dyn CoordStore>,
        config: &Config,
        root: &CancellationToken,
    ) -> Result<Self> {
        let plane = ControlPlane::start(store, ControlPlaneOptions::from(config), root).await?;
        let state = plane.state();
        let resources = state.resources().clone();
        let app = api::create_router(state);

        let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
        info!(addr = %config.listen_addr, "Listening for connections");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("HTTP server shutting down");
                })
                .await
        });

        Ok(Self {
            plane,
            resources,
            shutdown_tx,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.server).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "HTTP server did not shut down in time"),
        }
        self.plane.shutdown().await;
    }
}

async fn resource_fatal(resources: Option<ResourceManager>) -> String {
    match resources {
        Some(resources) => resources.fatal().await,
        None => std::future::pending().await,
    }
}

async fn server_exit(
    leader: &mut Option<Leader>,
) -> Result<io::Result<()>, tokio::task::JoinError> {
    match leader {
        Some(l) => (&mut l.server).await,
        None => std::future::pending().await,
    }
}
