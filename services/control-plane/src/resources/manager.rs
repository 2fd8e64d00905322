//! Single-writer resource manager.
//!
//! One task owns the [`ResourceLedger`] and drains two request queues:
//! provider operations (capacity declarations and queries) and user
//! operations (alloc/free). Callers wait on a `oneshot` reply, so every
//! mutation is serialized without a lock.
//!
//! Each changed provider is written to the store before the caller gets its
//! reply. A failed write is logged and the operation still succeeds; after a
//! crash the manager restores whatever documents were last written.
//!
//! An invariant violation is answered with the error, then the loop stops
//! and the fatal signal trips. Every later request fails with
//! [`ResourceError::Unavailable`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use corral_store::CoordStore;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    AddOutcome, Grant, Provider, ProviderDecl, ProviderRef, ResourceError, ResourceLedger,
    ResourceRequest,
};
use crate::persist;

const QUEUE_SIZE: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, ResourceError>>;

#[derive(Debug)]
enum ProviderOp {
    Add {
        decls: Vec<ProviderDecl>,
        reply: Reply<Vec<AddOutcome>>,
    },
    Remove {
        refs: Vec<ProviderRef>,
        reply: Reply<Vec<Provider>>,
    },
    /// Drop the idle providers of one provider id.
    RemoveIdle {
        provider: String,
        reply: Reply<Vec<Provider>>,
    },
    Snapshot {
        resource_type: String,
        reply: Reply<BTreeMap<String, Provider>>,
    },
    Get {
        target: ProviderRef,
        reply: Reply<Option<Provider>>,
    },
    Restore {
        reply: Reply<usize>,
    },
}

#[derive(Debug)]
enum UserOp {
    Alloc {
        requests: Vec<ResourceRequest>,
        reply: Reply<Vec<Grant>>,
    },
    Free {
        requests: Vec<ResourceRequest>,
        reply: Reply<Vec<Grant>>,
    },
}

/// Handle to the resource manager task. Cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
    provider_tx: mpsc::Sender<ProviderOp>,
    user_tx: mpsc::Sender<UserOp>,
    fatal: watch::Receiver<Option<String>>,
}

impl ResourceManager {
    /// Start the manager task. It runs until `cancel` fires, every handle is
    /// dropped, or an invariant is violated.
    pub fn spawn(store: Arc<dyn CoordStore>, cancel: CancellationToken) -> Self {
        let (provider_tx, provider_rx) = mpsc::channel(QUEUE_SIZE);
        let (user_tx, user_rx) = mpsc::channel(QUEUE_SIZE);
        let (fatal_tx, fatal) = watch::channel(None);

        let worker = ManagerLoop {
            ledger: ResourceLedger::new(),
            store,
            fatal: fatal_tx,
        };
        tokio::spawn(worker.run(provider_rx, user_rx, cancel));

        Self {
            provider_tx,
            user_tx,
            fatal,
        }
    }

    /// Declare (or re-declare) providers.
    pub async fn add_providers(
        &self,
        decls: Vec<ProviderDecl>,
    ) -> Result<Vec<AddOutcome>, ResourceError> {
        request(&self.provider_tx, |reply| ProviderOp::Add { decls, reply }).await
    }

    /// Remove providers. Providers that still have users trip the fatal
    /// signal.
    pub async fn remove_providers(
        &self,
        refs: Vec<ProviderRef>,
    ) -> Result<Vec<Provider>, ResourceError> {
        request(&self.provider_tx, |reply| ProviderOp::Remove { refs, reply }).await
    }

    /// Remove every provider of `provider` that has no users, across all
    /// resource types. Busy providers stay; nothing here can trip the fatal
    /// signal.
    pub async fn remove_idle_providers(
        &self,
        provider: &str,
    ) -> Result<Vec<Provider>, ResourceError> {
        let provider = provider.to_string();
        request(&self.provider_tx, |reply| ProviderOp::RemoveIdle {
            provider,
            reply,
        })
        .await
    }

    /// Allocate every request or none.
    pub async fn alloc(&self, requests: Vec<ResourceRequest>) -> Result<Vec<Grant>, ResourceError> {
        request(&self.user_tx, |reply| UserOp::Alloc { requests, reply }).await
    }

    /// Release every request or none.
    pub async fn free(&self, requests: Vec<ResourceRequest>) -> Result<Vec<Grant>, ResourceError> {
        request(&self.user_tx, |reply| UserOp::Free { requests, reply }).await
    }

    /// Snapshot of every provider of a type, keyed and ordered by provider id.
    pub async fn providers(
        &self,
        resource_type: &str,
    ) -> Result<BTreeMap<String, Provider>, ResourceError> {
        let resource_type = resource_type.to_string();
        request(&self.provider_tx, |reply| ProviderOp::Snapshot {
            resource_type,
            reply,
        })
        .await
    }

    pub async fn provider(
        &self,
        resource_type: &str,
        provider: &str,
    ) -> Result<Option<Provider>, ResourceError> {
        let target = ProviderRef::new(resource_type, provider);
        request(&self.provider_tx, |reply| ProviderOp::Get { target, reply }).await
    }

    /// Load every persisted provider. Returns how many were restored;
    /// inconsistent documents are logged and skipped.
    pub async fn restore(&self) -> Result<usize, ResourceError> {
        request(&self.provider_tx, |reply| ProviderOp::Restore { reply }).await
    }

    /// The invariant violation that stopped the manager, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.borrow().clone()
    }

    /// Resolves once an invariant violation stops the manager. Never
    /// resolves if the manager shuts down normally.
    pub async fn fatal(&self) -> String {
        let mut rx = self.fatal.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

async fn request<Op, T>(
    tx: &mpsc::Sender<Op>,
    make: impl FnOnce(Reply<T>) -> Op,
) -> Result<T, ResourceError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(make(reply_tx))
        .await
        .map_err(|_| ResourceError::Unavailable)?;
    reply_rx.await.map_err(|_| ResourceError::Unavailable)?
}

// =============================================================================
// Processing loop
// =============================================================================

struct ManagerLoop {
    ledger: ResourceLedger,
    store: Arc<dyn CoordStore>,
    fatal: watch::Sender<Option<String>>,
}

/// Send a reply, passing back the fatal reason if the result carries one.
fn answer<T>(reply: Reply<T>, result: Result<T, ResourceError>) -> Option<String> {
    let fatal = match &result {
        Err(e) if e.is_fatal() => Some(e.to_string()),
        _ => None,
    };
    // The caller may have given up waiting.
    let _ = reply.send(result);
    fatal
}

impl ManagerLoop {
    async fn run(
        mut self,
        mut provider_rx: mpsc::Receiver<ProviderOp>,
        mut user_rx: mpsc::Receiver<UserOp>,
        cancel: CancellationToken,
    ) {
        info!("Resource manager started");
        loop {
            let fatal = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(op) = provider_rx.recv() => self.handle_provider(op).await,
                Some(op) = user_rx.recv() => self.handle_user(op).await,
                else => break,
            };

            if let Some(reason) = fatal {
                error!(error = %reason, "Resource manager stopping on invariant violation");
                self.fatal.send_replace(Some(reason));
                break;
            }
        }
        info!("Resource manager stopped");
    }

    async fn handle_provider(&mut self, op: ProviderOp) -> Option<String> {
        match op {
            ProviderOp::Add { decls, reply } => {
                let result = self.ledger.add_providers(&decls);
                if let Ok(outcomes) = &result {
                    for (decl, outcome) in decls.iter().zip(outcomes) {
                        debug!(
                            resource = %decl.resource_type,
                            provider = %decl.provider,
                            total = decl.total,
                            outcome = ?outcome,
                            "Declared provider"
                        );
                    }
                    let touched: BTreeSet<ProviderRef> = decls
                        .iter()
                        .map(|d| ProviderRef::new(&d.resource_type, &d.provider))
                        .collect();
                    self.persist(&touched).await;
                }
                answer(reply, result)
            }
            ProviderOp::Remove { refs, reply } => {
                let result = self.ledger.remove_providers(&refs);
                if let Ok(removed) = &result {
                    self.forget(removed).await;
                }
                answer(reply, result)
            }
            ProviderOp::RemoveIdle { provider, reply } => {
                let removed = self.ledger.remove_idle_providers(&provider);
                self.forget(&removed).await;
                answer(reply, Ok(removed))
            }
            ProviderOp::Snapshot {
                resource_type,
                reply,
            } => answer(reply, Ok(self.ledger.providers(&resource_type))),
            ProviderOp::Get { target, reply } => {
                let found = self
                    .ledger
                    .provider(&target.resource_type, &target.provider)
                    .cloned();
                answer(reply, Ok(found))
            }
            ProviderOp::Restore { reply } => {
                let result = self.restore().await;
                answer(reply, result)
            }
        }
    }

    async fn handle_user(&mut self, op: UserOp) -> Option<String> {
        let (requests, reply, result) = match op {
            UserOp::Alloc { requests, reply } => {
                let result = self.ledger.alloc(&requests);
                (requests, reply, result)
            }
            UserOp::Free { requests, reply } => {
                let result = self.ledger.free(&requests);
                (requests, reply, result)
            }
        };

        match &result {
            Ok(grants) => {
                debug!(lines = grants.len(), "Resource request applied");
                let touched: BTreeSet<ProviderRef> = requests
                    .iter()
                    .map(|r| ProviderRef::new(&r.resource_type, &r.provider))
                    .collect();
                self.persist(&touched).await;
            }
            Err(e) if !e.is_fatal() => debug!(error = %e, "Resource request rejected"),
            Err(_) => {}
        }
        answer(reply, result)
    }

    /// Delete the documents of removed providers.
    async fn forget(&self, removed: &[Provider]) {
        for p in removed {
            info!(resource = %p.resource_type, provider = %p.provider, "Removed provider");
            let key = persist::resource_key(&p.resource_type, &p.provider);
            if let Err(e) = persist::remove(self.store.as_ref(), &key).await {
                warn!(key = %key, error = %e, "Failed to delete provider document");
            }
        }
    }

    async fn persist(&self, touched: &BTreeSet<ProviderRef>) {
        for target in touched {
            let Some(provider) = self
                .ledger
                .provider(&target.resource_type, &target.provider)
            else {
                continue;
            };
            let key = persist::resource_key(&target.resource_type, &target.provider);
            if let Err(e) = persist::save(self.store.as_ref(), &key, provider).await {
                warn!(key = %key, error = %e, "Failed to persist provider");
            }
        }
    }

    async fn restore(&mut self) -> Result<usize, ResourceError> {
        let docs: Vec<(String, Provider)> =
            persist::load_all(self.store.as_ref(), &persist::resource_dir()).await?;

        let mut restored = 0;
        for (key, provider) in docs {
            match self.ledger.restore_provider(provider) {
                Ok(()) => restored += 1,
                Err(e) => error!(key = %key, error = %e, "Skipping inconsistent provider document"),
            }
        }
        info!(providers = restored, "Restored resource providers");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use corral_store::MemoryStore;

    use super::*;
    use crate::resources::{UnitKind, CPU, MEMORY};

    fn decl(resource_type: &str, provider: &str, total: u64) -> ProviderDecl {
        ProviderDecl {
            resource_type: resource_type.to_string(),
            provider: provider.to_string(),
            unit_kind: UnitKind::Fluid,
            total,
        }
    }

    #[tokio::test]
    async fn test_alloc_is_persisted_before_reply() {
        let store = Arc::new(MemoryStore::new());
        let rm = ResourceManager::spawn(store.clone(), CancellationToken::new());

        rm.add_providers(vec![decl(CPU, "n1", 4), decl(MEMORY, "n1", 4096)])
            .await
            .unwrap();
        rm.alloc(vec![ResourceRequest::new(CPU, "n1", "w1", 2)])
            .await
            .unwrap();

        let kv = store
            .get(&persist::resource_key(CPU, "n1"))
            .await
            .unwrap()
            .unwrap();
        let doc: Provider = serde_json::from_str(&kv.value).unwrap();
        assert_eq!((doc.used, doc.free), (2, 2));
        assert!(doc.users.contains_key("w1"));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = Arc::new(MemoryStore::new());
        let first = ResourceManager::spawn(store.clone(), CancellationToken::new());
        first.add_providers(vec![decl(CPU, "n1", 4)]).await.unwrap();
        first
            .alloc(vec![ResourceRequest::new(CPU, "n1", "w1", 3)])
            .await
            .unwrap();

        let second = ResourceManager::spawn(store, CancellationToken::new());
        assert_eq!(second.restore().await.unwrap(), 1);

        let cpu = second.provider(CPU, "n1").await.unwrap().unwrap();
        assert_eq!(cpu.free, 1);
        // Re-allocating for the same user returns the restored grant.
        let grant = second
            .alloc(vec![ResourceRequest::new(CPU, "n1", "w1", 3)])
            .await
            .unwrap();
        assert_eq!(grant[0].amount, 3);
        assert_eq!(second.provider(CPU, "n1").await.unwrap().unwrap().free, 1);
    }

    #[tokio::test]
    async fn test_invariant_violation_trips_fatal_signal() {
        let store = Arc::new(MemoryStore::new());
        let rm = ResourceManager::spawn(store, CancellationToken::new());
        rm.add_providers(vec![decl(CPU, "n1", 4)]).await.unwrap();
        rm.alloc(vec![ResourceRequest::new(CPU, "n1", "w1", 1)])
            .await
            .unwrap();

        let err = rm
            .remove_providers(vec![ProviderRef::new(CPU, "n1")])
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let reason = tokio::time::timeout(std::time::Duration::from_secs(1), rm.fatal())
            .await
            .unwrap();
        assert!(reason.contains("active users"));
        assert!(matches!(
            rm.providers(CPU).await,
            Err(ResourceError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_remove_idle_skips_providers_in_use() {
        let store = Arc::new(MemoryStore::new());
        let rm = ResourceManager::spawn(store.clone(), CancellationToken::new());
        rm.add_providers(vec![decl(CPU, "n1", 4), decl(MEMORY, "n1", 4096)])
            .await
            .unwrap();
        rm.alloc(vec![ResourceRequest::new(CPU, "n1", "w1", 1)])
            .await
            .unwrap();

        let removed = rm.remove_idle_providers("n1").await.unwrap();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].resource_type, MEMORY);
        assert!(rm.provider(CPU, "n1").await.unwrap().is_some());
        assert!(store
            .get(&persist::resource_key(MEMORY, "n1"))
            .await
            .unwrap()
            .is_none());
        assert!(rm.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_remove_deletes_document() {
        let store = Arc::new(MemoryStore::new());
        let rm = ResourceManager::spawn(store.clone(), CancellationToken::new());
        rm.add_providers(vec![decl(MEMORY, "n1", 512)]).await.unwrap();

        rm.remove_providers(vec![ProviderRef::new(MEMORY, "n1")])
            .await
            .unwrap();

        assert!(store
            .get(&persist::resource_key(MEMORY, "n1"))
            .await
            .unwrap()
            .is_none());
        assert!(rm.providers(MEMORY).await.unwrap().is_empty());
        assert!(rm.fatal_error().is_none());
    }
}
