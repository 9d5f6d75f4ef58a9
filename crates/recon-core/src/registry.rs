use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use recon_model::{Address, NodeId, NodeRecord, Persisted};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{error::CoreError, snapshot::SnapshotFile};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct NodeSnapshot {
    version: u32,
    nodes: Vec<NodeRecord>,
}

/// Set of nodes a coordinator dispatches to.
///
/// Every node gets a fresh node id on registration; the address stays the
/// unique key. Registration order is preserved.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Vec<NodeRecord>>>,
    token: Arc<str>,
    snapshot: Arc<SnapshotFile<NodeSnapshot>>,
}

impl NodeRegistry {
    /// In-memory registry guarded by `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
            token: Arc::from(token.into()),
            snapshot: Arc::new(SnapshotFile::disabled()),
        }
    }

    /// Registry backed by a snapshot at `path`.
    ///
    /// An unreadable snapshot is logged and the registry starts empty.
    pub async fn open(token: impl Into<String>, path: PathBuf) -> Self {
        let snapshot: SnapshotFile<NodeSnapshot> = SnapshotFile::new(path);
        let nodes = match snapshot.load().await {
            Ok(Some(snap)) => {
                info!(nodes = snap.nodes.len(), "node registry restored");
                snap.nodes
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "node registry snapshot unreadable; starting empty");
                Vec::new()
            }
        };

        Self {
            inner: Arc::new(RwLock::new(nodes)),
            token: Arc::from(token.into()),
            snapshot: Arc::new(snapshot),
        }
    }

    #[instrument(level = "debug", skip(self, token))]
    pub async fn register(
        &self,
        token: &str,
        address: &str,
    ) -> Result<Persisted<NodeRecord>, CoreError> {
        self.authorize(token)?;
        let address = normalize_address(address)?;

        let record = {
            let mut nodes = self.write();
            if nodes.iter().any(|n| n.address == address) {
                return Err(CoreError::AlreadyRegistered(address));
            }
            let record = NodeRecord {
                id: NodeId::from(uuid::Uuid::new_v4().to_string()),
                address,
                registered_at: recon_model::now(),
            };
            nodes.push(record.clone());
            record
        };

        info!(node = %record.id, address = %record.address, "node registered");
        let warning = self.persist().await;
        Ok(Persisted::new(record, warning))
    }

    #[instrument(level = "debug", skip(self, token))]
    pub async fn unregister(
        &self,
        token: &str,
        address: &str,
    ) -> Result<Persisted<NodeRecord>, CoreError> {
        self.authorize(token)?;
        let address = normalize_address(address)?;

        let record = {
            let mut nodes = self.write();
            let pos = nodes
                .iter()
                .position(|n| n.address == address)
                .ok_or(CoreError::NotRegistered(address))?;
            nodes.remove(pos)
        };

        info!(node = %record.id, address = %record.address, "node unregistered");
        let warning = self.persist().await;
        Ok(Persisted::new(record, warning))
    }

    /// Register statically configured peers that are not known yet.
    pub async fn seed<I, S>(&self, addresses: I) -> Persisted<Vec<NodeRecord>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        {
            let mut nodes = self.write();
            for raw in addresses {
                let address = match normalize_address(raw.as_ref()) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "skipping bootstrap peer");
                        continue;
                    }
                };
                if nodes.iter().any(|n| n.address == address) {
                    continue;
                }
                let record = NodeRecord {
                    id: NodeId::from(uuid::Uuid::new_v4().to_string()),
                    address,
                    registered_at: recon_model::now(),
                };
                nodes.push(record.clone());
                added.push(record);
            }
        }

        if added.is_empty() {
            return Persisted::durable(added);
        }
        debug!(added = added.len(), "bootstrap peers registered");
        let warning = self.persist().await;
        Persisted::new(added, warning)
    }

    /// Registered nodes in registration order.
    pub fn list(&self) -> Vec<NodeRecord> {
        self.read().clone()
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeRecord> {
        self.read().iter().find(|n| &n.id == id).cloned()
    }

    pub fn address_of(&self, id: &NodeId) -> Option<Address> {
        self.read()
            .iter()
            .find(|n| &n.id == id)
            .map(|n| n.address.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn authorize(&self, token: &str) -> Result<(), CoreError> {
        if self.token.is_empty() || *self.token != *token {
            return Err(CoreError::Unauthorized);
        }
        Ok(())
    }

    async fn persist(&self) -> Option<String> {
        let result = self
            .snapshot
            .save_with(|| NodeSnapshot {
                version: SNAPSHOT_VERSION,
                nodes: self.list(),
            })
            .await;

        match result {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "node registry snapshot write failed; keeping in-memory state");
                Some(e.to_string())
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<NodeRecord>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<NodeRecord>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Trim whitespace and trailing slashes; require an http(s) scheme.
fn normalize_address(raw: &str) -> Result<Address, CoreError> {
    let address = raw.trim().trim_end_matches('/');
    let host = address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"));

    match host {
        Some(host) if !host.is_empty() => Ok(address.to_string()),
        _ => Err(CoreError::InvalidAddress(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "s3cret";

    #[tokio::test]
    async fn register_twice_is_rejected() {
        let reg = NodeRegistry::new(TOKEN);

        let first = reg.register(TOKEN, "http://10.0.0.1:8080").await.unwrap();
        assert!(first.warning.is_none());
        assert_eq!(reg.len(), 1);

        let second = reg.register(TOKEN, "http://10.0.0.1:8080/").await;
        assert!(matches!(second, Err(CoreError::AlreadyRegistered(a)) if a == "http://10.0.0.1:8080"));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn bad_token_is_unauthorized() {
        let reg = NodeRegistry::new(TOKEN);
        let res = reg.register("nope", "http://10.0.0.1:8080").await;
        assert!(matches!(res, Err(CoreError::Unauthorized)));

        let res = reg.unregister("nope", "http://10.0.0.1:8080").await;
        assert!(matches!(res, Err(CoreError::Unauthorized)));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn empty_configured_token_rejects_everyone() {
        let reg = NodeRegistry::new("");
        let res = reg.register("", "http://10.0.0.1:8080").await;
        assert!(matches!(res, Err(CoreError::Unauthorized)));
    }

    #[tokio::test]
    async fn unregister_unknown_leaves_registry_unchanged() {
        let reg = NodeRegistry::new(TOKEN);
        reg.register(TOKEN, "http://10.0.0.1:8080").await.unwrap();
        let before = reg.list();

        let res = reg.unregister(TOKEN, "http://10.0.0.9:8080").await;
        assert!(matches!(res, Err(CoreError::NotRegistered(_))));
        assert_eq!(reg.list(), before);
    }

    #[tokio::test]
    async fn unregister_removes_and_keeps_order() {
        let reg = NodeRegistry::new(TOKEN);
        for i in 1..=3 {
            reg.register(TOKEN, &format!("http://10.0.0.{i}:8080"))
                .await
                .unwrap();
        }
        let removed = reg.unregister(TOKEN, "http://10.0.0.2:8080").await.unwrap();

        let addrs: Vec<_> = reg.list().into_iter().map(|n| n.address).collect();
        assert_eq!(addrs, vec!["http://10.0.0.1:8080", "http://10.0.0.3:8080"]);
        assert!(reg.get(&removed.value.id).is_none());
    }

    #[tokio::test]
    async fn invalid_address_is_rejected() {
        let reg = NodeRegistry::new(TOKEN);
        let res = reg.register(TOKEN, "10.0.0.1:8080").await;
        assert!(matches!(res, Err(CoreError::InvalidAddress(_))));
        let res = reg.register(TOKEN, "http://").await;
        assert!(matches!(res, Err(CoreError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn concurrent_registrations_of_same_address_succeed_once() {
        let reg = NodeRegistry::new(TOKEN);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.register(TOKEN, "http://10.0.0.1:8080").await.is_ok()
            }));
        }

        let mut ok = 0;
        for h in handles {
            if h.await.unwrap() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn seed_skips_known_and_invalid() {
        let reg = NodeRegistry::new(TOKEN);
        reg.register(TOKEN, "http://a:1").await.unwrap();

        let added = reg.seed(["http://a:1", "http://b:1", "garbage"]).await;
        assert_eq!(added.value.len(), 1);
        assert_eq!(added.value[0].address, "http://b:1");
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let reg = NodeRegistry::open(TOKEN, path.clone()).await;
        let rec = reg.register(TOKEN, "http://10.0.0.1:8080").await.unwrap().value;

        let reopened = NodeRegistry::open(TOKEN, path).await;
        assert_eq!(reopened.list(), vec![rec.clone()]);
        assert_eq!(reopened.address_of(&rec.id).as_deref(), Some("http://10.0.0.1:8080"));
    }

    #[tokio::test]
    async fn unreadable_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, b"]]").unwrap();

        let reg = NodeRegistry::open(TOKEN, path).await;
        assert!(reg.is_empty());
    }
}
