use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use recon_model::{TaskId, TaskRecord};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::{CoreError, PersistError},
    snapshot::SnapshotFile,
};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct TaskSnapshot {
    version: u32,
    tasks: Vec<TaskRecord>,
}

/// Authoritative in-memory task table with a write-through JSON snapshot.
///
/// Every read-modify-write of a record runs inside one write section, so two
/// reports for the same task can never interleave.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
    snapshot: Arc<SnapshotFile<TaskSnapshot>>,
}

impl TaskStore {
    /// Store without a snapshot.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            snapshot: Arc::new(SnapshotFile::disabled()),
        }
    }

    /// Store backed by a snapshot at `path`.
    ///
    /// An unreadable snapshot is logged and the store starts empty.
    pub async fn open(path: PathBuf) -> Self {
        let snapshot: SnapshotFile<TaskSnapshot> = SnapshotFile::new(path);
        let tasks = match snapshot.load().await {
            Ok(Some(snap)) => {
                info!(tasks = snap.tasks.len(), "task store restored");
                snap.tasks
                    .into_iter()
                    .map(|record| (record.id.clone(), record))
                    .collect()
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "task snapshot unreadable; starting empty");
                HashMap::new()
            }
        };

        Self {
            inner: Arc::new(RwLock::new(tasks)),
            snapshot: Arc::new(snapshot),
        }
    }

    /// Insert a record whose id must be unknown.
    pub fn insert_new(&self, record: TaskRecord) -> Result<(), CoreError> {
        let mut tasks = self.write();
        if tasks.contains_key(&record.id) {
            return Err(CoreError::TaskAlreadyExists(record.id));
        }
        tasks.insert(record.id.clone(), record);
        Ok(())
    }

    /// Insert or overwrite a record, returning the previous one.
    pub fn replace(&self, record: TaskRecord) -> Option<TaskRecord> {
        self.write().insert(record.id.clone(), record)
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.read().get(id).cloned()
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<_> = self.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run `f` on the record under the store's exclusive section.
    pub fn update<R>(
        &self,
        id: &TaskId,
        f: impl FnOnce(&mut TaskRecord) -> R,
    ) -> Result<R, CoreError> {
        let mut tasks = self.write();
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::TaskNotFound(id.clone()))?;
        Ok(f(record))
    }

    /// Rewrite the snapshot with the current state.
    pub async fn persist(&self) -> Result<(), PersistError> {
        self.snapshot
            .save_with(|| TaskSnapshot {
                version: SNAPSHOT_VERSION,
                tasks: self.list(),
            })
            .await
    }

    /// [`TaskStore::persist`], downgrading a failure to a warning string.
    pub async fn persist_advisory(&self) -> Option<String> {
        match self.persist().await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "task snapshot write failed; keeping in-memory state");
                Some(e.to_string())
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use recon_model::{NodeId, NodeTaskStatus, TaskDescriptor, TaskStatus};

    use super::*;

    fn record(id: &str, nodes: &[&str]) -> TaskRecord {
        TaskRecord::new(
            TaskDescriptor::new(TaskId::from(id), "edge", "reconnaissance", "1"),
            nodes.iter().map(|n| (NodeId::from(*n), None)),
            NodeTaskStatus::Created,
        )
    }

    #[test]
    fn insert_new_rejects_known_id() {
        let store = TaskStore::new();
        store.insert_new(record("t1", &["a"])).unwrap();

        let res = store.insert_new(record("t1", &["b"]));
        assert!(matches!(res, Err(CoreError::TaskAlreadyExists(id)) if id.as_str() == "t1"));
        assert!(store.get(&TaskId::from("t1")).unwrap().nodes.contains_key("a"));
    }

    #[test]
    fn replace_returns_previous() {
        let store = TaskStore::new();
        store.insert_new(record("t1", &["a"])).unwrap();
        let prev = store.replace(record("t1", &["b"])).unwrap();

        assert!(prev.nodes.contains_key("a"));
        assert!(store.get(&TaskId::from("t1")).unwrap().nodes.contains_key("b"));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let store = TaskStore::new();
        assert!(store.get(&TaskId::from("ghost")).is_none());
        let res = store.update(&TaskId::from("ghost"), |_| ());
        assert!(matches!(res, Err(CoreError::TaskNotFound(_))));
    }

    #[test]
    fn update_mutates_in_place() {
        let store = TaskStore::new();
        store.insert_new(record("t1", &["a"])).unwrap();

        store
            .update(&TaskId::from("t1"), |rec| {
                let now = SystemTime::now();
                rec.transition(&NodeId::from("a"), NodeTaskStatus::Finished, None, now);
                rec.refresh_status(now)
            })
            .unwrap();

        let rec = store.get(&TaskId::from("t1")).unwrap();
        assert_eq!(rec.status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_keeps_ids_and_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let store = TaskStore::open(path.clone()).await;
        store.insert_new(record("t1", &["a", "b"])).unwrap();
        store.insert_new(record("t2", &["c"])).unwrap();
        store
            .update(&TaskId::from("t1"), |rec| {
                rec.transition(&NodeId::from("b"), NodeTaskStatus::Failed, Some("boom".into()), recon_model::now())
            })
            .unwrap();
        store.persist().await.unwrap();

        let reloaded = TaskStore::open(path).await;
        assert_eq!(reloaded.len(), 2);
        for original in store.list() {
            assert_eq!(reloaded.get(&original.id).unwrap(), original);
        }
        let b = reloaded.get(&TaskId::from("t1")).unwrap().nodes[&NodeId::from("b")].clone();
        assert_eq!(b.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn failed_write_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the snapshot file should be makes the rename fail.
        let path = dir.path().join("tasks.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let store = TaskStore::open(path).await;
        store.insert_new(record("t1", &["a"])).unwrap();

        let warning = store.persist_advisory().await;
        assert!(warning.is_some());
        assert!(store.get(&TaskId::from("t1")).is_some());
    }
}
