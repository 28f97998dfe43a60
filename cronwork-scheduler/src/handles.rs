use std::collections::HashMap;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// In-memory record for one active task: the control-level cancellation
/// token, the tick delivery channel, and one cancellation token per
/// currently-running instance in admission order (oldest first).
pub struct Handle {
    pub control: CancellationToken,
    pub tick_tx: mpsc::Sender<DateTime<Local>>,
    instances: Vec<(Uuid, CancellationToken)>,
}

impl Handle {
    pub fn new(control: CancellationToken, tick_tx: mpsc::Sender<DateTime<Local>>) -> Self {
        Self {
            control,
            tick_tx,
            instances: Vec::new(),
        }
    }
}

/// The single shared mutable structure of the scheduler. Structural
/// mutation (insert, remove, admit, pop, kill) takes the exclusive lock;
/// firing a control token or reading ids takes the shared lock.
#[derive(Default)]
pub struct HandleTable {
    inner: RwLock<HashMap<String, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handle. Refused when the id is already active, since a
    /// task may never hold two handles.
    pub async fn insert(&self, id: &str, handle: Handle) -> bool {
        let mut guard = self.inner.write().await;
        if guard.contains_key(id) {
            return false;
        }
        guard.insert(id.to_string(), handle);
        true
    }

    pub async fn remove(&self, id: &str) -> Option<Handle> {
        self.inner.write().await.remove(id)
    }

    /// The atomic admission gate. When the task is at `max_concurrent`
    /// the oldest instance token is fired and dropped, then the new one
    /// is appended — all in one lock acquisition, so two concurrent
    /// ticks can never both see room. Returns false when the id has no
    /// handle (the task is being torn down).
    pub async fn admit(
        &self,
        id: &str,
        instance: Uuid,
        cancel: CancellationToken,
        max_concurrent: usize,
    ) -> bool {
        let mut guard = self.inner.write().await;
        let Some(handle) = guard.get_mut(id) else {
            return false;
        };
        if handle.instances.len() >= max_concurrent.max(1) {
            let (_, oldest) = handle.instances.remove(0);
            oldest.cancel();
        }
        handle.instances.push((instance, cancel));
        true
    }

    /// Drop one instance's token on completion.
    pub async fn pop_instance(&self, id: &str, instance: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(handle) = guard.get_mut(id) {
            handle.instances.retain(|(existing, _)| *existing != instance);
        }
    }

    /// Fire every instance token, then clear the list. The control token
    /// is untouched, so the task's driver keeps running. Returns how
    /// many instances were told to die.
    pub async fn kill_instances(&self, id: &str) -> usize {
        let mut guard = self.inner.write().await;
        let Some(handle) = guard.get_mut(id) else {
            return 0;
        };
        for (_, cancel) in &handle.instances {
            cancel.cancel();
        }
        let killed = handle.instances.len();
        handle.instances.clear();
        killed
    }

    /// Fire a task's control token. Returns false when the id is not
    /// active.
    pub async fn cancel_control(&self, id: &str) -> bool {
        let guard = self.inner.read().await;
        match guard.get(id) {
            Some(handle) => {
                handle.control.cancel();
                true
            }
            None => false,
        }
    }

    /// Deliver a clock instant to every active task. Sends block until
    /// each driver has drained its previous tick; the lock is held for
    /// the whole fan-out so a tick is never interleaved with structural
    /// mutation. Closed channels belong to tasks mid-teardown and are
    /// skipped.
    pub async fn broadcast(&self, now: DateTime<Local>) {
        let guard = self.inner.write().await;
        for handle in guard.values() {
            let _ = handle.tick_tx.send(now).await;
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn instance_count(&self, id: &str) -> Option<usize> {
        self.inner
            .read()
            .await
            .get(id)
            .map(|handle| handle.instances.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (Handle, mpsc::Receiver<DateTime<Local>>) {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        (Handle::new(CancellationToken::new(), tick_tx), tick_rx)
    }

    #[tokio::test]
    async fn insert_refuses_duplicates() {
        let table = HandleTable::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        assert!(table.insert("a", first).await);
        assert!(!table.insert("a", second).await);
        assert_eq!(table.active_ids().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn admit_evicts_the_oldest_at_capacity() {
        let table = HandleTable::new();
        let (h, _rx) = handle();
        table.insert("a", h).await;

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let third = CancellationToken::new();
        assert!(table.admit("a", Uuid::new_v4(), first.clone(), 2).await);
        assert!(table.admit("a", Uuid::new_v4(), second.clone(), 2).await);
        assert_eq!(table.instance_count("a").await, Some(2));

        assert!(table.admit("a", Uuid::new_v4(), third.clone(), 2).await);
        assert_eq!(table.instance_count("a").await, Some(2));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!third.is_cancelled());
    }

    #[tokio::test]
    async fn admit_fails_without_a_handle() {
        let table = HandleTable::new();
        assert!(!table.admit("ghost", Uuid::new_v4(), CancellationToken::new(), 1).await);
    }

    #[tokio::test]
    async fn pop_removes_only_the_named_instance() {
        let table = HandleTable::new();
        let (h, _rx) = handle();
        table.insert("a", h).await;

        let keep = Uuid::new_v4();
        let drop_me = Uuid::new_v4();
        table.admit("a", keep, CancellationToken::new(), 4).await;
        table.admit("a", drop_me, CancellationToken::new(), 4).await;

        table.pop_instance("a", drop_me).await;
        assert_eq!(table.instance_count("a").await, Some(1));
    }

    #[tokio::test]
    async fn kill_fires_every_instance_and_is_idempotent() {
        let table = HandleTable::new();
        let (h, _rx) = handle();
        let control = h.control.clone();
        table.insert("a", h).await;

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        table.admit("a", Uuid::new_v4(), first.clone(), 4).await;
        table.admit("a", Uuid::new_v4(), second.clone(), 4).await;

        assert_eq!(table.kill_instances("a").await, 2);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!control.is_cancelled());

        // A second kill finds nothing left to do.
        assert_eq!(table.kill_instances("a").await, 0);
        assert_eq!(table.instance_count("a").await, Some(0));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_active_task() {
        let table = HandleTable::new();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        table.insert("a", h1).await;
        table.insert("b", h2).await;

        let now = Local::now();
        table.broadcast(now).await;
        assert_eq!(rx1.recv().await.map(|t| t.timestamp()), Some(now.timestamp()));
        assert_eq!(rx2.recv().await.map(|t| t.timestamp()), Some(now.timestamp()));
    }
}
