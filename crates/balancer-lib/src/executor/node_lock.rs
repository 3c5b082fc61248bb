//! Per-node exclusive locks for migrations
//!
//! A migration holds the lock of its source and of its destination for its
//! whole duration, so two migrations that share a node never overlap. Pairs
//! are always acquired in node-id order, which rules out lock-order
//! deadlocks between concurrent moves.

use crate::models::NodeId;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<DashMap<NodeId, Weak<Mutex<()>>>>;

/// Process-wide set of node locks, cheap to clone
///
/// Entries are held weakly and dropped once no migration references them.
#[derive(Debug, Clone, Default)]
pub struct NodeLocks {
    locks: LockMap,
}

/// Exclusive hold on one or two nodes, released on drop
pub struct NodeLockGuard {
    held: Vec<(NodeId, Arc<Mutex<()>>, Option<OwnedMutexGuard<()>>)>,
    locks: LockMap,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock both nodes of a move, smallest id first
    pub async fn lock_pair(&self, source: &str, destination: &str) -> NodeLockGuard {
        let mut ids = [source, destination];
        ids.sort_unstable();

        let mut guard = NodeLockGuard {
            held: Vec::with_capacity(2),
            locks: Arc::clone(&self.locks),
        };
        for (i, id) in ids.iter().enumerate() {
            if i == 1 && ids[0] == ids[1] {
                break;
            }
            let lock = self.get_or_create(id);
            let owned = Arc::clone(&lock).lock_owned().await;
            guard.held.push((id.to_string(), lock, Some(owned)));
        }
        guard
    }

    /// Whether some migration currently holds `node`
    pub fn is_locked(&self, node: &str) -> bool {
        self.locks
            .get(node)
            .and_then(|weak| weak.upgrade())
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    fn get_or_create(&self, node: &str) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(node.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    if let Some(strong) = occupied.get().upgrade() {
                        return strong;
                    }
                    occupied.remove();
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let strong = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for NodeLockGuard {
    fn drop(&mut self) {
        // Release in reverse acquisition order
        while let Some((id, lock, owned)) = self.held.pop() {
            drop(owned);
            // Checked under the shard lock so no concurrent upgrade slips in
            self.locks.remove_if(&id, |_, _| Arc::strong_count(&lock) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_pair_is_acquired_in_id_order() {
        let locks = NodeLocks::new();
        let guard = locks.lock_pair("pve3", "pve1").await;
        let held: Vec<_> = guard.held.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(held, vec!["pve1", "pve3"]);
        assert!(locks.is_locked("pve1"));
        assert!(locks.is_locked("pve3"));
        assert!(!locks.is_locked("pve2"));
    }

    #[tokio::test]
    async fn test_released_and_cleaned_up_on_drop() {
        let locks = NodeLocks::new();
        {
            let _guard = locks.lock_pair("pve1", "pve2").await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
        assert!(!locks.is_locked("pve1"));
    }

    #[tokio::test]
    async fn test_moves_sharing_a_node_serialize() {
        let locks = NodeLocks::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        // All pairs share pve1, in both orientations
        let pairs = [("pve1", "pve2"), ("pve3", "pve1"), ("pve1", "pve4"), ("pve5", "pve1")];
        let mut handles = Vec::new();
        for (src, dst) in pairs {
            let locks = locks.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock_pair(src, dst).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_disjoint_moves_run_concurrently() {
        let locks = NodeLocks::new();
        let first = locks.lock_pair("pve1", "pve2").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock_pair("pve3", "pve4")).await;
        assert!(second.is_ok());
        drop(first);
    }
}
