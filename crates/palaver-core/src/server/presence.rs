//! Who is online, and where to reach them.

use super::handle::ConnectionHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Username to live connection, at most one entry per name.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<String, Arc<ConnectionHandle>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` unless someone already holds it.
    pub fn try_register(&self, name: &str, handle: Arc<ConnectionHandle>) -> bool {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Remove `name` only if it is still held by connection `conn_id`.
    ///
    /// A late cleanup from an old session must not evict a newer one that
    /// reused the name.
    pub fn unregister(&self, name: &str, conn_id: u64) -> bool {
        self.entries
            .remove_if(name, |_, handle| handle.id() == conn_id)
            .is_some()
    }

    /// Connection currently registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<ConnectionHandle>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `name` is online.
    pub fn is_online(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Sorted list of online usernames.
    pub fn online_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of every connection except `conn_id`.
    ///
    /// Callers write to the snapshot after the map guards are released.
    pub fn others(&self, conn_id: u64) -> Vec<Arc<ConnectionHandle>> {
        self.entries
            .iter()
            .filter(|e| e.value().id() != conn_id)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Number of online users.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody is online.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<ConnectionHandle> {
        let (_client, server) = tokio::io::duplex(64);
        ConnectionHandle::new(server, None)
    }

    #[tokio::test]
    async fn test_insert_if_absent() {
        let presence = PresenceRegistry::new();
        let first = handle();
        let second = handle();

        assert!(presence.try_register("alice", Arc::clone(&first)));
        assert!(!presence.try_register("alice", second));
        assert_eq!(presence.lookup("alice").unwrap().id(), first.id());
        assert_eq!(presence.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cleanup_keeps_new_session() {
        let presence = PresenceRegistry::new();
        let old = handle();
        let new = handle();

        assert!(presence.try_register("alice", Arc::clone(&old)));
        assert!(presence.unregister("alice", old.id()));
        assert!(presence.try_register("alice", Arc::clone(&new)));

        // The old session's cleanup runs late.
        assert!(!presence.unregister("alice", old.id()));
        assert_eq!(presence.lookup("alice").unwrap().id(), new.id());
    }

    #[tokio::test]
    async fn test_online_names_sorted_and_others() {
        let presence = PresenceRegistry::new();
        let carol = handle();
        presence.try_register("carol", Arc::clone(&carol));
        presence.try_register("alice", handle());
        presence.try_register("bob", handle());

        assert_eq!(presence.online_names(), vec!["alice", "bob", "carol"]);

        let others = presence.others(carol.id());
        assert_eq!(others.len(), 2);
        assert!(others.iter().all(|h| h.id() != carol.id()));
    }
}
