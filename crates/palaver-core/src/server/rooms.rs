//! Room membership.
//!
//! Rooms are keyed by the id the [`RoomDirectory`] assigns. Names are
//! resolved once and cached; membership itself lives only in memory and
//! disappears with the last member.

use super::handle::ConnectionHandle;
use crate::error::Result;
use crate::storage::RoomDirectory;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Member {
    name: String,
    handle: Arc<ConnectionHandle>,
}

/// Concurrent room id to membership map, plus the name cache.
pub struct RoomRegistry {
    directory: Arc<dyn RoomDirectory>,
    ids: DashMap<String, i64>,
    rooms: DashMap<i64, DashMap<u64, Member>>,
}

impl RoomRegistry {
    /// Create a registry resolving names through `directory`.
    pub fn new(directory: Arc<dyn RoomDirectory>) -> Self {
        Self {
            directory,
            ids: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Room id for `name`, consulting the directory only on a cache miss.
    pub fn resolve(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.ids.get(name) {
            return Ok(*id);
        }
        let id = self.directory.room_id(name)?;
        self.ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Add a connection to a room. Returns the room id.
    pub fn join(&self, room: &str, user: &str, handle: Arc<ConnectionHandle>) -> Result<i64> {
        let id = self.resolve(room)?;
        let conn_id = handle.id();
        // Insert under the outer entry guard so a concurrent garbage
        // collection of the same room cannot drop this membership.
        self.rooms.entry(id).or_default().insert(
            conn_id,
            Member {
                name: user.to_string(),
                handle,
            },
        );
        debug!(room = %room, room_id = id, user = %user, "Joined room");
        Ok(id)
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub fn leave(&self, room: &str, conn_id: u64) -> Result<bool> {
        let id = self.resolve(room)?;
        Ok(self.leave_id(id, conn_id))
    }

    fn leave_id(&self, id: i64, conn_id: u64) -> bool {
        let removed = match self.rooms.get(&id) {
            Some(members) => members.remove(&conn_id).is_some(),
            None => false,
        };
        if removed {
            self.rooms.remove_if(&id, |_, members| members.is_empty());
        }
        removed
    }

    /// Remove a connection from every room it is in. Returns the room ids.
    pub fn leave_all(&self, conn_id: u64) -> Vec<i64> {
        let ids: Vec<i64> = self
            .rooms
            .iter()
            .filter(|room| room.value().contains_key(&conn_id))
            .map(|room| *room.key())
            .collect();
        ids.into_iter()
            .filter(|&id| self.leave_id(id, conn_id))
            .collect()
    }

    /// Whether a connection is in a room.
    pub fn is_member(&self, room: &str, conn_id: u64) -> Result<bool> {
        let id = self.resolve(room)?;
        Ok(self
            .rooms
            .get(&id)
            .map(|members| members.contains_key(&conn_id))
            .unwrap_or(false))
    }

    /// Sorted member names of a room.
    pub fn members(&self, room: &str) -> Result<Vec<String>> {
        let id = self.resolve(room)?;
        let mut names: Vec<String> = match self.rooms.get(&id) {
            Some(members) => members.iter().map(|m| m.value().name.clone()).collect(),
            None => Vec::new(),
        };
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Snapshot of member connections other than `conn_id`.
    pub fn recipients(&self, room: &str, conn_id: u64) -> Result<Vec<Arc<ConnectionHandle>>> {
        let id = self.resolve(room)?;
        Ok(match self.rooms.get(&id) {
            Some(members) => members
                .iter()
                .filter(|m| *m.key() != conn_id)
                .map(|m| Arc::clone(&m.value().handle))
                .collect(),
            None => Vec::new(),
        })
    }

    /// Number of rooms with at least one member.
    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }
}

impl fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("cached_ids", &self.ids.len())
            .field("active_rooms", &self.rooms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory {
        inner: Database,
        lookups: AtomicUsize,
    }

    impl RoomDirectory for CountingDirectory {
        fn room_id(&self, name: &str) -> Result<i64> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.room_id(name)
        }
    }

    fn handle() -> Arc<ConnectionHandle> {
        let (_client, server) = tokio::io::duplex(64);
        ConnectionHandle::new(server, None)
    }

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_join_and_members() {
        let rooms = registry();
        rooms.join("lobby", "bob", handle()).unwrap();
        rooms.join("lobby", "alice", handle()).unwrap();

        assert_eq!(rooms.members("lobby").unwrap(), vec!["alice", "bob"]);
        assert!(rooms.members("empty").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_room_is_collected() {
        let rooms = registry();
        let alice = handle();
        rooms.join("lobby", "alice", Arc::clone(&alice)).unwrap();
        assert_eq!(rooms.active_rooms(), 1);

        assert!(rooms.leave("lobby", alice.id()).unwrap());
        assert_eq!(rooms.active_rooms(), 0);
        assert!(!rooms.leave("lobby", alice.id()).unwrap());
    }

    #[tokio::test]
    async fn test_leave_all() {
        let rooms = registry();
        let alice = handle();
        let bob = handle();
        rooms.join("a", "alice", Arc::clone(&alice)).unwrap();
        rooms.join("b", "alice", Arc::clone(&alice)).unwrap();
        rooms.join("b", "bob", Arc::clone(&bob)).unwrap();

        assert_eq!(rooms.leave_all(alice.id()).len(), 2);
        assert_eq!(rooms.active_rooms(), 1);
        assert_eq!(rooms.members("b").unwrap(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_recipients_exclude_sender() {
        let rooms = registry();
        let alice = handle();
        let bob = handle();
        rooms.join("lobby", "alice", Arc::clone(&alice)).unwrap();
        rooms.join("lobby", "bob", Arc::clone(&bob)).unwrap();

        let recipients = rooms.recipients("lobby", alice.id()).unwrap();
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].id(), bob.id());
    }

    #[tokio::test]
    async fn test_name_lookup_is_cached() {
        let directory = Arc::new(CountingDirectory {
            inner: Database::open_in_memory().unwrap(),
            lookups: AtomicUsize::new(0),
        });
        let rooms = RoomRegistry::new(Arc::clone(&directory) as Arc<dyn RoomDirectory>);

        let first = rooms.resolve("lobby").unwrap();
        let second = rooms.resolve("lobby").unwrap();
        assert_eq!(first, second);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
    }
}
