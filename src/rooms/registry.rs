//! Broadcast groups for live connections.
//!
//! Every connection is a member of its personal group (its username) and of
//! one group per room it participates in. All group state sits behind one
//! lock, so a fan-out never observes a group halfway through a join or leave.
//!
//! Outbound queues are bounded. A connection whose queue is full is dropped
//! from the registry; its socket closes and the client resyncs on reconnect.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::ServerEvent;

pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    Room(Uuid),
    User(String),
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Connection {
    tx: mpsc::Sender<ServerEvent>,
    groups: HashSet<Group>,
}

#[derive(Default)]
struct Groups {
    connections: HashMap<ConnectionId, Connection>,
    members: HashMap<Group, HashSet<ConnectionId>>,
}

impl Groups {
    fn add(&mut self, conn_id: ConnectionId, group: Group) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !conn.groups.insert(group.clone()) {
            return false;
        }
        self.members.entry(group).or_default().insert(conn_id);
        true
    }

    fn remove(&mut self, conn_id: ConnectionId, group: &Group) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !conn.groups.remove(group) {
            return false;
        }
        if let Some(members) = self.members.get_mut(group) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.members.remove(group);
            }
        }
        true
    }

    fn drop_connection(&mut self, conn_id: ConnectionId) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let joined: Vec<Group> = conn.groups.iter().cloned().collect();
        for group in &joined {
            self.remove(conn_id, group);
        }
        self.connections.remove(&conn_id);
    }

    fn user_connections(&self, username: &str) -> Vec<ConnectionId> {
        self.members
            .get(&Group::User(username.to_owned()))
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Shared registry of live connections and the groups they belong to.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Groups>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` bounds each connection's queue of undelivered events.
    pub fn with_capacity(capacity: usize) -> Self {
        Registry {
            inner: Arc::default(),
            next_id: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    // group updates never await, so a poisoned lock still holds consistent state
    fn read(&self) -> RwLockReadGuard<'_, Groups> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Groups> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a connection for `username` and joins its personal group.
    pub fn connect(&self, username: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut groups = self.write();
        groups.connections.insert(
            conn_id,
            Connection { tx, groups: HashSet::new() },
        );
        groups.add(conn_id, Group::User(username.to_owned()));
        (conn_id, rx)
    }

    /// Drops the connection from every group it joined.
    pub fn disconnect(&self, conn_id: ConnectionId) {
        self.write().drop_connection(conn_id);
    }

    fn evict(&self, overflowed: &[ConnectionId]) {
        if overflowed.is_empty() {
            return;
        }
        let mut groups = self.write();
        for conn_id in overflowed {
            tracing::warn!(conn = conn_id, "outbound queue full, dropping connection");
            groups.drop_connection(*conn_id);
        }
    }

    /// Returns false when the connection was already a member.
    pub fn join(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        self.write().add(conn_id, Group::Room(room_id))
    }

    /// Returns false when the connection was not a member.
    pub fn leave(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        self.write().remove(conn_id, &Group::Room(room_id))
    }

    /// Joins every live connection of `username` to the room.
    pub fn join_user(&self, username: &str, room_id: Uuid) {
        let mut groups = self.write();
        let conns = groups.user_connections(username);
        for conn_id in conns {
            groups.add(conn_id, Group::Room(room_id));
        }
    }

    pub fn leave_user(&self, username: &str, room_id: Uuid) {
        let mut groups = self.write();
        let group = Group::Room(room_id);
        let conns = groups.user_connections(username);
        for conn_id in conns {
            groups.remove(conn_id, &group);
        }
    }

    /// Empties the room's group entirely.
    pub fn close_room(&self, room_id: Uuid) {
        let mut groups = self.write();
        let group = Group::Room(room_id);
        let members: Vec<ConnectionId> = groups
            .members
            .get(&group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        for conn_id in members {
            groups.remove(conn_id, &group);
        }
    }

    pub fn is_joined(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        self.read()
            .connections
            .get(&conn_id)
            .is_some_and(|conn| conn.groups.contains(&Group::Room(room_id)))
    }

    pub fn joined_rooms(&self, conn_id: ConnectionId) -> HashSet<Uuid> {
        self.read()
            .connections
            .get(&conn_id)
            .map(|conn| {
                conn.groups
                    .iter()
                    .filter_map(|group| match group {
                        Group::Room(room_id) => Some(*room_id),
                        Group::User(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivers `event` once to every live connection in any of `targets`,
    /// skipping `except`. Returns how many connections received it.
    pub fn fanout(&self, targets: &[Group], event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        {
            let groups = self.read();
            let mut seen = HashSet::new();

            for target in targets {
                let Some(members) = groups.members.get(target) else {
                    continue;
                };
                for conn_id in members {
                    if Some(*conn_id) == except || !seen.insert(*conn_id) {
                        continue;
                    }
                    let Some(conn) = groups.connections.get(conn_id) else {
                        continue;
                    };
                    match conn.tx.try_send(event.clone()) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => overflowed.push(*conn_id),
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
            }
        }

        self.evict(&overflowed);
        tracing::trace!(?targets, delivered, "fanout");
        delivered
    }

    pub fn fanout_room(&self, room_id: Uuid, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        self.fanout(&[Group::Room(room_id)], event, except)
    }

    pub fn fanout_users<S: AsRef<str>>(&self, usernames: &[S], event: &ServerEvent) -> usize {
        let targets: Vec<Group> = usernames
            .iter()
            .map(|username| Group::User(username.as_ref().to_owned()))
            .collect();
        self.fanout(&targets, event, None)
    }

    /// Sends to one connection only.
    pub fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        let sent = match self.read().connections.get(&conn_id) {
            Some(conn) => conn.tx.try_send(event),
            None => return false,
        };
        match sent {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.evict(&[conn_id]);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }
}
