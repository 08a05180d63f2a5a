use std::sync::Arc;

use dashmap::DashMap;

use talkwire_proto::types::MSG_LOGIN_DUPLICATED;
use talkwire_proto::Frame;

use crate::connection::ConnectionHandle;

/// Outcome of attaching a socket to a user's client slot.
#[derive(Debug)]
pub enum Registration {
    Fresh,
    /// Same socket key re-registered; nothing changed.
    Reused,
    /// A previous socket for this user was displaced and closed.
    Displaced(Arc<ConnectionHandle>),
}

/// Identity-level aggregation: exactly one registered socket per user id on
/// this instance.
#[derive(Default)]
pub struct ClientTable {
    inner: DashMap<String, Arc<ConnectionHandle>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a socket to its user's slot. A duplicate login (different
    /// socket key for the same user) displaces the old socket: it is told
    /// why and closed before the new one is adopted. Re-registration with
    /// the same key is idempotent.
    pub fn register(&self, conn: Arc<ConnectionHandle>) -> Registration {
        use dashmap::mapref::entry::Entry;

        match self.inner.entry(conn.user_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(conn);
                Registration::Fresh
            }
            Entry::Occupied(mut slot) => {
                if slot.get().key == conn.key {
                    return Registration::Reused;
                }
                let old = slot.insert(conn);
                tracing::info!(user_id = %old.user_id, "duplicate login; displacing previous socket");
                old.send_frame(Frame::control(
                    MSG_LOGIN_DUPLICATED,
                    old.user_id.clone(),
                    rmpv::Value::Nil,
                ));
                old.close();
                Registration::Displaced(old)
            }
        }
    }

    /// Detach a socket, but only if it is still the registered one — a
    /// displaced socket unregistering late must not evict its replacement.
    pub fn unregister(&self, user_id: &str, key: &str) -> bool {
        self.inner
            .remove_if(user_id, |_, conn| conn.key == key)
            .is_some()
    }

    pub fn get(&self, user_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.inner.get(user_id).map(|entry| Arc::clone(&entry))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Ask every resident socket to close (shutdown path).
    pub fn close_all(&self) {
        for entry in self.inner.iter() {
            entry.close();
        }
    }
}

/// Sockets subscribed to presence fan-out (`web` and `dashboard` roles),
/// keyed by socket key so one user may watch from several dashboards.
#[derive(Default)]
pub struct DashboardSet {
    inner: DashMap<String, Arc<ConnectionHandle>>,
}

impl DashboardSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<ConnectionHandle>) {
        self.inner.insert(conn.key.clone(), conn);
    }

    pub fn remove(&self, key: &str) {
        self.inner.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn broadcast(&self, frame: &Frame) {
        for entry in self.inner.iter() {
            entry.send_frame(frame.clone());
        }
    }
}
