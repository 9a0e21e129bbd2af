//! Live chat connections grouped by user, with presence edges.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::connection::Connection;
use crate::error::HubError;

/// Outcome of admitting a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The user had no live connections: they just came online.
    FirstForUser,
    Additional,
}

/// Outcome of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// That was the user's last connection: they just went offline.
    LastForUser,
    Remaining,
    /// Already removed, or drained by shutdown.
    Unknown,
}

struct RegistryState {
    /// user_id → (conn_id → connection)
    users: HashMap<String, HashMap<String, Arc<Connection>>>,
    total: usize,
    accepting: bool,
}

/// Per-user connection sets behind one lock.
///
/// Every mutation happens under the same mutex, so presence edges are
/// observed exactly once however connects and disconnects interleave. No
/// I/O happens while the lock is held; callers act on the returned
/// [`Admission`]/[`Removal`] afterwards.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                users: HashMap::new(),
                total: 0,
                accepting: true,
            }),
            max_connections,
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) -> Result<Admission, HubError> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(HubError::ShuttingDown);
        }
        if state.total >= self.max_connections {
            return Err(HubError::AtCapacity);
        }

        let conns = state.users.entry(conn.user_id().to_string()).or_default();
        let first = conns.is_empty();
        if conns.insert(conn.id().to_string(), conn).is_none() {
            state.total += 1;
        }

        Ok(if first {
            Admission::FirstForUser
        } else {
            Admission::Additional
        })
    }

    pub fn remove(&self, conn: &Connection) -> Removal {
        let mut state = self.state.lock();
        let Some(conns) = state.users.get_mut(conn.user_id()) else {
            return Removal::Unknown;
        };
        if conns.remove(conn.id()).is_none() {
            return Removal::Unknown;
        }

        let last = conns.is_empty();
        if last {
            state.users.remove(conn.user_id());
        }
        state.total -= 1;

        if last {
            Removal::LastForUser
        } else {
            Removal::Remaining
        }
    }

    /// Stop admitting and hand back every connection, leaving the registry
    /// empty.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut state = self.state.lock();
        state.accepting = false;
        state.total = 0;
        std::mem::take(&mut state.users)
            .into_values()
            .flat_map(HashMap::into_values)
            .collect()
    }

    /// Live connections of every listed user; unknown users are skipped.
    pub fn connections_for<'a, I>(&self, user_ids: I) -> Vec<Arc<Connection>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for user_id in user_ids {
            if !seen.insert(user_id) {
                continue;
            }
            if let Some(conns) = state.users.get(user_id) {
                out.extend(conns.values().cloned());
            }
        }
        out
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.state.lock().users.contains_key(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.state.lock().users.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn len(&self) -> usize {
        self.state.lock().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
