use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use shared::{
    domain::{ConnectionId, UserId},
    error::{ApiException, ErrorCode},
    protocol::ServerEvent,
};

/// Outbound half of a connection's event queue. One per live socket,
/// drained by exactly one writer task, which is what makes delivery FIFO
/// per connection.
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Snapshot handle to one live connection, cloned out of the registry so
/// delivery never happens under the registry lock.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    outbound: Outbound,
}

impl ConnectionHandle {
    /// Enqueues without blocking. Returns false when the receiving task is
    /// gone; the caller decides whether that matters.
    pub fn push(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// True when this was the user's first live connection.
    pub came_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistered {
    pub user_id: UserId,
    /// True when the user's last connection just went away.
    pub went_offline: bool,
}

/// Bidirectional map of logical users to their live connections. Supports
/// multiple connections per user (multi-device). Purely in-memory; all
/// mutations are atomic under one lock that is never held across I/O.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Idempotent add. Reports whether the user transitioned offline→online
    /// so the caller can emit exactly one presence event per transition.
    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        outbound: Outbound,
    ) -> Result<RegisterOutcome, ApiException> {
        if user_id.0 <= 0 {
            return Err(ApiException::new(
                ErrorCode::InvalidHandshake,
                "connection handshake carried no valid user id",
            ));
        }

        let mut state = self.lock();
        if let Some(existing) = state.by_connection.get(&connection_id) {
            if existing.user_id == user_id {
                return Ok(RegisterOutcome { came_online: false });
            }
            // A connection id belongs to exactly one user; detach the stale
            // owner before re-adding.
            detach(&mut state, connection_id);
        }

        let came_online = !state.by_user.contains_key(&user_id);
        state
            .by_user
            .entry(user_id)
            .or_default()
            .insert(connection_id);
        state.by_connection.insert(
            connection_id,
            ConnectionHandle {
                connection_id,
                user_id,
                connected_at: Utc::now(),
                outbound,
            },
        );
        Ok(RegisterOutcome { came_online })
    }

    /// Removes the mapping whoever owned it. Unknown ids are a no-op so a
    /// double disconnect cannot fail.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Unregistered> {
        let mut state = self.lock();
        let handle = state.by_connection.remove(&connection_id)?;
        let went_offline = match state.by_user.get_mut(&handle.user_id) {
            Some(connections) => {
                connections.remove(&connection_id);
                if connections.is_empty() {
                    state.by_user.remove(&handle.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some(Unregistered {
            user_id: handle.user_id,
            went_offline,
        })
    }

    pub fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.lock().by_connection.get(&connection_id).cloned()
    }

    /// Snapshot of the user's live connections at call time.
    pub fn connections_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        let state = self.lock();
        match state.by_user.get(&user_id) {
            Some(connections) => connections
                .iter()
                .filter_map(|id| state.by_connection.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.lock().by_connection.values().cloned().collect()
    }

    /// Users with at least one live connection.
    pub fn all_online_user_ids(&self) -> Vec<UserId> {
        self.lock().by_user.keys().copied().collect()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.lock().by_user.contains_key(&user_id)
    }
}

fn detach(state: &mut RegistryState, connection_id: ConnectionId) {
    if let Some(handle) = state.by_connection.remove(&connection_id) {
        if let Some(connections) = state.by_user.get_mut(&handle.user_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                state.by_user.remove(&handle.user_id);
            }
        }
    }
}
