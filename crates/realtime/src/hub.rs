use std::sync::Arc;

use tracing::info;

use shared::{
    domain::{ConnectionId, PresenceSnapshot, PresenceStatus, UserId},
    error::ApiException,
    protocol::ServerEvent,
};

use crate::{
    bus::EventBus,
    presence::PresenceTracker,
    registry::{ConnectionRegistry, Outbound},
};

/// Wires the registry, presence tracker and event bus together for the
/// connection lifecycle: the socket layer calls `connect`/`disconnect`,
/// everything else flows out as events.
pub struct RealtimeHub {
    registry: Arc<ConnectionRegistry>,
    presence: PresenceTracker,
    bus: EventBus,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let registry = Arc::new(ConnectionRegistry::default());
        let bus = EventBus::new(Arc::clone(&registry));
        Self {
            registry,
            presence: PresenceTracker::default(),
            bus,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Registers a fresh connection for the user. On an offline→online
    /// transition broadcasts `userOnline` plus the updated roster; a second
    /// device only receives the roster snapshot itself.
    pub fn connect(&self, user_id: UserId, outbound: Outbound) -> Result<ConnectionId, ApiException> {
        let connection_id = ConnectionId::new();
        let outcome = self.registry.register(user_id, connection_id, outbound)?;
        info!(
            user_id = user_id.0,
            connection_id = %connection_id.0,
            came_online = outcome.came_online,
            "connection registered"
        );

        if self
            .presence
            .mark_connected(user_id, outcome.came_online)
            .is_some()
        {
            self.bus.broadcast_all(ServerEvent::UserOnline { user_id });
            self.broadcast_roster();
        } else if let Some(connection) = self.registry.connection(connection_id) {
            connection.push(ServerEvent::GetOnlineUsers {
                user_ids: self.registry.all_online_user_ids(),
            });
        }
        Ok(connection_id)
    }

    /// Tears a connection down. Safe to call twice; the disconnect path of
    /// a socket task must always reach this, even after a failed delivery.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let Some(unregistered) = self.registry.unregister(connection_id) else {
            return;
        };
        info!(
            user_id = unregistered.user_id.0,
            connection_id = %connection_id.0,
            went_offline = unregistered.went_offline,
            "connection unregistered"
        );

        if let Some(change) = self
            .presence
            .mark_disconnected(unregistered.user_id, unregistered.went_offline)
        {
            self.bus.broadcast_all(ServerEvent::UserOffline {
                user_id: change.user_id,
                last_seen_at: change.last_seen_at,
            });
            self.broadcast_roster();
        }
    }

    /// Explicit presence frame from a client: refresh last-seen and let
    /// everyone know.
    pub fn update_presence(&self, user_id: UserId, status: PresenceStatus) {
        let last_seen_at = self.presence.touch(user_id);
        self.bus.broadcast_all(ServerEvent::UserPresenceUpdate {
            user_id,
            status,
            last_seen_at,
        });
    }

    /// Typing indicator relay to the receiver's connections only.
    pub fn typing(&self, sender_id: UserId, receiver_id: UserId, is_typing: bool) {
        self.bus.send_to_user(
            receiver_id,
            ServerEvent::UserTyping {
                sender_id,
                is_typing,
            },
        );
    }

    pub fn presence_of(&self, user_id: UserId) -> PresenceSnapshot {
        let online = self.registry.is_online(user_id);
        let (status, last_seen_at) = self.presence.classify(user_id, online);
        PresenceSnapshot {
            user_id,
            status,
            last_seen_at,
        }
    }

    pub fn online_user_ids(&self) -> Vec<UserId> {
        self.registry.all_online_user_ids()
    }

    fn broadcast_roster(&self) {
        self.bus.broadcast_all(ServerEvent::GetOnlineUsers {
            user_ids: self.registry.all_online_user_ids(),
        });
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
