use std::sync::Arc;

use tracing::warn;

use shared::{domain::UserId, protocol::ServerEvent};

use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Fans events out to live connections. Delivery is enqueue-only: a
/// connection whose queue is gone is logged and skipped, never surfaced to
/// the caller. The registry is the source of truth and a dead connection
/// cleans itself up through its own disconnect path.
pub struct EventBus {
    registry: Arc<ConnectionRegistry>,
}

impl EventBus {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Delivers to every connection the user holds at call time.
    /// Connections registered afterwards do not see this event.
    pub fn send_to_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        self.deliver(self.registry.connections_for(user_id), event)
    }

    /// Delivers to every registered connection across all users.
    pub fn broadcast_all(&self, event: ServerEvent) -> usize {
        self.deliver(self.registry.all_connections(), event)
    }

    fn deliver(&self, connections: Vec<ConnectionHandle>, event: ServerEvent) -> usize {
        let mut delivered = 0;
        for connection in &connections {
            if connection.push(event.clone()) {
                delivered += 1;
            } else {
                warn!(
                    connection_id = %connection.connection_id.0,
                    user_id = connection.user_id.0,
                    "dropping event for unreachable connection"
                );
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::ConnectionId;
    use tokio::sync::mpsc;

    fn event(n: i64) -> ServerEvent {
        ServerEvent::UserOnline { user_id: UserId(n) }
    }

    fn tag_of(event: &ServerEvent) -> i64 {
        match event {
            ServerEvent::UserOnline { user_id } => user_id.0,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn delivers_to_every_connection_present_at_call_time() {
        let registry = Arc::new(ConnectionRegistry::default());
        let bus = EventBus::new(Arc::clone(&registry));
        let user = UserId(1);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry
            .register(user, ConnectionId::new(), tx_a)
            .expect("register");
        registry
            .register(user, ConnectionId::new(), tx_b)
            .expect("register");

        assert_eq!(bus.send_to_user(user, event(42)), 2);
        assert_eq!(tag_of(&rx_a.try_recv().expect("delivered")), 42);
        assert_eq!(tag_of(&rx_b.try_recv().expect("delivered")), 42);

        // a connection registered after the send must not see the event
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        registry
            .register(user, ConnectionId::new(), tx_c)
            .expect("register");
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn delivery_is_fifo_per_connection() {
        let registry = Arc::new(ConnectionRegistry::default());
        let bus = EventBus::new(Arc::clone(&registry));
        let user = UserId(2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register(user, ConnectionId::new(), tx)
            .expect("register");

        for n in 0..10 {
            bus.send_to_user(user, event(n));
        }
        for n in 0..10 {
            assert_eq!(tag_of(&rx.try_recv().expect("delivered")), n);
        }
    }

    #[test]
    fn dead_connections_are_skipped_without_error() {
        let registry = Arc::new(ConnectionRegistry::default());
        let bus = EventBus::new(Arc::clone(&registry));
        let user = UserId(3);

        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        registry
            .register(user, ConnectionId::new(), tx_dead)
            .expect("register");
        registry
            .register(user, ConnectionId::new(), tx_live)
            .expect("register");
        drop(rx_dead);

        assert_eq!(bus.send_to_user(user, event(7)), 1);
        assert_eq!(tag_of(&rx_live.try_recv().expect("delivered")), 7);
    }

    #[test]
    fn broadcast_reaches_all_users() {
        let registry = Arc::new(ConnectionRegistry::default());
        let bus = EventBus::new(Arc::clone(&registry));

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry
            .register(UserId(1), ConnectionId::new(), tx_a)
            .expect("register");
        registry
            .register(UserId(2), ConnectionId::new(), tx_b)
            .expect("register");

        assert_eq!(bus.broadcast_all(event(9)), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
