pub mod bus;
pub mod hub;
pub mod presence;
pub mod registry;

pub use bus::EventBus;
pub use hub::RealtimeHub;
pub use presence::{PresenceChange, PresenceTracker};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound, RegisterOutcome, Unregistered};
