//! WebSocket gateway: the connection registry, the per-connection loop,
//! handshake authentication and cross-instance presence propagation.

pub mod auth;
pub mod connection;
pub mod presence;
pub mod registry;

pub use presence::{PresenceDirectory, PresencePropagator, PresencePublisher};
pub use registry::ConnectionRegistry;
