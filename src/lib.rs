//! Relay that verifies vendor webhooks and fans them out to the WebSocket
//! clients subscribed to the event's `session_id`, across relay instances.

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod server;
pub mod signature;
pub mod webhook;

pub use config::Config;
pub use registry::{ChannelRegistry, Connection, ConnectionId, EventFormat};
pub use webhook::{DeliveryGate, WebhookEvent, WebhookHandler};
