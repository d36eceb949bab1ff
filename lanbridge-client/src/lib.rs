//! LAN Bridge peer client: one WebSocket session to the hub, typed message
//! subscriptions, and automatic reconnection with linear backoff.

pub mod client;
pub mod error;
pub mod file;
pub mod transport;

pub use client::{BridgeClient, ClientConfig, DEFAULT_URL};
pub use error::ClientError;
pub use file::FileHandle;
pub use lanbridge_core::{ConnectionState, Envelope, EnvelopeKind, ReconnectPolicy, SubscriptionId};
