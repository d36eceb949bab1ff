//! LAN Bridge hub daemon: WebSocket accept loop, hub task, filesystem payload store.

pub mod config;
pub mod server;
pub mod store;

pub use config::{Config, ConfigError};
pub use server::{run_hub, serve, serve_incoming, HubEvent};
pub use store::FsPayloadStore;
