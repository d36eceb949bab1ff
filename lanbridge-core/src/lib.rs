//! LAN Bridge relay protocol.
//! Host-driven: no I/O; hosts report connection events and frames, and get back what to send.

pub mod envelope;
pub mod hub;
pub mod reconnect;
pub mod session;
pub mod store;
pub mod subscription;

pub use envelope::{now_millis, Envelope, EnvelopeError, EnvelopeKind};
pub use hub::{Admission, OutboundAction, PendingUpload, RelayError, RelayHub};
pub use reconnect::{ConnectionState, ReconnectController, ReconnectPolicy, ReconnectStep};
pub use session::{SessionId, SessionState};
pub use store::{sanitize_file_name, MemoryStore, PayloadStore, StoreWriteError};
pub use subscription::{Handler, SubscriptionId, Subscriptions};
