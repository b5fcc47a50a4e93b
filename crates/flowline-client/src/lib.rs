//! Hub client: a local task replica kept in sync over the WebSocket link,
//! with automatic reconnect and full resync after an outage.

pub mod conn;
pub mod supervisor;
pub mod sync;

pub use conn::{
    run, ClientConfig, ClientEvent, HubHandle, PendingRequest, SyncError, SyncHandle,
    DEFAULT_HUB_URL,
};
pub use supervisor::{LinkState, ReconnectSupervisor};
pub use sync::SyncAgent;
