//! RideSync Core Library
//!
//! Driver-side ride lifecycle synchronization: one event channel per signed-in
//! driver, presence publishing, offer and ride reconciliation, and chat.
//! Provides: networking, reconciliation, storage, and models.

pub mod api;
pub mod chat;
pub mod connection;
pub mod error;
pub mod events;
pub mod models;
pub mod offer;
pub mod presence;
pub mod ride;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

use std::time::Duration;

pub use api::{ApiClient, ChatDraft, DriverApi, PostedMessage};
pub use chat::{ChatHistory, ChatStream};
pub use connection::{Connection, ConnectionState, ReconnectPolicy, Room};
pub use error::*;
pub use events::{ClientEvent, EventKind, OutgoingMessage, ServerEvent};
pub use models::*;
pub use offer::OfferSlot;
pub use presence::{LocationSource, PresencePublisher, StaticLocation};
pub use ride::{AdvanceOutcome, RemoteUpdate, RideTracker};
pub use session::{DriverSession, PresenceStop, SessionNotice};
pub use storage::LocalStorage;
pub use transport::{Transport, WebSocketTransport};

/// Location publish interval while online
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_secs(10);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    pub request_timeout: Duration,
    pub presence_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            request_timeout: Duration::from_secs(30),
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }
}

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
