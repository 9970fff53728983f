//! Error types for RideSync Core

use crate::models::{RideId, RideStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Session expired or invalid, sign in again")]
    Unauthorized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not connected to the event channel")]
    NotConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("No pending ride offer")]
    NoOffer,

    #[error("No active ride")]
    NoActiveRide,

    #[error("Ride {ride_id} cannot advance from {status}")]
    InvalidTransition { ride_id: RideId, status: RideStatus },

    #[error("A status update for ride {0} is already in flight")]
    UpdateInFlight(RideId),

    #[error("Ride {0} was cancelled")]
    RideCancelled(RideId),

    #[error("Message is empty")]
    EmptyMessage,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a non-success HTTP status to an error
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Error::Unauthorized,
            409 => Error::Conflict(message),
            _ => Error::Http { status, message },
        }
    }

    /// Failures that may succeed when the caller retries
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::WebSocket(_) | Error::NotConnected => true,
            Error::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The server rejected the request because of ride state; retrying is meaningless
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Http { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Error::from_status(status.as_u16(), e.to_string()),
            None => Error::Network(e.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}
