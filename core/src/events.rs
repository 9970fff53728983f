//! Event channel vocabulary
//!
//! Every frame on the channel is `{"event": <name>, "data": <payload>}`.
//! Inbound frames are decoded into [`ServerEvent`] before anything is
//! dispatched; unknown event names are ignored and malformed payloads are
//! rejected here.

use crate::error::{Error, Result};
use crate::models::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinDriverRoom { driver_id: String },

    JoinChatRoom(RideId),

    #[serde(rename_all = "camelCase")]
    JoinSupportChat { ticket_id: TicketId },

    #[serde(rename_all = "camelCase")]
    RideAccepted { driver_id: String, ride_id: RideId },

    #[serde(rename_all = "camelCase")]
    RideRejected { driver_id: String, ride_id: RideId },

    #[serde(rename_all = "camelCase")]
    RideArrived { ride_id: RideId },

    #[serde(rename_all = "camelCase")]
    RideStarted { ride_id: RideId },

    #[serde(rename_all = "camelCase")]
    RideCompleted { ride_id: RideId },

    #[serde(rename_all = "camelCase")]
    DriverLocationBroadcast {
        driver_id: String,
        latitude: f64,
        longitude: f64,
    },

    SendMessage(OutgoingMessage),
}

impl ClientEvent {
    /// Event announcing that a ride reached `status`, if the status has one
    pub fn for_status(ride_id: RideId, status: RideStatus) -> Option<ClientEvent> {
        match status {
            RideStatus::Arrived => Some(ClientEvent::RideArrived { ride_id }),
            RideStatus::InProgress => Some(ClientEvent::RideStarted { ride_id }),
            RideStatus::Completed => Some(ClientEvent::RideCompleted { ride_id }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Chat payload emitted on `send_message`; carries the optimistic id so the
/// echo can be matched against the local copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: MessageId,
    pub ride_id: RideId,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewRideRequest(RideOffer),

    #[serde(rename_all = "camelCase")]
    RideCancelled {
        #[serde(alias = "ride_id", alias = "id")]
        ride_id: RideId,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    RideStatusUpdated {
        #[serde(alias = "ride_id", alias = "id")]
        ride_id: RideId,
        status: RideStatus,
    },

    ReceiveMessage(ChatMessage),

    NewSupportMessage(ChatMessage),
}

/// Handler key for [`ServerEvent`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewRideRequest,
    RideCancelled,
    RideStatusUpdated,
    ReceiveMessage,
    NewSupportMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::NewRideRequest,
        EventKind::RideCancelled,
        EventKind::RideStatusUpdated,
        EventKind::ReceiveMessage,
        EventKind::NewSupportMessage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::NewRideRequest => "new_ride_request",
            EventKind::RideCancelled => "ride_cancelled",
            EventKind::RideStatusUpdated => "ride_status_updated",
            EventKind::ReceiveMessage => "receive_message",
            EventKind::NewSupportMessage => "new_support_message",
        }
    }

    pub fn from_name(name: &str) -> Option<EventKind> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::NewRideRequest(_) => EventKind::NewRideRequest,
            ServerEvent::RideCancelled { .. } => EventKind::RideCancelled,
            ServerEvent::RideStatusUpdated { .. } => EventKind::RideStatusUpdated,
            ServerEvent::ReceiveMessage(_) => EventKind::ReceiveMessage,
            ServerEvent::NewSupportMessage(_) => EventKind::NewSupportMessage,
        }
    }

    /// Decode an inbound frame. `Ok(None)` means the event is not one this
    /// client consumes (e.g. the server relaying our own emissions).
    pub fn decode(text: &str) -> Result<Option<ServerEvent>> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| Error::MalformedEvent(e.to_string()))?;

        if EventKind::from_name(&raw.event).is_none() {
            return Ok(None);
        }

        serde_json::from_str(text)
            .map(Some)
            .map_err(|e| Error::MalformedEvent(format!("{}: {}", raw.event, e)))
    }
}
