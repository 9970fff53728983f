//! Data models for RideSync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(pub i64);

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chat message id. Optimistic messages use the client clock in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// A chat channel: the ride chat or a support ticket thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Ride(RideId),
    Support(TicketId),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Ride(id) => write!(f, "ride:{}", id),
            ChannelId::Support(id) => write!(f, "support:{}", id),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Signed-in driver. The token is attached to every request and to the event channel.
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    pub token: String,
    pub driver_id: String,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(token: impl Into<String>, driver_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            driver_id: driver_id.into(),
            display_name: None,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("driver_id", &self.driver_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Location & Presence
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverAvailability {
    Online,
    Offline,
    Busy,
}

impl DriverAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverAvailability::Online => "online",
            DriverAvailability::Offline => "offline",
            DriverAvailability::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverPresence {
    pub online: bool,
    pub last_location: Option<Coordinates>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Rides
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    #[serde(alias = "pending")]
    Requested,
    Accepted,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
    Rejected,
}

impl RideStatus {
    /// Next status in the driver-driven lifecycle
    pub fn next(self) -> Option<RideStatus> {
        match self {
            RideStatus::Accepted => Some(RideStatus::Arrived),
            RideStatus::Arrived => Some(RideStatus::InProgress),
            RideStatus::InProgress => Some(RideStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RideStatus::Completed | RideStatus::Cancelled | RideStatus::Rejected
        )
    }

    /// Counterpart-initiated end of a ride or offer
    pub fn is_interruption(self) -> bool {
        matches!(self, RideStatus::Cancelled | RideStatus::Rejected)
    }

    /// Position in the linear lifecycle; `None` for statuses off the main path
    pub fn lifecycle_rank(self) -> Option<u8> {
        match self {
            RideStatus::Requested => Some(0),
            RideStatus::Accepted => Some(1),
            RideStatus::Arrived => Some(2),
            RideStatus::InProgress => Some(3),
            RideStatus::Completed => Some(4),
            RideStatus::Cancelled | RideStatus::Rejected => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Accepted => "accepted",
            RideStatus::Arrived => "arrived",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
            RideStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rider on the other side of a ride
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counterpart {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "phoneNumber")]
    pub phone: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// A ride proposal pushed to the driver. The backend mixes snake_case and
/// camelCase spellings, both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideOffer {
    #[serde(rename = "id", alias = "rideId", alias = "ride_id")]
    pub ride_id: RideId,
    #[serde(default, alias = "originAddress")]
    pub origin_address: Option<String>,
    #[serde(default, alias = "destinationAddress")]
    pub destination_address: Option<String>,
    #[serde(default, alias = "originLatitude")]
    pub origin_latitude: Option<f64>,
    #[serde(default, alias = "originLongitude")]
    pub origin_longitude: Option<f64>,
    #[serde(default, alias = "destinationLatitude")]
    pub destination_latitude: Option<f64>,
    #[serde(default, alias = "destinationLongitude")]
    pub destination_longitude: Option<f64>,
    #[serde(default, rename = "fare_price", alias = "farePrice")]
    pub fare_estimate: Option<f64>,
    #[serde(default, rename = "distance", alias = "rideDistanceKm")]
    pub distance_km: Option<f64>,
    #[serde(default, rename = "ride_time", alias = "rideTime")]
    pub duration_min: Option<f64>,
    #[serde(default)]
    pub rider: Option<Counterpart>,
}

impl RideOffer {
    pub fn new(ride_id: RideId) -> Self {
        Self {
            ride_id,
            origin_address: None,
            destination_address: None,
            origin_latitude: None,
            origin_longitude: None,
            destination_latitude: None,
            destination_longitude: None,
            fare_estimate: None,
            distance_km: None,
            duration_min: None,
            rider: None,
        }
    }

    pub fn origin(&self) -> Option<Coordinates> {
        Some(Coordinates::new(self.origin_latitude?, self.origin_longitude?))
    }

    pub fn destination(&self) -> Option<Coordinates> {
        Some(Coordinates::new(
            self.destination_latitude?,
            self.destination_longitude?,
        ))
    }
}

/// An accepted ride being driven through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRide {
    #[serde(rename = "id", alias = "rideId", alias = "ride_id")]
    pub ride_id: RideId,
    pub status: RideStatus,
    #[serde(default)]
    pub rider: Option<Counterpart>,
    #[serde(default, alias = "originAddress")]
    pub origin_address: Option<String>,
    #[serde(default, alias = "destinationAddress")]
    pub destination_address: Option<String>,
}

impl ActiveRide {
    /// Ride created by accepting an offer
    pub fn from_offer(offer: RideOffer) -> Self {
        Self {
            ride_id: offer.ride_id,
            status: RideStatus::Accepted,
            rider: offer.rider,
            origin_address: offer.origin_address,
            destination_address: offer.destination_address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    #[serde(default)]
    pub id: Option<String>,
    pub status: DriverAvailability,
}

/// `GET driver/status`: profile plus pending and active ride state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverSnapshot {
    #[serde(default)]
    pub driver: Option<DriverProfile>,
    #[serde(default, rename = "pendingRequest", alias = "pending_request")]
    pub pending_request: Option<RideOffer>,
    #[serde(default, rename = "activeRide", alias = "active_ride")]
    pub active_ride: Option<ActiveRide>,
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Delivered
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<RideId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    /// Local delivery state, never sent over the wire
    #[serde(skip)]
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Channel this message belongs to, when the payload names one
    pub fn channel(&self) -> Option<ChannelId> {
        match (&self.ride_id, &self.ticket_id) {
            (Some(ride_id), _) => Some(ChannelId::Ride(*ride_id)),
            (None, Some(ticket_id)) => Some(ChannelId::Support(ticket_id.clone())),
            (None, None) => None,
        }
    }

    /// Same message seen through a different path (optimistic copy vs echo)
    pub fn is_same_as(&self, other: &ChatMessage) -> bool {
        self.id == other.id
            || (self.created_at == other.created_at && self.content == other.content)
    }
}
