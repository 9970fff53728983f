//! Driver session: owns the event channel for one signed-in driver and
//! injects it into presence, ride and chat handling.
//!
//! Pushed events and REST results can arrive in any order. Offers follow
//! last-write-wins; for rides a counterpart cancellation always wins and
//! leaves a tombstone so late results for that ride are discarded.

use crate::api::{ApiClient, DriverApi};
use crate::chat::ChatStream;
use crate::connection::{Connection, Room};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventKind, ServerEvent};
use crate::models::*;
use crate::offer::OfferSlot;
use crate::presence::{LocationSource, PresencePublisher};
use crate::ride::{AdvanceOutcome, RemoteUpdate, RideTracker};
use crate::storage::LocalStorage;
use crate::transport::{Transport, WebSocketTransport};
use crate::ClientConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStop {
    /// Location permission was withdrawn while online
    PermissionRevoked,
}

/// Things the driver should see, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    OfferReceived(RideOffer),
    /// The rider cancelled before the offer was accepted
    OfferWithdrawn {
        ride_id: RideId,
        reason: Option<String>,
    },
    /// The active ride was ended by the counterpart
    RideInterrupted {
        ride_id: RideId,
        status: RideStatus,
        reason: Option<String>,
    },
    RideStatusChanged {
        ride_id: RideId,
        status: RideStatus,
    },
    PresenceStopped(PresenceStop),
    /// The token was rejected; the caller should log out
    ReauthRequired,
    ChatMessage {
        channel: ChannelId,
        message: ChatMessage,
    },
}

#[derive(Default)]
struct SyncState {
    offer: OfferSlot,
    ride: RideTracker,
}

struct Shared {
    identity: Identity,
    api: Arc<dyn DriverApi>,
    connection: Connection,
    presence: PresencePublisher,
    state: Mutex<SyncState>,
    chats: Mutex<HashMap<ChannelId, ChatStream>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionNotice>>>,
}

/// A signed-in driver. Created at login, torn down with [`DriverSession::logout`].
#[derive(Clone)]
pub struct DriverSession {
    shared: Arc<Shared>,
}

impl DriverSession {
    /// Start a session against the backend described by `config`
    pub fn open(
        identity: Identity,
        config: &ClientConfig,
        location: Arc<dyn LocationSource>,
    ) -> Result<Self> {
        let api = Arc::new(ApiClient::with_token(config, &identity.token)?);
        Self::start(identity, config, api, WebSocketTransport::new(), location)
    }

    /// Build the connection, register handlers, join the driver room and
    /// connect. Must be called from within a tokio runtime.
    pub fn start(
        identity: Identity,
        config: &ClientConfig,
        api: Arc<dyn DriverApi>,
        transport: impl Transport,
        location: Arc<dyn LocationSource>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(config.ws_url(), config.reconnect.clone(), transport);
        let presence = PresencePublisher::new(
            identity.driver_id.clone(),
            api.clone(),
            connection.clone(),
            location,
            config.presence_interval,
            tx.clone(),
        );

        let shared = Arc::new(Shared {
            identity,
            api,
            connection: connection.clone(),
            presence,
            state: Mutex::new(SyncState::default()),
            chats: Mutex::new(HashMap::new()),
            notices: tx,
            notices_rx: Mutex::new(Some(rx)),
        });

        for kind in EventKind::ALL {
            let weak: Weak<Shared> = Arc::downgrade(&shared);
            connection.on(kind, move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_event(event);
                }
            });
        }

        connection.join_room(Room::Driver(shared.identity.driver_id.clone()));
        connection.connect(&shared.identity)?;
        log::info!("Session started for driver {}", shared.identity.driver_id);

        Ok(Self { shared })
    }

    /// Notice stream; only the first caller gets it
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<SessionNotice>> {
        self.shared.notices_rx.lock().take()
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    pub fn offer(&self) -> Option<RideOffer> {
        self.shared.state.lock().offer.current().cloned()
    }

    pub fn active_ride(&self) -> Option<ActiveRide> {
        self.shared.state.lock().ride.active().cloned()
    }

    pub fn presence(&self) -> DriverPresence {
        self.shared.presence.presence()
    }

    /// Apply a server event as if it came from the channel
    pub fn apply_event(&self, event: ServerEvent) {
        self.shared.apply_event(event);
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Fetch `driver/status` and fold it into local state
    pub async fn refresh(&self) -> Result<DriverSnapshot> {
        let shared = &self.shared;
        let snapshot = shared.observe(shared.api.driver_status().await)?;

        let offered = {
            let mut state = shared.state.lock();
            if state.ride.apply_snapshot(snapshot.active_ride.clone()) {
                log::info!("Restored active ride from snapshot");
            }
            if state.ride.active().is_some() {
                state.offer.clear();
                None
            } else {
                let pending = snapshot
                    .pending_request
                    .clone()
                    .filter(|offer| !state.ride.is_finished(offer.ride_id));
                if state.offer.apply_snapshot(pending.clone()) {
                    pending
                } else {
                    None
                }
            }
        };
        if let Some(offer) = offered {
            shared.notify(SessionNotice::OfferReceived(offer));
        }

        let availability = snapshot.driver.as_ref().map(|driver| driver.status);
        if matches!(
            availability,
            Some(DriverAvailability::Online) | Some(DriverAvailability::Busy)
        ) {
            shared.presence.resume();
        }

        Ok(snapshot)
    }

    // ========================================================================
    // Presence
    // ========================================================================

    pub async fn go_online(&self) -> Result<Coordinates> {
        self.shared.observe(self.shared.presence.go_online().await)
    }

    pub async fn go_offline(&self) -> Result<()> {
        self.shared.observe(self.shared.presence.go_offline().await)
    }

    // ========================================================================
    // Offers
    // ========================================================================

    /// Accept the current offer. A conflict (ride already taken) clears the
    /// offer; a transient failure keeps it so the driver can retry.
    pub async fn accept_offer(&self) -> Result<ActiveRide> {
        let shared = &self.shared;
        let offer = shared
            .state
            .lock()
            .offer
            .current()
            .cloned()
            .ok_or(Error::NoOffer)?;
        let ride_id = offer.ride_id;
        log::info!("Accepting ride {}", ride_id);

        if let Err(e) = shared.api.accept_ride(ride_id).await {
            if e.is_conflict() {
                shared.state.lock().offer.clear_if(ride_id);
                log::warn!("Ride {} is no longer available: {}", ride_id, e);
            }
            return Err(shared.observe_err(e));
        }

        let (ride, displaced) = {
            let mut state = shared.state.lock();
            state.offer.clear_if(ride_id);
            let ride = ActiveRide::from_offer(offer);
            if state.ride.start(ride.clone()) {
                // Offer and active ride never coexist
                (Some(ride), state.offer.clear())
            } else {
                (None, None)
            }
        };
        if let Some(other) = displaced {
            log::info!("Offer {} dropped, ride {} accepted", other.ride_id, ride_id);
            shared.notify(SessionNotice::OfferWithdrawn {
                ride_id: other.ride_id,
                reason: Some(format!("ride {} accepted", ride_id)),
            });
        }
        // Cancelled while the request was in flight
        let ride = ride.ok_or(Error::RideCancelled(ride_id))?;

        let accepted = ClientEvent::RideAccepted {
            driver_id: shared.identity.driver_id.clone(),
            ride_id,
        };
        if let Err(e) = shared.connection.emit(&accepted) {
            log::warn!("Could not announce acceptance of ride {}: {}", ride_id, e);
        }
        Ok(ride)
    }

    /// Decline the current offer. It is cleared locally whatever the backend says.
    pub async fn decline_offer(&self) -> Result<()> {
        let shared = &self.shared;
        let ride_id = shared
            .state
            .lock()
            .offer
            .current()
            .map(|offer| offer.ride_id)
            .ok_or(Error::NoOffer)?;

        let rejected = ClientEvent::RideRejected {
            driver_id: shared.identity.driver_id.clone(),
            ride_id,
        };
        if let Err(e) = shared.connection.emit(&rejected) {
            log::warn!("Could not announce rejection of ride {}: {}", ride_id, e);
        }

        {
            let mut state = shared.state.lock();
            state.offer.clear_if(ride_id);
            state.ride.retire(ride_id);
        }
        log::info!("Declined ride {}", ride_id);

        let result = shared
            .api
            .update_ride_status(ride_id, RideStatus::Rejected)
            .await;
        shared.observe(result)
    }

    // ========================================================================
    // Active ride
    // ========================================================================

    /// Move the active ride to its next status. Fails with
    /// [`Error::RideCancelled`] when the counterpart cancelled the ride while
    /// the update was in flight. If a pushed status got there first, returns
    /// the status the ride is at now.
    pub async fn advance_ride(&self) -> Result<RideStatus> {
        let shared = &self.shared;
        let (ride_id, from, to) = shared.state.lock().ride.begin_advance()?;
        log::info!("Ride {}: {} -> {}", ride_id, from, to);

        let result = shared.api.update_ride_status(ride_id, to).await;
        let outcome = shared
            .state
            .lock()
            .ride
            .finish_advance(ride_id, from, to, result.is_ok());

        match outcome {
            AdvanceOutcome::Applied { status, completed } => {
                if let Some(event) = ClientEvent::for_status(ride_id, status) {
                    if let Err(e) = shared.connection.emit(&event) {
                        log::warn!("Could not announce ride {} {}: {}", ride_id, status, e);
                    }
                }
                shared.notify(SessionNotice::RideStatusChanged { ride_id, status });
                if completed.is_some() {
                    shared.close_chat(&ChannelId::Ride(ride_id));
                }
                Ok(status)
            }
            AdvanceOutcome::Overtaken(status) => {
                log::info!("Ride {} already {} before {} was confirmed", ride_id, status, to);
                Ok(status)
            }
            AdvanceOutcome::Cancelled => {
                log::info!("Ride {} ended before {} was confirmed", ride_id, to);
                Err(Error::RideCancelled(ride_id))
            }
            AdvanceOutcome::Failed => {
                let err = result.err().unwrap_or(Error::NoActiveRide);
                Err(shared.observe_err(err))
            }
        }
    }

    // ========================================================================
    // Chat
    // ========================================================================

    /// Open (or reuse) the stream for `channel` and join its room
    pub fn open_chat(&self, channel: ChannelId) -> ChatStream {
        let shared = &self.shared;
        if let Some(stream) = shared.chats.lock().get(&channel) {
            return stream.clone();
        }

        let receiver = match &channel {
            ChannelId::Ride(ride_id) => shared
                .state
                .lock()
                .ride
                .active()
                .filter(|ride| ride.ride_id == *ride_id)
                .and_then(|ride| ride.rider.as_ref())
                .map(|rider| rider.id.clone()),
            ChannelId::Support(_) => None,
        };

        let stream = shared
            .chats
            .lock()
            .entry(channel.clone())
            .or_insert_with(|| {
                ChatStream::new(
                    channel.clone(),
                    shared.identity.driver_id.clone(),
                    receiver,
                    shared.api.clone(),
                    shared.connection.clone(),
                )
            })
            .clone();
        shared.connection.join_room(Room::for_channel(&channel));
        stream
    }

    pub fn chat(&self, channel: &ChannelId) -> Option<ChatStream> {
        self.shared.chats.lock().get(channel).cloned()
    }

    pub fn close_chat(&self, channel: &ChannelId) {
        self.shared.close_chat(channel);
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop presence, close the channel and forget the stored token
    pub async fn logout(&self, storage: Option<&LocalStorage>) -> Result<()> {
        self.shared.presence.stop();
        self.shared.connection.disconnect().await;
        self.shared.chats.lock().clear();
        if let Some(storage) = storage {
            storage.clear_session()?;
        }
        log::info!("Driver {} logged out", self.shared.identity.driver_id);
        Ok(())
    }
}

impl Shared {
    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            log::trace!("Notice dropped, receiver gone");
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.observe_err(e))
    }

    fn observe_err(&self, err: Error) -> Error {
        if matches!(err, Error::Unauthorized) {
            log::warn!("Backend rejected the session token");
            self.notify(SessionNotice::ReauthRequired);
        }
        err
    }

    fn apply_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewRideRequest(offer) => self.on_offer(offer),
            ServerEvent::RideCancelled { ride_id, reason } => {
                self.interrupt(ride_id, RideStatus::Cancelled, reason)
            }
            ServerEvent::RideStatusUpdated { ride_id, status } if status.is_interruption() => {
                self.interrupt(ride_id, status, None)
            }
            ServerEvent::RideStatusUpdated { ride_id, status } => {
                let update = self.state.lock().ride.merge_remote(ride_id, status);
                match update {
                    RemoteUpdate::Ignored => {
                        log::debug!("Ignoring status {} for ride {}", status, ride_id)
                    }
                    RemoteUpdate::Advanced(status) => {
                        self.notify(SessionNotice::RideStatusChanged { ride_id, status })
                    }
                    RemoteUpdate::Ended(_) => {
                        self.close_chat(&ChannelId::Ride(ride_id));
                        self.notify(SessionNotice::RideStatusChanged { ride_id, status });
                    }
                }
            }
            ServerEvent::ReceiveMessage(message) => self.route_chat(message, false),
            ServerEvent::NewSupportMessage(message) => self.route_chat(message, true),
        }
    }

    fn on_offer(&self, offer: RideOffer) {
        {
            let mut state = self.state.lock();
            if state.ride.is_finished(offer.ride_id) {
                log::debug!("Ignoring offer for finished ride {}", offer.ride_id);
                return;
            }
            if let Some(ride) = state.ride.active() {
                log::debug!(
                    "Ignoring offer {} while ride {} is active",
                    offer.ride_id,
                    ride.ride_id
                );
                return;
            }
            if let Some(previous) = state.offer.apply_push(offer.clone()) {
                if previous.ride_id != offer.ride_id {
                    log::info!("Offer {} replaced by {}", previous.ride_id, offer.ride_id);
                }
            }
        }
        log::info!("New ride offer {}", offer.ride_id);
        self.notify(SessionNotice::OfferReceived(offer));
    }

    /// Counterpart ended `ride_id`: clear offer or ride and tell the driver
    fn interrupt(&self, ride_id: RideId, status: RideStatus, reason: Option<String>) {
        let (offer, ride) = {
            let mut state = self.state.lock();
            (state.offer.clear_if(ride_id), state.ride.cancel(ride_id))
        };

        if ride.is_some() {
            log::info!("Ride {} {} by counterpart", ride_id, status);
            self.close_chat(&ChannelId::Ride(ride_id));
            self.notify(SessionNotice::RideInterrupted {
                ride_id,
                status,
                reason,
            });
        } else if offer.is_some() {
            log::info!("Offer {} withdrawn", ride_id);
            self.notify(SessionNotice::OfferWithdrawn { ride_id, reason });
        } else {
            log::debug!("Cancellation for unknown ride {}", ride_id);
        }
    }

    fn route_chat(&self, message: ChatMessage, support: bool) {
        let channel = message.channel();
        let streams: Vec<ChatStream> = {
            let chats = self.chats.lock();
            match &channel {
                Some(channel) => chats.get(channel).cloned().into_iter().collect(),
                None => chats
                    .values()
                    .filter(|s| matches!(s.channel(), ChannelId::Support(_)) == support)
                    .cloned()
                    .collect(),
            }
        };

        let channel = match channel.or_else(|| streams.first().map(|s| s.channel().clone())) {
            Some(channel) => channel,
            None => {
                log::debug!("Chat message {} has no channel", message.id.0);
                return;
            }
        };

        let mut fresh = streams.is_empty();
        for stream in &streams {
            fresh |= stream.on_incoming(message.clone());
        }
        if fresh {
            self.notify(SessionNotice::ChatMessage { channel, message });
        }
    }

    fn close_chat(&self, channel: &ChannelId) {
        if self.chats.lock().remove(channel).is_some() {
            self.connection.leave_room(&Room::for_channel(channel));
        }
    }
}
