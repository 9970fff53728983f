//! Event channel connection manager
//!
//! One [`Connection`] exists per signed-in driver. A supervisor task owns the
//! transport and:
//! - reconnects with exponential backoff after any failure
//! - re-joins every room on each successful (re)connect, before reading
//!   the first inbound frame
//! - dispatches decoded events to handlers keyed by [`EventKind`]
//!
//! Nothing is queued while the channel is down: [`Connection::emit`] fails
//! with [`Error::NotConnected`] and frames left unsent by a dropped
//! connection are discarded.

use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventKind, ServerEvent};
use crate::models::{ChannelId, Identity, RideId, TicketId};
use crate::transport::Transport;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// Configuration & State
// ============================================================================

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay before retry number `attempt` (1-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Backoff plus up to 50% random jitter, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempt >= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Logical subscription group on the event channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Driver(String),
    RideChat(RideId),
    SupportTicket(TicketId),
}

impl Room {
    pub fn for_channel(channel: &ChannelId) -> Room {
        match channel {
            ChannelId::Ride(ride_id) => Room::RideChat(*ride_id),
            ChannelId::Support(ticket_id) => Room::SupportTicket(ticket_id.clone()),
        }
    }

    pub fn join_event(&self) -> ClientEvent {
        match self {
            Room::Driver(driver_id) => ClientEvent::JoinDriverRoom {
                driver_id: driver_id.clone(),
            },
            Room::RideChat(ride_id) => ClientEvent::JoinChatRoom(*ride_id),
            Room::SupportTicket(ticket_id) => ClientEvent::JoinSupportChat {
                ticket_id: ticket_id.clone(),
            },
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Driver(id) => write!(f, "driver_{}", id),
            Room::RideChat(id) => write!(f, "ride_{}", id),
            Room::SupportTicket(id) => write!(f, "ticket_{}", id),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(ServerEvent) + Send + Sync>;

// ============================================================================
// Connection
// ============================================================================

struct Inner {
    url: String,
    policy: ReconnectPolicy,
    rooms: Mutex<Vec<Room>>,
    handlers: Mutex<HashMap<EventKind, EventHandler>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: watch::Sender<ConnectionState>,
    /// Parked here while no supervisor is running
    transport: Mutex<Option<Box<dyn Transport>>>,
    supervisor: Mutex<Option<Supervisor>>,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Shared handle to the event channel; clones refer to the same connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, transport: impl Transport) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                policy,
                rooms: Mutex::new(Vec::new()),
                handlers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                state,
                transport: Mutex::new(Some(Box::new(transport))),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Start the connection for `identity`. Returns immediately; progress is
    /// visible through [`Connection::state`]. Calling it while a supervisor is
    /// already running is a no-op.
    pub fn connect(&self, identity: &Identity) -> Result<()> {
        let mut supervisor = self.inner.supervisor.lock();
        if let Some(running) = supervisor.as_ref() {
            if !running.task.is_finished() {
                log::debug!("Event channel already started");
                return Ok(());
            }
        }
        *supervisor = None;

        let transport = self
            .inner
            .transport
            .lock()
            .take()
            .ok_or_else(|| Error::WebSocket("transport is still in use".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            self.inner.clone(),
            transport,
            identity.token.clone(),
            rx,
            shutdown_rx,
        ));

        *supervisor = Some(Supervisor { shutdown, task });
        Ok(())
    }

    /// Stop the supervisor and close the channel. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let supervisor = self.inner.supervisor.lock().take();
        *self.inner.outbound.lock() = None;

        if let Some(supervisor) = supervisor {
            supervisor.shutdown.send_replace(true);
            if let Err(e) = supervisor.task.await {
                log::error!("Event channel task ended abnormally: {}", e);
            }
            log::info!("Event channel disconnected");
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the channel is connected
    pub async fn wait_until_connected(&self) -> Result<()> {
        let mut rx = self.subscribe_state();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Connected {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(Error::NotConnected);
            }
        }
    }

    /// Subscribe to a room. Rooms are additive and re-joined on every reconnect.
    pub fn join_room(&self, room: Room) {
        {
            let mut rooms = self.inner.rooms.lock();
            if rooms.contains(&room) {
                return;
            }
            rooms.push(room.clone());
        }
        log::debug!("Joining room {}", room);

        // Queued even mid-reconnect: the supervisor either drains it before
        // its own re-join pass or flushes it right after.
        if let Ok(frame) = room.join_event().encode() {
            if let Some(tx) = self.inner.outbound.lock().as_ref() {
                let _ = tx.send(frame);
            }
        }
    }

    /// Stop re-joining a room; other memberships are untouched
    pub fn leave_room(&self, room: &Room) {
        self.inner.rooms.lock().retain(|r| r != room);
        log::debug!("Left room {}", room);
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.inner.rooms.lock().clone()
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        if self
            .inner
            .handlers
            .lock()
            .insert(kind, Arc::new(handler))
            .is_some()
        {
            log::debug!("Replaced handler for {}", kind.name());
        }
    }

    pub fn off(&self, kind: EventKind) {
        self.inner.handlers.lock().remove(&kind);
    }

    /// Send an event now. Fails when the channel is down; nothing is queued.
    pub fn emit(&self, event: &ClientEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let frame = event.encode()?;
        let outbound = self.inner.outbound.lock();
        let tx = outbound.as_ref().ok_or(Error::NotConnected)?;
        tx.send(frame).map_err(|_| Error::NotConnected)
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn dispatch(&self, text: &str) {
        let event = match ServerEvent::decode(text) {
            Ok(Some(event)) => event,
            Ok(None) => {
                log::trace!("Ignoring unhandled frame: {}", text);
                return;
            }
            Err(e) => {
                log::warn!("Dropping frame: {}", e);
                return;
            }
        };

        let kind = event.kind();
        let handler = self.handlers.lock().get(&kind).cloned();
        match handler {
            Some(handler) => handler(event),
            None => log::debug!("No handler registered for {}", kind.name()),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

enum Step {
    Shutdown,
    Outbound(Option<String>),
    Inbound(Result<Option<String>>),
}

async fn run(
    inner: Arc<Inner>,
    mut transport: Box<dyn Transport>,
    token: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    'session: loop {
        if *shutdown.borrow() {
            break;
        }

        inner.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt }
        });

        let connected = tokio::select! {
            _ = shutdown.changed() => break 'session,
            result = transport.connect(&inner.url, &token) => result,
        };

        let ready = match connected {
            Ok(()) => rejoin(&inner, transport.as_mut(), &mut outbound).await,
            Err(e) => Err(e),
        };

        if let Err(e) = ready {
            attempt += 1;
            log::warn!("Event channel connect failed (attempt {}): {}", attempt, e);
            let _ = transport.close().await;
            if inner.policy.exhausted(attempt) {
                log::error!("Event channel giving up after {} attempts", attempt);
                break;
            }
            if !backoff(&inner.policy, attempt, &mut shutdown).await {
                break;
            }
            continue;
        }

        attempt = 0;
        inner.set_state(ConnectionState::Connected);
        log::info!("Event channel connected to {}", inner.url);

        loop {
            let step = tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                frame = outbound.recv() => Step::Outbound(frame),
                incoming = transport.recv() => Step::Inbound(incoming),
            };

            match step {
                Step::Shutdown | Step::Outbound(None) => {
                    let _ = transport.close().await;
                    break 'session;
                }
                Step::Outbound(Some(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        log::warn!("Event channel send failed: {}", e);
                        break;
                    }
                }
                Step::Inbound(Ok(Some(text))) => inner.dispatch(&text),
                Step::Inbound(Ok(None)) => {
                    log::info!("Event channel closed by server");
                    break;
                }
                Step::Inbound(Err(e)) => {
                    log::warn!("Event channel error: {}", e);
                    break;
                }
            }
        }

        // Connection dropped: stop accepting emits before backing off
        attempt = 1;
        inner.set_state(ConnectionState::Reconnecting { attempt });
        let _ = transport.close().await;
        if !backoff(&inner.policy, attempt, &mut shutdown).await {
            break;
        }
    }

    *inner.transport.lock() = Some(transport);
    inner.set_state(ConnectionState::Disconnected);
}

/// Discard frames left over from the previous connection, then join every room
async fn rejoin(
    inner: &Inner,
    transport: &mut dyn Transport,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let mut stale = 0;
    while outbound.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        log::debug!("Discarded {} frames queued before reconnect", stale);
    }

    let rooms = inner.rooms.lock().clone();
    for room in &rooms {
        transport.send(room.join_event().encode()?).await?;
    }
    log::debug!("Joined {} rooms", rooms.len());
    Ok(())
}

/// Sleep before the next attempt; `false` when shutdown was requested meanwhile
async fn backoff(
    policy: &ReconnectPolicy,
    attempt: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let delay = policy.delay_for(attempt);
    log::debug!("Reconnecting in {:?}", delay);
    tokio::select! {
        _ = tokio::time::sleep(delay) => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}
