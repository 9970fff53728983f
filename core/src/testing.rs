//! Test doubles shared by the unit tests: an in-memory transport, a scripted
//! REST backend and a scripted location source.

use crate::api::{ChatDraft, DriverApi, PostedMessage};
use crate::error::{Error, Result};
use crate::events::ServerEvent;
use crate::models::*;
use crate::presence::LocationSource;
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Poll `condition` until it holds; panics after two seconds
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PeerLog {
    Connected,
    Sent(String),
}

#[derive(Default)]
struct PeerState {
    log: Vec<PeerLog>,
    connects: usize,
    attempts: usize,
    failing_connects: usize,
    inbound: Option<mpsc::UnboundedSender<Option<String>>>,
    on_connect: Vec<String>,
}

/// Server side of a [`MemoryTransport`]
#[derive(Clone, Default)]
pub struct MemoryPeer {
    state: Arc<Mutex<PeerState>>,
}

pub struct MemoryTransport {
    state: Arc<Mutex<PeerState>>,
    inbound: Option<mpsc::UnboundedReceiver<Option<String>>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let peer = MemoryPeer::default();
        let transport = MemoryTransport {
            state: peer.state.clone(),
            inbound: None,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, _url: &str, _token: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(Error::WebSocket("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for frame in state.on_connect.drain(..) {
            let _ = tx.send(Some(frame));
        }
        state.inbound = Some(tx);
        state.connects += 1;
        state.log.push(PeerLog::Connected);
        self.inbound = Some(rx);
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<()> {
        if self.inbound.is_none() {
            return Err(Error::NotConnected);
        }
        self.state.lock().log.push(PeerLog::Sent(frame));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let inbound = self.inbound.as_mut().ok_or(Error::NotConnected)?;
        Ok(inbound.recv().await.flatten())
    }

    async fn close(&mut self) -> Result<()> {
        self.inbound = None;
        Ok(())
    }
}

impl MemoryPeer {
    pub fn push(&self, event: &ServerEvent) {
        self.push_raw(serde_json::to_string(event).unwrap());
    }

    pub fn push_raw(&self, frame: String) {
        if let Some(tx) = self.state.lock().inbound.as_ref() {
            let _ = tx.send(Some(frame));
        }
    }

    /// Deliver `event` first thing on the next connection
    pub fn queue_on_connect(&self, event: &ServerEvent) {
        self.state
            .lock()
            .on_connect
            .push(serde_json::to_string(event).unwrap());
    }

    /// Simulate the server hanging up
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.lock().inbound.take() {
            let _ = tx.send(None);
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().failing_connects = count;
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn log(&self) -> Vec<PeerLog> {
        self.state.lock().log.clone()
    }

    pub fn sent_events(&self) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|entry| match entry {
                PeerLog::Sent(frame) => serde_json::from_str(frame).ok(),
                PeerLog::Connected => None,
            })
            .collect()
    }

    pub fn sent_named(&self, name: &str) -> Vec<serde_json::Value> {
        self.sent_events()
            .into_iter()
            .filter(|event| event["event"] == name)
            .collect()
    }
}

// ============================================================================
// Scripted REST backend
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    DriverStatus,
    UpdateDriverStatus(DriverAvailability, Coordinates),
    UpdateLocation(Coordinates),
    AcceptRide(RideId),
    UpdateRideStatus(RideId, RideStatus),
    ChatHistory(ChannelId),
    PostChat(ChannelId, String),
}

#[derive(Default)]
pub struct ScriptedApi {
    calls: Mutex<Vec<ApiCall>>,
    pub snapshot: Mutex<DriverSnapshot>,
    pub history: Mutex<Vec<ChatMessage>>,
    pub posted: Mutex<PostedMessage>,
    failures: Mutex<Vec<(&'static str, Error)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    /// Make the next call to `endpoint` fail with `error`
    pub fn fail_next(&self, endpoint: &'static str, error: Error) {
        self.failures.lock().push((endpoint, error));
    }

    /// Hold ride calls (accept/update-status) until [`ScriptedApi::release`]
    pub fn hold_ride_calls(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    fn record(&self, endpoint: &'static str, call: ApiCall) -> Result<()> {
        self.calls.lock().push(call);
        self.take_failure(endpoint)
    }

    fn take_failure(&self, endpoint: &'static str) -> Result<()> {
        let mut failures = self.failures.lock();
        match failures.iter().position(|(name, _)| *name == endpoint) {
            Some(index) => Err(failures.remove(index).1),
            None => Ok(()),
        }
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl DriverApi for ScriptedApi {
    async fn driver_status(&self) -> Result<DriverSnapshot> {
        self.record("driver_status", ApiCall::DriverStatus)?;
        Ok(self.snapshot.lock().clone())
    }

    async fn update_driver_status(&self, status: DriverAvailability, at: Coordinates) -> Result<()> {
        self.record("update_driver_status", ApiCall::UpdateDriverStatus(status, at))
    }

    async fn update_location(&self, at: Coordinates) -> Result<()> {
        self.record("update_location", ApiCall::UpdateLocation(at))
    }

    async fn accept_ride(&self, ride_id: RideId) -> Result<()> {
        self.calls.lock().push(ApiCall::AcceptRide(ride_id));
        self.wait_gate().await;
        self.take_failure("accept_ride")
    }

    async fn update_ride_status(&self, ride_id: RideId, status: RideStatus) -> Result<()> {
        self.calls.lock().push(ApiCall::UpdateRideStatus(ride_id, status));
        self.wait_gate().await;
        self.take_failure("update_ride_status")
    }

    async fn chat_history(&self, channel: &ChannelId) -> Result<Vec<ChatMessage>> {
        self.record("chat_history", ApiCall::ChatHistory(channel.clone()))?;
        Ok(self.history.lock().clone())
    }

    async fn post_chat_message(&self, channel: &ChannelId, draft: &ChatDraft) -> Result<PostedMessage> {
        self.record(
            "post_chat_message",
            ApiCall::PostChat(channel.clone(), draft.content.clone()),
        )?;
        Ok(std::mem::take(&mut *self.posted.lock()))
    }
}

// ============================================================================
// Scripted location
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fix {
    At(Coordinates),
    Unavailable,
    Denied,
}

pub struct ScriptedLocation {
    fix: Mutex<Fix>,
    reads: AtomicUsize,
}

impl ScriptedLocation {
    pub fn at(latitude: f64, longitude: f64) -> Arc<Self> {
        Arc::new(Self {
            fix: Mutex::new(Fix::At(Coordinates::new(latitude, longitude))),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, fix: Fix) {
        *self.fix.lock() = fix;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationSource for ScriptedLocation {
    async fn current_position(&self) -> Result<Coordinates> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match *self.fix.lock() {
            Fix::At(at) => Ok(at),
            Fix::Unavailable => Err(Error::LocationUnavailable("no GPS fix".to_string())),
            Fix::Denied => Err(Error::PermissionDenied),
        }
    }
}
