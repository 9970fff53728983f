//! Presence publisher: periodic driver location while online

use crate::api::DriverApi;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::models::{Coordinates, DriverAvailability, DriverPresence};
use crate::session::{PresenceStop, SessionNotice};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Device position provider
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Current fix. `Err(Error::PermissionDenied)` once permission is gone;
    /// any other error is treated as a missed reading.
    async fn current_position(&self) -> Result<Coordinates>;
}

/// Fixed position, for headless drivers and simulators
pub struct StaticLocation(pub Coordinates);

#[async_trait]
impl LocationSource for StaticLocation {
    async fn current_position(&self) -> Result<Coordinates> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tick {
    Sent(Coordinates),
    Skipped,
    PermissionRevoked,
}

struct Shared {
    driver_id: String,
    api: Arc<dyn DriverApi>,
    connection: Connection,
    location: Arc<dyn LocationSource>,
    state: Mutex<DriverPresence>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

pub struct PresencePublisher {
    shared: Arc<Shared>,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PresencePublisher {
    pub fn new(
        driver_id: impl Into<String>,
        api: Arc<dyn DriverApi>,
        connection: Connection,
        location: Arc<dyn LocationSource>,
        interval: Duration,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver_id: driver_id.into(),
                api,
                connection,
                location,
                state: Mutex::new(DriverPresence::default()),
                notices,
            }),
            interval,
            ticker: Mutex::new(None),
        }
    }

    pub fn presence(&self) -> DriverPresence {
        self.shared.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Go online: needs a fresh fix and the backend's confirmation before
    /// the publisher starts.
    pub async fn go_online(&self) -> Result<Coordinates> {
        let fix = self.shared.location.current_position().await?;
        self.shared.state.lock().last_location = Some(fix);

        self.shared
            .api
            .update_driver_status(DriverAvailability::Online, fix)
            .await?;

        self.shared.state.lock().online = true;
        self.start();
        log::info!("Driver {} online", self.shared.driver_id);
        Ok(fix)
    }

    /// Go offline. Ticks stop before the backend is told.
    pub async fn go_offline(&self) -> Result<()> {
        self.stop();
        let last_location = self.shared.state.lock().last_location;
        log::info!("Driver {} offline", self.shared.driver_id);

        let at = last_location
            .ok_or_else(|| Error::LocationUnavailable("no location fix yet".to_string()))?;
        self.shared
            .api
            .update_driver_status(DriverAvailability::Offline, at)
            .await
    }

    /// Resume publishing for a driver the backend already reports as online
    pub fn resume(&self) {
        self.shared.state.lock().online = true;
        self.start();
    }

    fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        *ticker = Some(tokio::spawn(run(self.shared.clone(), self.interval)));
    }

    /// Cancel the ticker. A tick already past its location read publishes
    /// nothing once this returns.
    pub fn stop(&self) {
        self.shared.state.lock().online = false;
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
            log::debug!("Presence ticker stopped");
        }
    }
}

impl Drop for PresencePublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; going online already sent a fix
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if shared.publish_once().await == Tick::PermissionRevoked {
            shared.state.lock().online = false;
            log::warn!("Location permission revoked, driver {} is unavailable", shared.driver_id);
            let _ = shared
                .notices
                .send(SessionNotice::PresenceStopped(PresenceStop::PermissionRevoked));
            break;
        }
    }
}

impl Shared {
    async fn publish_once(&self) -> Tick {
        let fix = match self.location.current_position().await {
            Ok(fix) => fix,
            Err(Error::PermissionDenied) => return Tick::PermissionRevoked,
            Err(e) => {
                log::warn!("Skipping presence tick: {}", e);
                return Tick::Skipped;
            }
        };

        // Held until both sends are issued so `stop` cannot interleave
        let mut state = self.state.lock();
        if !state.online {
            return Tick::Skipped;
        }
        state.last_location = Some(fix);
        state.last_sent_at = Some(Utc::now());

        // Fire-and-forget; presence pings never surface errors
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.update_location(fix).await {
                log::warn!("Location update failed: {}", e);
            }
        });

        let broadcast = ClientEvent::DriverLocationBroadcast {
            driver_id: self.driver_id.clone(),
            latitude: fix.latitude,
            longitude: fix.longitude,
        };
        if let Err(e) = self.connection.emit(&broadcast) {
            log::debug!("Location broadcast skipped: {}", e);
        }

        Tick::Sent(fix)
    }
}
