//! Active ride state machine
//!
//! `accepted → arrived → in_progress → completed`, one step at a time. Rides
//! that end (completed or cancelled) leave a tombstone so late events and late
//! REST results for them are ignored.

use crate::error::{Error, Result};
use crate::models::{ActiveRide, RideId, RideStatus};
use std::collections::VecDeque;

const TOMBSTONES: usize = 32;

/// Result of a finished `advance` request
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Local status moved to `status`; `completed` carries the ride it cleared
    Applied {
        status: RideStatus,
        completed: Option<ActiveRide>,
    },
    /// The counterpart ended the ride while the request was in flight
    Cancelled,
    /// A pushed status already reached or passed the target; carries the
    /// status the ride is at now (`completed` once it has ended)
    Overtaken(RideStatus),
    /// Request failed; local status unchanged
    Failed,
}

/// Result of merging a server-pushed status
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteUpdate {
    Ignored,
    Advanced(RideStatus),
    Ended(ActiveRide),
}

#[derive(Debug, Default)]
pub struct RideTracker {
    active: Option<ActiveRide>,
    in_flight: Option<RideId>,
    /// Ended rides and how they ended, oldest first
    finished: VecDeque<(RideId, RideStatus)>,
}

impl RideTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&ActiveRide> {
        self.active.as_ref()
    }

    pub fn is_finished(&self, ride_id: RideId) -> bool {
        self.ended_as(ride_id).is_some()
    }

    /// Terminal status of a ride that already ended
    pub fn ended_as(&self, ride_id: RideId) -> Option<RideStatus> {
        self.finished
            .iter()
            .find(|(id, _)| *id == ride_id)
            .map(|(_, status)| *status)
    }

    pub fn advance_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Track a newly accepted ride. Refused for rides that already ended.
    pub fn start(&mut self, ride: ActiveRide) -> bool {
        if self.is_finished(ride.ride_id) {
            return false;
        }
        self.in_flight = None;
        self.active = Some(ride);
        true
    }

    /// Active ride from a snapshot. A missing ride never clears local state.
    pub fn apply_snapshot(&mut self, ride: Option<ActiveRide>) -> bool {
        let ride = match ride {
            Some(ride) if !ride.status.is_terminal() && !self.is_finished(ride.ride_id) => ride,
            _ => return false,
        };

        match self.active.as_mut() {
            None => {
                self.active = Some(ride);
                true
            }
            Some(current) if current.ride_id == ride.ride_id => {
                if rank(ride.status) > rank(current.status) {
                    current.status = ride.status;
                    true
                } else {
                    false
                }
            }
            Some(current) => {
                log::warn!(
                    "Snapshot reports ride {} while ride {} is active; keeping local",
                    ride.ride_id,
                    current.ride_id
                );
                false
            }
        }
    }

    /// Reserve the next transition. Returns `(ride, from, to)`.
    pub fn begin_advance(&mut self) -> Result<(RideId, RideStatus, RideStatus)> {
        let ride = self.active.as_ref().ok_or(Error::NoActiveRide)?;
        if let Some(ride_id) = self.in_flight {
            return Err(Error::UpdateInFlight(ride_id));
        }
        let to = ride.status.next().ok_or(Error::InvalidTransition {
            ride_id: ride.ride_id,
            status: ride.status,
        })?;

        self.in_flight = Some(ride.ride_id);
        Ok((ride.ride_id, ride.status, to))
    }

    pub fn finish_advance(
        &mut self,
        ride_id: RideId,
        from: RideStatus,
        to: RideStatus,
        succeeded: bool,
    ) -> AdvanceOutcome {
        if self.in_flight == Some(ride_id) {
            self.in_flight = None;
        }

        let current = match self.active.as_ref() {
            Some(ride) if ride.ride_id == ride_id => ride.status,
            _ => {
                return match self.ended_as(ride_id) {
                    Some(RideStatus::Completed) => AdvanceOutcome::Overtaken(RideStatus::Completed),
                    _ => AdvanceOutcome::Cancelled,
                }
            }
        };
        if rank(current) > rank(to) || (!succeeded && current == to) {
            return AdvanceOutcome::Overtaken(current);
        }
        if !succeeded {
            return AdvanceOutcome::Failed;
        }
        debug_assert!(current == from || current == to);

        if to == RideStatus::Completed {
            let mut ride = self.clear(ride_id, RideStatus::Completed);
            if let Some(ride) = ride.as_mut() {
                ride.status = RideStatus::Completed;
            }
            return AdvanceOutcome::Applied {
                status: to,
                completed: ride,
            };
        }

        if let Some(ride) = self.active.as_mut() {
            ride.status = to;
        }
        AdvanceOutcome::Applied {
            status: to,
            completed: None,
        }
    }

    /// Merge a pushed lifecycle status: forward only. Interruptions go
    /// through [`RideTracker::cancel`].
    pub fn merge_remote(&mut self, ride_id: RideId, status: RideStatus) -> RemoteUpdate {
        if self.is_finished(ride_id) || status.is_interruption() {
            return RemoteUpdate::Ignored;
        }
        let current = match self.active.as_ref() {
            Some(ride) if ride.ride_id == ride_id => ride.status,
            _ => return RemoteUpdate::Ignored,
        };
        if rank(status) <= rank(current) {
            return RemoteUpdate::Ignored;
        }

        if status == RideStatus::Completed {
            return match self.clear(ride_id, RideStatus::Completed) {
                Some(mut ride) => {
                    ride.status = RideStatus::Completed;
                    RemoteUpdate::Ended(ride)
                }
                None => RemoteUpdate::Ignored,
            };
        }

        if let Some(ride) = self.active.as_mut() {
            ride.status = status;
        }
        RemoteUpdate::Advanced(status)
    }

    /// Counterpart ended the ride. Always tombstones `ride_id`, even when it
    /// is not the active ride (it may still be an offer or an in-flight accept).
    pub fn cancel(&mut self, ride_id: RideId) -> Option<ActiveRide> {
        self.clear(ride_id, RideStatus::Cancelled)
    }

    /// Forget a ride without it being active (declined offers)
    pub fn retire(&mut self, ride_id: RideId) {
        self.tombstone(ride_id, RideStatus::Rejected);
    }

    fn clear(&mut self, ride_id: RideId, end: RideStatus) -> Option<ActiveRide> {
        if self.in_flight == Some(ride_id) {
            self.in_flight = None;
        }
        let ride = match self.active.as_ref() {
            Some(ride) if ride.ride_id == ride_id => self.active.take(),
            _ => None,
        };
        self.tombstone(ride_id, end);
        ride
    }

    fn tombstone(&mut self, ride_id: RideId, end: RideStatus) {
        if self.is_finished(ride_id) {
            return;
        }
        if self.finished.len() == TOMBSTONES {
            self.finished.pop_front();
        }
        self.finished.push_back((ride_id, end));
    }
}

fn rank(status: RideStatus) -> u8 {
    status.lifecycle_rank().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RideOffer;

    fn tracker_with(ride_id: i64) -> RideTracker {
        let mut tracker = RideTracker::new();
        assert!(tracker.start(ActiveRide::from_offer(RideOffer::new(RideId(ride_id)))));
        tracker
    }

    fn advance(tracker: &mut RideTracker) -> AdvanceOutcome {
        let (ride_id, from, to) = tracker.begin_advance().unwrap();
        tracker.finish_advance(ride_id, from, to, true)
    }

    #[test]
    fn test_advance_never_skips() {
        let mut tracker = tracker_with(1);
        let mut seen = vec![tracker.active().unwrap().status];

        loop {
            match advance(&mut tracker) {
                AdvanceOutcome::Applied { status, completed } => {
                    seen.push(status);
                    if let Some(ride) = completed {
                        assert_eq!(ride.status, RideStatus::Completed);
                        break;
                    }
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(
            seen,
            vec![
                RideStatus::Accepted,
                RideStatus::Arrived,
                RideStatus::InProgress,
                RideStatus::Completed
            ]
        );
        assert!(tracker.active().is_none());
        assert!(tracker.is_finished(RideId(1)));
        assert!(matches!(tracker.begin_advance(), Err(Error::NoActiveRide)));
    }

    #[test]
    fn test_single_advance_in_flight() {
        let mut tracker = tracker_with(1);
        let (ride_id, from, to) = tracker.begin_advance().unwrap();
        assert!(matches!(
            tracker.begin_advance(),
            Err(Error::UpdateInFlight(RideId(1)))
        ));

        assert_eq!(
            tracker.finish_advance(ride_id, from, to, false),
            AdvanceOutcome::Failed
        );
        assert_eq!(tracker.active().unwrap().status, RideStatus::Accepted);
        assert!(!tracker.advance_in_flight());
        assert!(tracker.begin_advance().is_ok());
    }

    #[test]
    fn test_cancel_wins_over_in_flight_advance() {
        let mut tracker = tracker_with(1);
        let (ride_id, from, to) = tracker.begin_advance().unwrap();

        let cancelled = tracker.cancel(RideId(1));
        assert_eq!(cancelled.map(|r| r.ride_id), Some(RideId(1)));

        assert_eq!(
            tracker.finish_advance(ride_id, from, to, true),
            AdvanceOutcome::Cancelled
        );
        assert_eq!(tracker.ended_as(RideId(1)), Some(RideStatus::Cancelled));
        assert!(tracker.active().is_none());
        assert!(!tracker.start(ActiveRide::from_offer(RideOffer::new(RideId(1)))));
    }

    #[test]
    fn test_remote_merges_forward_only() {
        let mut tracker = tracker_with(1);
        assert_eq!(
            tracker.merge_remote(RideId(1), RideStatus::InProgress),
            RemoteUpdate::Advanced(RideStatus::InProgress)
        );
        assert_eq!(
            tracker.merge_remote(RideId(1), RideStatus::Arrived),
            RemoteUpdate::Ignored
        );
        assert_eq!(
            tracker.merge_remote(RideId(2), RideStatus::Completed),
            RemoteUpdate::Ignored
        );
        assert_eq!(tracker.active().unwrap().status, RideStatus::InProgress);
    }

    #[test]
    fn test_completed_then_arrived_is_noop() {
        let mut tracker = tracker_with(1);
        assert!(matches!(
            tracker.merge_remote(RideId(1), RideStatus::Completed),
            RemoteUpdate::Ended(_)
        ));
        assert_eq!(
            tracker.merge_remote(RideId(1), RideStatus::Arrived),
            RemoteUpdate::Ignored
        );
        assert!(tracker.active().is_none());

        // A stale snapshot cannot resurrect it either
        let mut stale = ActiveRide::from_offer(RideOffer::new(RideId(1)));
        stale.status = RideStatus::Arrived;
        assert!(!tracker.apply_snapshot(Some(stale)));
        assert!(tracker.active().is_none());
    }

    #[test]
    fn test_remote_echo_during_advance() {
        let mut tracker = tracker_with(1);
        let (ride_id, from, to) = tracker.begin_advance().unwrap();
        assert_eq!(
            tracker.merge_remote(RideId(1), RideStatus::Arrived),
            RemoteUpdate::Advanced(RideStatus::Arrived)
        );
        assert_eq!(
            tracker.finish_advance(ride_id, from, to, true),
            AdvanceOutcome::Applied {
                status: RideStatus::Arrived,
                completed: None
            }
        );
    }

    #[test]
    fn test_remote_status_overtakes_in_flight_advance() {
        let mut tracker = tracker_with(1);
        let (ride_id, from, to) = tracker.begin_advance().unwrap();
        assert_eq!(
            tracker.merge_remote(RideId(1), RideStatus::InProgress),
            RemoteUpdate::Advanced(RideStatus::InProgress)
        );

        assert_eq!(
            tracker.finish_advance(ride_id, from, to, true),
            AdvanceOutcome::Overtaken(RideStatus::InProgress)
        );
        assert_eq!(tracker.active().unwrap().status, RideStatus::InProgress);
        assert!(!tracker.advance_in_flight());
    }

    #[test]
    fn test_remote_completion_overtakes_in_flight_advance() {
        let mut tracker = tracker_with(1);
        let (ride_id, from, to) = tracker.begin_advance().unwrap();
        assert!(matches!(
            tracker.merge_remote(RideId(1), RideStatus::Completed),
            RemoteUpdate::Ended(_)
        ));

        // Same answer whether the late request succeeded or not
        assert_eq!(
            tracker.finish_advance(ride_id, from, to, false),
            AdvanceOutcome::Overtaken(RideStatus::Completed)
        );
        assert_eq!(tracker.ended_as(RideId(1)), Some(RideStatus::Completed));
    }

    #[test]
    fn test_snapshot_never_clears_or_regresses() {
        let mut tracker = tracker_with(1);
        advance(&mut tracker);

        assert!(!tracker.apply_snapshot(None));
        let mut behind = ActiveRide::from_offer(RideOffer::new(RideId(1)));
        behind.status = RideStatus::Accepted;
        assert!(!tracker.apply_snapshot(Some(behind)));
        assert_eq!(tracker.active().unwrap().status, RideStatus::Arrived);

        let mut empty = RideTracker::new();
        let mut restored = ActiveRide::from_offer(RideOffer::new(RideId(8)));
        restored.status = RideStatus::InProgress;
        assert!(empty.apply_snapshot(Some(restored)));
        assert_eq!(empty.active().unwrap().ride_id, RideId(8));
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut tracker = RideTracker::new();
        for id in 0..(TOMBSTONES as i64 + 5) {
            tracker.retire(RideId(id));
        }
        assert!(!tracker.is_finished(RideId(0)));
        assert!(tracker.is_finished(RideId(TOMBSTONES as i64 + 4)));
    }
}
