//! Ride offer reconciliation
//!
//! At most one live offer per driver. REST snapshots only fill an empty slot;
//! pushed offers always win.

use crate::models::{RideId, RideOffer};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferSlot {
    current: Option<RideOffer>,
}

impl OfferSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&RideOffer> {
        self.current.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    pub fn holds(&self, ride_id: RideId) -> bool {
        self.current
            .as_ref()
            .map_or(false, |offer| offer.ride_id == ride_id)
    }

    /// Pending request from a snapshot; ignored when an offer is already held.
    /// Returns whether the slot changed.
    pub fn apply_snapshot(&mut self, pending: Option<RideOffer>) -> bool {
        match pending {
            Some(offer) if self.current.is_none() => {
                self.current = Some(offer);
                true
            }
            _ => false,
        }
    }

    /// Pushed offer, last write wins. Returns the offer it replaced.
    pub fn apply_push(&mut self, offer: RideOffer) -> Option<RideOffer> {
        self.current.replace(offer)
    }

    pub fn clear(&mut self) -> Option<RideOffer> {
        self.current.take()
    }

    /// Clear only if the slot still holds `ride_id`
    pub fn clear_if(&mut self, ride_id: RideId) -> Option<RideOffer> {
        if self.holds(ride_id) {
            self.current.take()
        } else {
            None
        }
    }
}
