//! In-flight offers per ride.
//!
//! Each ride's entry is removed exactly once, by whichever of these wins:
//! the first valid acceptance (`claim`), the last decline (`decline`), the
//! cycle timer (`expire`), or a cancellation (`retract`). Removal goes
//! through `DashMap::remove_if`, which is atomic per entry, so unrelated
//! rides never contend.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::offer::RideOffer;

/// How a dispatch cycle was settled by someone other than its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Matched { driver_id: Uuid },
    AllDeclined,
    /// The ride left REQUESTED through some other path.
    Cancelled,
    /// Closed by the sweeper rather than the cycle's own timer.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    /// No open cycle for the ride: already claimed, expired or unknown.
    NotPending,
    /// The cycle is open but holds no live offer for this driver and id.
    NoSuchOffer,
    Expired,
}

#[derive(Debug)]
pub enum DeclineOutcome {
    Recorded,
    /// That was the last live offer; the entry has been closed.
    AllDeclined(ClosedRide),
    Unknown,
}

struct PendingRide {
    correlation_id: Uuid,
    offers: HashMap<Uuid, RideOffer>,
    declined: HashSet<Uuid>,
    expires_at: DateTime<Utc>,
    resolution: Option<oneshot::Sender<Resolution>>,
}

impl PendingRide {
    fn has_live_offer(&self, driver_id: Uuid, offer_id: Uuid, now: DateTime<Utc>) -> bool {
        self.offers
            .get(&driver_id)
            .is_some_and(|offer| offer.offer_id == offer_id && !offer.is_expired(now))
    }

    fn close(self, ride_id: Uuid) -> ClosedRide {
        ClosedRide {
            ride_id,
            correlation_id: self.correlation_id,
            offers: self.offers.into_values().collect(),
            declined: self.declined.into_iter().collect(),
            resolution: self.resolution,
        }
    }
}

/// A removed entry. Whoever holds it owns the remaining side effects.
#[derive(Debug)]
pub struct ClosedRide {
    pub ride_id: Uuid,
    pub correlation_id: Uuid,
    /// Offers still outstanding when the entry was removed.
    pub offers: Vec<RideOffer>,
    pub declined: Vec<Uuid>,
    resolution: Option<oneshot::Sender<Resolution>>,
}

impl ClosedRide {
    /// Wakes the cycle that opened this entry.
    pub fn resolve(&mut self, resolution: Resolution) {
        if let Some(tx) = self.resolution.take() {
            if tx.send(resolution).is_err() {
                debug!(ride_id = %self.ride_id, "dispatch cycle already gone");
            }
        }
    }
}

#[derive(Debug)]
pub struct ClaimedRide {
    pub winner: RideOffer,
    /// Everyone else who still held an offer.
    pub rest: ClosedRide,
}

#[derive(Default)]
pub struct PendingOffers {
    entries: DashMap<Uuid, PendingRide>,
}

impl PendingOffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a cycle for `ride_id`. Returns `None` if one is already open,
    /// which happens when a match request is redelivered.
    pub fn open(
        &self,
        ride_id: Uuid,
        correlation_id: Uuid,
        offers: Vec<RideOffer>,
        expires_at: DateTime<Utc>,
    ) -> Option<oneshot::Receiver<Resolution>> {
        match self.entries.entry(ride_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingRide {
                    correlation_id,
                    offers: offers
                        .into_iter()
                        .map(|offer| (offer.driver_id, offer))
                        .collect(),
                    declined: HashSet::new(),
                    expires_at,
                    resolution: Some(tx),
                });
                Some(rx)
            }
        }
    }

    /// Drops an offer that could not be delivered.
    pub fn withdraw(&self, ride_id: Uuid, driver_id: Uuid) {
        if let Some(mut entry) = self.entries.get_mut(&ride_id) {
            entry.offers.remove(&driver_id);
        }
    }

    /// Closes the entry if no live offers remain.
    pub fn close_if_exhausted(&self, ride_id: Uuid) -> Option<ClosedRide> {
        self.entries
            .remove_if(&ride_id, |_, entry| entry.offers.is_empty())
            .map(|(ride_id, entry)| entry.close(ride_id))
    }

    /// Compare-and-clear: removes the entry only if `driver_id` holds the
    /// live offer `offer_id`. At most one caller per ride gets `Ok`.
    pub fn claim(
        &self,
        ride_id: Uuid,
        offer_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimedRide, ClaimError> {
        let removed = self
            .entries
            .remove_if(&ride_id, |_, entry| entry.has_live_offer(driver_id, offer_id, now));

        match removed {
            Some((ride_id, mut entry)) => {
                let winner = entry
                    .offers
                    .remove(&driver_id)
                    .ok_or(ClaimError::NoSuchOffer)?;
                Ok(ClaimedRide {
                    winner,
                    rest: entry.close(ride_id),
                })
            }
            None => Err(self.explain_miss(ride_id, offer_id, driver_id, now)),
        }
    }

    fn explain_miss(&self, ride_id: Uuid, offer_id: Uuid, driver_id: Uuid, now: DateTime<Utc>) -> ClaimError {
        let Some(entry) = self.entries.get(&ride_id) else {
            return ClaimError::NotPending;
        };
        match entry.offers.get(&driver_id) {
            Some(offer) if offer.offer_id == offer_id && offer.is_expired(now) => ClaimError::Expired,
            _ => ClaimError::NoSuchOffer,
        }
    }

    pub fn decline(&self, ride_id: Uuid, offer_id: Uuid, driver_id: Uuid) -> DeclineOutcome {
        {
            let Some(mut entry) = self.entries.get_mut(&ride_id) else {
                return DeclineOutcome::Unknown;
            };
            match entry.offers.get(&driver_id) {
                Some(offer) if offer.offer_id == offer_id => {}
                _ => return DeclineOutcome::Unknown,
            }
            entry.offers.remove(&driver_id);
            entry.declined.insert(driver_id);
            if !entry.offers.is_empty() {
                return DeclineOutcome::Recorded;
            }
        }

        match self.close_if_exhausted(ride_id) {
            Some(closed) => DeclineOutcome::AllDeclined(closed),
            None => DeclineOutcome::Recorded,
        }
    }

    /// Timer path: removes the entry whatever its state.
    pub fn expire(&self, ride_id: Uuid) -> Option<ClosedRide> {
        self.entries
            .remove(&ride_id)
            .map(|(ride_id, entry)| entry.close(ride_id))
    }

    /// Cancellation path.
    pub fn retract(&self, ride_id: Uuid) -> Option<ClosedRide> {
        self.expire(ride_id)
    }

    /// Backstop for cycles whose timer never fired.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<ClosedRide> {
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|ride_id| {
                self.entries
                    .remove_if(&ride_id, |_, entry| entry.expires_at <= now)
                    .map(|(ride_id, entry)| {
                        warn!(ride_id = %ride_id, "swept orphaned pending offers");
                        entry.close(ride_id)
                    })
            })
            .collect()
    }

    pub fn contains(&self, ride_id: Uuid) -> bool {
        self.entries.contains_key(&ride_id)
    }

    pub fn offer_for(&self, ride_id: Uuid, driver_id: Uuid) -> Option<RideOffer> {
        self.entries
            .get(&ride_id)
            .and_then(|entry| entry.offers.get(&driver_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
