use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::TransitionError;
use crate::models::ride::{Ride, RideStatus};

/// Result of a successful transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The ride already held the target status; nothing changed.
    Unchanged,
}

/// Validates and applies status changes for one ride.
///
/// Every mutation of `Ride::status` goes through here. Guards never touch
/// the ride on failure, so a rejected call leaves it exactly as it was.
pub struct RideStateMachine<'a> {
    ride: &'a mut Ride,
}

impl<'a> RideStateMachine<'a> {
    pub fn new(ride: &'a mut Ride) -> Self {
        Self { ride }
    }

    pub fn status(&self) -> RideStatus {
        self.ride.status
    }

    /// REQUESTED -> MATCHED. Re-assigning the same driver is a no-op;
    /// any other driver is a double match and is refused.
    pub fn assign_driver(
        &mut self,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        match self.ride.status {
            RideStatus::Requested => {
                self.ride.driver_id = Some(driver_id);
                self.ride.status = RideStatus::Matched;
                self.ride.matched_at = Some(now);
                Ok(Transition::Applied)
            }
            RideStatus::Matched if self.ride.driver_id == Some(driver_id) => {
                Ok(Transition::Unchanged)
            }
            from => Err(TransitionError::InvalidTransition {
                from,
                to: RideStatus::Matched,
            }),
        }
    }

    /// One step along MATCHED -> EN_ROUTE -> ARRIVED -> IN_PROGRESS -> COMPLETED.
    pub fn advance(
        &mut self,
        target: RideStatus,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let from = self.ride.status;
        if from == target {
            return Ok(Transition::Unchanged);
        }

        // MATCHED needs a driver and CANCELLED needs a reason; both have
        // their own entry points.
        let legal = from != RideStatus::Requested && from.next() == Some(target);
        if !legal {
            tracing::debug!(ride_id = %self.ride.id, %from, to = %target, "rejected status change");
            return Err(TransitionError::InvalidTransition { from, to: target });
        }

        match target {
            RideStatus::InProgress => self.ride.started_at = Some(now),
            RideStatus::Completed => self.ride.completed_at = Some(now),
            _ => {}
        }
        self.ride.status = target;
        Ok(Transition::Applied)
    }

    /// Cancels a ride that has not started. Returns the driver that was
    /// released, if one had been assigned.
    pub fn cancel(
        &mut self,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, TransitionError> {
        let status = self.ride.status;
        if !status.is_cancellable() {
            return Err(TransitionError::CannotCancel { status });
        }

        self.ride.status = RideStatus::Cancelled;
        self.ride.cancelled_at = Some(now);
        self.ride.cancellation_reason = reason;
        Ok(self.ride.driver_id.take())
    }

    pub fn complete(
        &mut self,
        final_fare: f64,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        match self.ride.status {
            RideStatus::InProgress => {
                self.ride.status = RideStatus::Completed;
                self.ride.final_fare = Some(final_fare);
                self.ride.completed_at = Some(now);
                Ok(Transition::Applied)
            }
            RideStatus::Completed => Ok(Transition::Unchanged),
            from => Err(TransitionError::InvalidTransition {
                from,
                to: RideStatus::Completed,
            }),
        }
    }

    /// Entry point for the asynchronous status feed, which may redeliver.
    /// Re-applying the current status succeeds without side effects,
    /// including for CANCELLED.
    pub fn apply_status(
        &mut self,
        target: RideStatus,
        driver_id: Option<Uuid>,
        final_fare: Option<f64>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if self.ride.status == target {
            return Ok(Transition::Unchanged);
        }

        match target {
            RideStatus::Matched => match driver_id {
                Some(driver_id) => self.assign_driver(driver_id, now),
                None => Err(TransitionError::InvalidTransition {
                    from: self.ride.status,
                    to: target,
                }),
            },
            RideStatus::Cancelled => self.cancel(reason, now).map(|_| Transition::Applied),
            RideStatus::Completed => match final_fare {
                Some(fare) => self.complete(fare, now),
                None => self.advance(target, now),
            },
            _ => self.advance(target, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{RideStateMachine, Transition};
    use crate::error::TransitionError;
    use crate::models::ride::{Location, Ride, RideCategory, RideStatus};

    fn ride() -> Ride {
        Ride::new(
            Uuid::from_u128(7),
            RideCategory::Economy,
            Location::new(52.52, 13.405),
            Location::new(52.50, 13.44),
            18.5,
        )
    }

    fn ride_in(status: RideStatus) -> Ride {
        let mut ride = ride();
        ride.status = status;
        if status.has_driver() {
            ride.driver_id = Some(Uuid::from_u128(99));
        }
        ride
    }

    #[test]
    fn assign_driver_from_requested() {
        let mut ride = ride();
        let driver = Uuid::from_u128(1);

        let result = RideStateMachine::new(&mut ride).assign_driver(driver, Utc::now());

        assert_eq!(result, Ok(Transition::Applied));
        assert_eq!(ride.status, RideStatus::Matched);
        assert_eq!(ride.driver_id, Some(driver));
        assert!(ride.matched_at.is_some());
    }

    #[test]
    fn second_driver_cannot_match_same_ride() {
        let mut ride = ride();
        let mut sm = RideStateMachine::new(&mut ride);
        sm.assign_driver(Uuid::from_u128(1), Utc::now()).unwrap();

        let err = sm
            .assign_driver(Uuid::from_u128(2), Utc::now())
            .unwrap_err();

        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                from: RideStatus::Matched,
                to: RideStatus::Matched,
            }
        );
        assert_eq!(ride.driver_id, Some(Uuid::from_u128(1)));
    }

    #[test]
    fn reassigning_same_driver_is_noop() {
        let mut ride = ride();
        let mut sm = RideStateMachine::new(&mut ride);
        sm.assign_driver(Uuid::from_u128(1), Utc::now()).unwrap();

        assert_eq!(
            sm.assign_driver(Uuid::from_u128(1), Utc::now()),
            Ok(Transition::Unchanged)
        );
    }

    #[test]
    fn every_off_chain_advance_is_rejected_and_leaves_status() {
        for from in RideStatus::ALL {
            for to in RideStatus::ALL {
                let legal_step = from != RideStatus::Requested && from.next() == Some(to);
                if from == to || legal_step {
                    continue;
                }

                let mut ride = ride_in(from);
                let result = RideStateMachine::new(&mut ride).advance(to, Utc::now());

                assert_eq!(
                    result,
                    Err(TransitionError::InvalidTransition { from, to }),
                    "{from} -> {to}"
                );
                assert_eq!(ride.status, from);
            }
        }
    }

    #[test]
    fn advancing_to_current_status_is_noop() {
        for status in RideStatus::ALL {
            let mut ride = ride_in(status);
            let before = ride.clone();

            let result = RideStateMachine::new(&mut ride).advance(status, Utc::now());

            assert_eq!(result, Ok(Transition::Unchanged));
            assert_eq!(ride.status, before.status);
            assert_eq!(ride.started_at, before.started_at);
            assert_eq!(ride.completed_at, before.completed_at);
        }
    }

    #[test]
    fn full_forward_chain_stamps_timestamps() {
        let mut ride = ride();
        let mut sm = RideStateMachine::new(&mut ride);
        sm.assign_driver(Uuid::from_u128(1), Utc::now()).unwrap();
        sm.advance(RideStatus::EnRoute, Utc::now()).unwrap();
        sm.advance(RideStatus::Arrived, Utc::now()).unwrap();
        sm.advance(RideStatus::InProgress, Utc::now()).unwrap();
        sm.complete(24.0, Utc::now()).unwrap();

        assert_eq!(ride.status, RideStatus::Completed);
        assert_eq!(ride.final_fare, Some(24.0));
        assert!(ride.started_at.is_some());
        assert!(ride.completed_at.is_some());
        assert!(ride.driver_id.is_some());
    }

    #[test]
    fn cancel_releases_driver() {
        let mut ride = ride_in(RideStatus::EnRoute);

        let released = RideStateMachine::new(&mut ride)
            .cancel(Some("passenger changed plans".into()), Utc::now())
            .unwrap();

        assert_eq!(released, Some(Uuid::from_u128(99)));
        assert_eq!(ride.status, RideStatus::Cancelled);
        assert!(ride.driver_id.is_none());
        assert_eq!(
            ride.cancellation_reason.as_deref(),
            Some("passenger changed plans")
        );
    }

    #[test]
    fn cannot_cancel_started_or_terminal_rides() {
        for status in [
            RideStatus::InProgress,
            RideStatus::Completed,
            RideStatus::Cancelled,
        ] {
            let mut ride = ride_in(status);
            let err = RideStateMachine::new(&mut ride)
                .cancel(None, Utc::now())
                .unwrap_err();
            assert_eq!(err, TransitionError::CannotCancel { status });
            assert_eq!(ride.status, status);
        }
    }

    #[test]
    fn complete_only_from_in_progress() {
        let mut ride = ride_in(RideStatus::Arrived);
        let err = RideStateMachine::new(&mut ride)
            .complete(10.0, Utc::now())
            .unwrap_err();

        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
        assert!(ride.final_fare.is_none());
    }

    #[test]
    fn status_feed_redelivery_of_cancel_is_noop() {
        let mut ride = ride_in(RideStatus::Cancelled);

        let result = RideStateMachine::new(&mut ride).apply_status(
            RideStatus::Cancelled,
            None,
            None,
            None,
            Utc::now(),
        );

        assert_eq!(result, Ok(Transition::Unchanged));
    }

    #[test]
    fn status_feed_matched_requires_driver() {
        let mut ride = ride();
        let result = RideStateMachine::new(&mut ride).apply_status(
            RideStatus::Matched,
            None,
            None,
            None,
            Utc::now(),
        );

        assert!(result.is_err());
        assert_eq!(ride.status, RideStatus::Requested);
    }
}
