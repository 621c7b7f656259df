use std::cmp::Ordering;

use crate::models::driver::NearbyDriver;

/// Orders candidates by ascending distance; rating only breaks exact
/// distance ties.
pub fn rank_candidates(mut candidates: Vec<NearbyDriver>, limit: usize) -> Vec<NearbyDriver> {
    candidates.sort_by(compare_candidates);
    candidates.truncate(limit);
    candidates
}

fn compare_candidates(a: &NearbyDriver, b: &NearbyDriver) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| b.rating.total_cmp(&a.rating))
}

/// What the driver takes home from a fare after the platform share.
pub fn driver_earnings(estimated_fare: f64, earnings_share: f64) -> f64 {
    let earnings = estimated_fare.max(0.0) * earnings_share.clamp(0.0, 1.0);
    (earnings * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{driver_earnings, rank_candidates};
    use crate::models::driver::NearbyDriver;
    use crate::models::ride::Location;

    fn candidate(seed: u128, distance_km: f64, rating: f64) -> NearbyDriver {
        NearbyDriver {
            driver_id: Uuid::from_u128(seed),
            distance_km,
            rating,
            last_known_location: Location::new(52.52, 13.405),
        }
    }

    fn ids(list: &[NearbyDriver]) -> Vec<u128> {
        list.iter().map(|c| c.driver_id.as_u128()).collect()
    }

    #[test]
    fn closer_driver_wins_over_better_rating() {
        let ranked = rank_candidates(vec![candidate(1, 2.0, 5.0), candidate(2, 1.0, 3.0)], 10);
        assert_eq!(ids(&ranked), vec![2, 1]);
    }

    #[test]
    fn rating_breaks_distance_ties() {
        let ranked = rank_candidates(
            vec![candidate(1, 1.5, 4.1), candidate(2, 1.5, 4.8), candidate(3, 0.5, 1.0)],
            10,
        );
        assert_eq!(ids(&ranked), vec![3, 2, 1]);
    }

    #[test]
    fn limit_truncates_after_sorting() {
        let ranked = rank_candidates(
            vec![candidate(1, 3.0, 5.0), candidate(2, 1.0, 5.0), candidate(3, 2.0, 5.0)],
            2,
        );
        assert_eq!(ids(&ranked), vec![2, 3]);
    }

    #[test]
    fn earnings_apply_share_and_round_to_cents() {
        assert_eq!(driver_earnings(18.35, 0.8), 14.68);
        assert_eq!(driver_earnings(-4.0, 0.8), 0.0);
    }
}
