//! Geographic calculations

use crate::defaults::FALLBACK_SPEED_KMH;
use crate::types::Coordinates;

/// Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Calculate Haversine distance between two points in kilometers
pub fn haversine_distance(from: &Coordinates, to: &Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lng - from.lng).to_radians();

    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Straight-line leg estimate: (meters, seconds) at the fallback average speed
pub fn estimate_leg(from: &Coordinates, to: &Coordinates) -> (u64, u64) {
    let km = haversine_distance(from, to);
    let seconds = km / FALLBACK_SPEED_KMH * 3600.0;
    ((km * 1000.0).round() as u64, seconds.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_prague_brno() {
        let prague = Coordinates { lat: 50.0755, lng: 14.4378 };
        let brno = Coordinates { lat: 49.1951, lng: 16.6068 };

        let distance = haversine_distance(&prague, &brno);

        // Prague to Brno is approximately 185 km
        assert!((distance - 185.0).abs() < 5.0);
    }

    #[test]
    fn test_haversine_same_point() {
        let point = Coordinates { lat: 50.0, lng: 14.0 };
        let distance = haversine_distance(&point, &point);
        assert!((distance - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_estimate_leg_speed() {
        // ~11.1 km along a meridian
        let from = Coordinates { lat: 50.0, lng: 14.0 };
        let to = Coordinates { lat: 50.1, lng: 14.0 };

        let (meters, seconds) = estimate_leg(&from, &to);

        assert!((meters as f64 - 11_119.0).abs() < 50.0);
        // 30 km/h means 120 s per km
        assert!((seconds as f64 - meters as f64 * 0.12).abs() < 2.0);
    }

    #[test]
    fn test_estimate_leg_zero() {
        let point = Coordinates { lat: 50.0, lng: 14.0 };
        assert_eq!(estimate_leg(&point, &point), (0, 0));
    }
}
