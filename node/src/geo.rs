//! Geodetic math for the trilateration pipeline.
//!
//! All geodesy runs in f64; session geometry spans at most a few hundred
//! meters, so the equirectangular local-tangent-plane approximation is well
//! inside the error budget.

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Project geodetic coordinates to local ENU meters around a reference point.
pub fn to_enu(lat: f64, lon: f64, ref_lat: f64, ref_lon: f64) -> (f64, f64) {
    let east = EARTH_RADIUS_M * (lon - ref_lon).to_radians() * ref_lat.to_radians().cos();
    let north = EARTH_RADIUS_M * (lat - ref_lat).to_radians();
    (east, north)
}

/// Back-project local ENU meters to geodetic coordinates.
pub fn from_enu(east: f64, north: f64, ref_lat: f64, ref_lon: f64) -> (f64, f64) {
    let lat = ref_lat + (north / EARTH_RADIUS_M).to_degrees();
    let lon = ref_lon + (east / (EARTH_RADIUS_M * ref_lat.to_radians().cos())).to_degrees();
    (lat, lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enu_round_trip() {
        let (ref_lat, ref_lon) = (48.8583, 2.2945);
        let (e, n) = to_enu(48.8590, 2.2960, ref_lat, ref_lon);
        let (lat, lon) = from_enu(e, n, ref_lat, ref_lon);
        assert!((lat - 48.8590).abs() < 1e-9);
        assert!((lon - 2.2960).abs() < 1e-9);
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn enu_matches_haversine_at_short_range() {
        let (ref_lat, ref_lon) = (45.0, 7.0);
        let (lat, lon) = (45.00045, 7.00045);
        let (e, n) = to_enu(lat, lon, ref_lat, ref_lon);
        let enu_dist = (e * e + n * n).sqrt();
        let hav = haversine_m(ref_lat, ref_lon, lat, lon);
        assert!((enu_dist - hav).abs() < 0.5);
    }
}
