//! Earth-related constants and geodetic primitives.
//!
//! This module contains the constants and coordinate types used throughout
//! the navigation stack. The Earth is modeled as the WGS84 ellipsoid for
//! Cartesian conversions and as a sphere of mean radius for great-circle
//! distances. Positions are validated at construction: a [`LatLon`] can only
//! hold a finite latitude in [-90, 90] degrees and a finite longitude in
//! [-180, 180] degrees, so downstream code never re-checks ranges.
//!
//! The ECEF conversion uses the standard closed-form forward transform and
//! Bowring's iterative method for the inverse. For the surface positions this
//! crate works with, the inverse converges well inside the 1e-12 radian
//! tolerance in fewer than five iterations.

use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};

// Earth constants (WGS84)
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
pub const FLATTENING: f64 = 1.0 / 298.257223563; // unit-less
pub const ECCENTRICITY_SQUARED: f64 = FLATTENING * (2.0 - FLATTENING);
/// Mean Earth radius used for great-circle distances (meters)
pub const MEAN_RADIUS: f64 = 6371008.8;

/// Bowring iteration tolerance in radians
const INVERSE_TOLERANCE_RAD: f64 = 1e-12;
/// Maximum Bowring iterations before accepting the current value
const INVERSE_MAX_ITERATIONS: usize = 5;

/// Geodetic latitude/longitude pair in decimal degrees.
///
/// Immutable once constructed; equality is exact component equality. Use
/// [`distance_m`] for "near" comparisons in meters. Deserialization funnels
/// through the validated constructor, so a position arriving over the wire
/// is as trustworthy as one built in code.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLatLon")]
pub struct LatLon {
    lat: f64,
    lon: f64,
}

/// Unvalidated wire shape backing [`LatLon`] deserialization
#[derive(Deserialize)]
struct RawLatLon {
    lat: f64,
    lon: f64,
}

impl TryFrom<RawLatLon> for LatLon {
    type Error = NavError;

    fn try_from(raw: RawLatLon) -> NavResult<Self> {
        LatLon::new(raw.lat, raw.lon)
    }
}

impl LatLon {
    /// Create a validated position.
    ///
    /// # Parameters
    /// - `lat` - latitude in degrees, must be finite and in [-90, 90]
    /// - `lon` - longitude in degrees, must be finite and in [-180, 180]
    ///
    /// # Errors
    /// Returns [`NavError::Domain`] when either component is non-finite or
    /// outside its range.
    pub fn new(lat: f64, lon: f64) -> NavResult<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(NavError::Domain(format!(
                "non-finite coordinates ({lat}, {lon})"
            )));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(NavError::Domain(format!(
                "latitude {lat} outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(NavError::Domain(format!(
                "longitude {lon} outside [-180, 180]"
            )));
        }
        Ok(LatLon { lat, lon })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Convert to Earth-centered Earth-fixed coordinates on the WGS84
    /// ellipsoid surface (zero height).
    pub fn to_ecef(&self) -> Ecef {
        let lat_rad = self.lat.to_radians();
        let lon_rad = self.lon.to_radians();
        let sin_lat = lat_rad.sin();
        let cos_lat = lat_rad.cos();
        // Prime-vertical radius of curvature
        let n = EQUATORIAL_RADIUS / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
        Ecef {
            x: n * cos_lat * lon_rad.cos(),
            y: n * cos_lat * lon_rad.sin(),
            z: n * (1.0 - ECCENTRICITY_SQUARED) * sin_lat,
        }
    }

    /// Recover a geodetic position from ECEF coordinates using Bowring's
    /// iterative method (tolerance 1e-12 rad, at most five iterations).
    ///
    /// # Errors
    /// Returns [`NavError::Domain`] on non-finite inputs or when the
    /// recovered position falls outside the geodetic ranges.
    pub fn from_ecef(ecef: &Ecef) -> NavResult<Self> {
        if !ecef.x.is_finite() || !ecef.y.is_finite() || !ecef.z.is_finite() {
            return Err(NavError::Domain("non-finite ECEF coordinates".into()));
        }
        let p = ecef.x.hypot(ecef.y);
        let lon_rad = ecef.y.atan2(ecef.x);
        // Degenerate polar axis case: latitude is +/-90 exactly
        if p == 0.0 {
            let lat = if ecef.z >= 0.0 { 90.0 } else { -90.0 };
            return LatLon::new(lat, lon_rad.to_degrees());
        }
        let mut lat_rad = (ecef.z / (p * (1.0 - ECCENTRICITY_SQUARED))).atan();
        for _ in 0..INVERSE_MAX_ITERATIONS {
            let sin_lat = lat_rad.sin();
            let n = EQUATORIAL_RADIUS / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
            let next = ((ecef.z + ECCENTRICITY_SQUARED * n * sin_lat) / p).atan();
            let delta = (next - lat_rad).abs();
            lat_rad = next;
            if delta < INVERSE_TOLERANCE_RAD {
                break;
            }
        }
        LatLon::new(lat_rad.to_degrees(), lon_rad.to_degrees())
    }
}

impl std::fmt::Display for LatLon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lon)
    }
}

/// Earth-centered Earth-fixed coordinates in meters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ecef {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Haversine great-circle distance in meters between two positions.
///
/// Uses the mean Earth radius [`MEAN_RADIUS`]. Suitable for the "near"
/// comparisons the filter and tests rely on; not an ellipsoidal geodesic.
pub fn distance_m(a: &LatLon, b: &LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    MEAN_RADIUS * c
}

/// North/east offset in meters from `from` to `to` on the mean sphere.
///
/// The small-offset companion of [`offset_by_meters`]; the two round-trip
/// for displacements well below the Earth radius.
pub fn ne_offset_m(from: &LatLon, to: &LatLon) -> (f64, f64) {
    let north = MEAN_RADIUS * (to.lat - from.lat).to_radians();
    let east = MEAN_RADIUS * from.lat.to_radians().cos() * (to.lon - from.lon).to_radians();
    (north, east)
}

/// Displace a position by a north/east offset in meters on the mean sphere.
///
/// # Errors
/// Returns [`NavError::Domain`] when the displaced position leaves the
/// geodetic ranges (e.g. stepping over a pole).
pub fn offset_by_meters(origin: &LatLon, north_m: f64, east_m: f64) -> NavResult<LatLon> {
    let dlat = (north_m / MEAN_RADIUS).to_degrees();
    let cos_lat = origin.lat.to_radians().cos();
    if cos_lat.abs() < 1e-12 {
        return Err(NavError::Domain(
            "eastward offset undefined at the pole".into(),
        ));
    }
    let dlon = (east_m / (MEAN_RADIUS * cos_lat)).to_degrees();
    LatLon::new(origin.lat + dlat, origin.lon + dlon)
}
