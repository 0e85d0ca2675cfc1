//! Magnetic anomaly navigation toolbox.
//!
//! This crate estimates a moving platform's two-dimensional geographic
//! position from total-field magnetometer measurements compared against a
//! preloaded magnetic anomaly map. It is a passive, emissionless
//! localization stack: no signal is transmitted and no satellite system is
//! consulted. The intended accuracy envelope is tens of meters of bounded
//! error, drift-free over time, which is what anomaly map matching can
//! deliver with survey-grade maps and a well-conditioned scalar sensor.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra for the filter and calibration fits.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): seeded noise generation for the trajectory simulator.
//! - [`tiff`](https://crates.io/crates/tiff) and [`netcdf`](https://crates.io/crates/netcdf): raster backends for the anomaly map.
//!
//! ## Crate overview
//!
//! - [geo]: validated geodetic types, WGS84/ECEF conversions, haversine distances.
//! - [sensor]: magnetometer sample types, hard/soft-iron calibration, moving-average conditioning, driver seam.
//! - [calibrate]: calibration estimation from sample clouds (mean-centre and ellipsoid fit).
//! - [map]: anomaly map engine: header, GeoTIFF/NetCDF loaders, tile cache, interpolation facade.
//! - [ekf]: the Extended Kalman Filter over `[lat, lon, vlat, vlon]`.
//! - [sim]: deterministic trajectory and measurement simulation.
//! - [service]: the thread-safe service object transports hold.
//!
//! ## Pipeline
//!
//! A raw three-axis sample flows through calibration and the moving-average
//! window into a scalar total field; the filter predicts forward by the
//! elapsed interval and corrects against the map's interpolated anomaly at
//! the current estimate. Each external request drives at most one
//! predict/update cycle; there is no internal clock or background thread.
//!
//! The state vector is
//!
//! ```text
//! x = [lat, lon, vlat, vlon]    degrees, degrees/second
//! ```
//!
//! with a constant-velocity transition. The scalar measurement model is the
//! map itself, linearised by central finite difference at the current
//! estimate. Anything that prevents a trustworthy linearisation (off-map
//! probe, nodata in the stencil, ill-conditioned innovation) downgrades the
//! cycle to prediction-only with a reported quality of zero; the filter
//! degrades rather than diverges.

pub mod calibrate;
pub mod ekf;
pub mod error;
pub mod geo;
pub mod map;
pub mod sensor;
pub mod service;
pub mod sim;

pub use error::{NavError, NavResult};

/// Scalar anomaly field seam between the filter and the map.
///
/// The filter only ever asks one question of the world: what is the
/// expected total-field anomaly at a position. Implemented by
/// [`map::MagneticMap`] for production and by closures for analytic test
/// fields.
pub trait AnomalyModel: Send + Sync {
    /// Expected anomaly in nT at a geodetic coordinate.
    ///
    /// # Errors
    /// [`NavError::OutOfMap`] outside coverage; NaN (not an error) for
    /// nodata inside coverage.
    fn field_at(&self, lat: f64, lon: f64) -> NavResult<f64>;
}

impl<F> AnomalyModel for F
where
    F: Fn(f64, f64) -> NavResult<f64> + Send + Sync,
{
    fn field_at(&self, lat: f64, lon: f64) -> NavResult<f64> {
        self(lat, lon)
    }
}
