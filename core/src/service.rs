//! Thread-safe navigation service binding sensor conditioning, the EKF,
//! and the anomaly map.
//!
//! The service is an explicit object passed by handle to every transport
//! (HTTP handlers, tool dispatch, CLI); there is no process-wide global.
//! One mutex serializes everything that mutates the filter (`observe*`,
//! `reset`) in arrival order; `query_field` reads only the map and never
//! takes that lock, so field queries proceed concurrently with filter
//! updates. The map itself synchronises nothing but its tile cache.

use log::{debug, info};
use serde::Serialize;
use std::sync::{Arc, Mutex};

use crate::ekf::{EkfConfig, NavEkf};
use crate::error::{NavError, NavResult};
use crate::geo::LatLon;
use crate::map::{InterpMethod, MagneticMap, TileMetadata};
use crate::sensor::{CalibrationParams, MagneticVector, MovingAverageFilter};

/// Default conditioning window when none is configured
pub const DEFAULT_WINDOW: usize = 1;

/// Full state snapshot returned by every observation call
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Estimate {
    pub lat: f64,
    pub lon: f64,
    /// Velocity in degrees/second
    pub vlat: f64,
    pub vlon: f64,
    /// Agreement between observation and prediction, in [0, 1]
    pub quality: f64,
    pub covariance_diag: [f64; 4],
}

/// State guarded by the filter mutex
struct FilterCore {
    ekf: NavEkf,
    conditioner: MovingAverageFilter,
    calibration: CalibrationParams,
}

/// Singleton service state: one filter, one optional map.
pub struct NavService {
    map: Option<Arc<MagneticMap>>,
    filter: Mutex<FilterCore>,
}

impl NavService {
    /// Build a service with explicit filter configuration.
    pub fn new(
        map: Option<Arc<MagneticMap>>,
        initial: LatLon,
        config: EkfConfig,
        calibration: CalibrationParams,
        window: usize,
    ) -> NavResult<Self> {
        Ok(NavService {
            map,
            filter: Mutex::new(FilterCore {
                ekf: NavEkf::new(initial, config)?,
                conditioner: MovingAverageFilter::new(window)?,
                calibration,
            }),
        })
    }

    /// Service with a loaded map and default tuning; the filter starts at
    /// the map centre so the first observations land inside the grid.
    pub fn with_map(map: Arc<MagneticMap>) -> NavResult<Self> {
        let header = map.header();
        let (lat, lon) = header.cell_center(header.nrows / 2, header.ncols / 2);
        let initial = LatLon::new(lat, lon)?;
        info!("navigation service starting at map centre {initial}");
        Self::new(
            Some(map),
            initial,
            EkfConfig::default(),
            CalibrationParams::identity(),
            DEFAULT_WINDOW,
        )
    }

    /// Service without a map: position observations and resets still work,
    /// every map-dependent operation fails with [`NavError::MapIo`].
    pub fn without_map() -> Self {
        NavService {
            map: None,
            filter: Mutex::new(FilterCore {
                ekf: NavEkf::new(
                    LatLon::new(0.0, 0.0).expect("origin is a valid position"),
                    EkfConfig::default(),
                )
                .expect("default configuration is valid"),
                conditioner: MovingAverageFilter::new(DEFAULT_WINDOW)
                    .expect("default window is valid"),
                calibration: CalibrationParams::identity(),
            }),
        }
    }

    pub fn has_map(&self) -> bool {
        self.map.is_some()
    }

    fn map(&self) -> NavResult<&Arc<MagneticMap>> {
        self.map
            .as_ref()
            .ok_or_else(|| NavError::MapIo("no magnetic map loaded".into()))
    }

    /// Whole-map extent, for clients probing coverage
    pub fn tile_metadata(&self) -> NavResult<TileMetadata> {
        Ok(self.map()?.tile_metadata())
    }

    /// Shared handle to the loaded map for read-only consumers (the
    /// trajectory simulator, coverage probes).
    pub fn map_handle(&self) -> NavResult<Arc<MagneticMap>> {
        self.map().map(Arc::clone)
    }

    fn snapshot(ekf: &NavEkf, quality: f64) -> NavResult<Estimate> {
        let position = ekf.estimate()?;
        let (vlat, vlon) = ekf.velocity();
        Ok(Estimate {
            lat: position.lat(),
            lon: position.lon(),
            vlat,
            vlon,
            quality,
            covariance_diag: ekf.covariance_diagonal(),
        })
    }

    /// Condition a raw magnetometer sample and fuse its total field:
    /// calibrate, smooth, predict, update.
    pub fn observe(&self, raw: MagneticVector, dt: f64) -> NavResult<Estimate> {
        if !raw.is_finite() {
            return Err(NavError::Domain(format!("non-finite sample {raw}")));
        }
        let map = Arc::clone(self.map()?);
        let mut core = self.filter.lock().expect("filter mutex poisoned");
        let calibrated = core.calibration.apply(&raw);
        let smoothed = core.conditioner.update(calibrated);
        let z = smoothed.magnitude();
        core.ekf.predict(dt)?;
        let quality = core.ekf.update_field(z, map.as_ref())?;
        debug!("observe: |B| = {z:.1} nT, quality {quality:.3}");
        Self::snapshot(&core.ekf, quality)
    }

    /// Fuse an already-conditioned scalar total-field observation (the tool
    /// surface's input shape).
    pub fn observe_scalar(&self, b_total: f64, dt: f64) -> NavResult<Estimate> {
        let map = Arc::clone(self.map()?);
        let mut core = self.filter.lock().expect("filter mutex poisoned");
        core.ekf.predict(dt)?;
        let quality = core.ekf.update_field(b_total, map.as_ref())?;
        Self::snapshot(&core.ekf, quality)
    }

    /// Fuse a position-domain observation (the thin HTTP surface's shape).
    pub fn observe_position(&self, obs: LatLon, dt: f64) -> NavResult<Estimate> {
        let mut core = self.filter.lock().expect("filter mutex poisoned");
        core.ekf.predict(dt)?;
        let quality = core.ekf.update_position(obs)?;
        Self::snapshot(&core.ekf, quality)
    }

    /// Interpolate the map directly. Does not take the filter lock.
    pub fn query_field(&self, lat: f64, lon: f64, method: InterpMethod) -> NavResult<f64> {
        self.map()?.interpolate(lat, lon, method)
    }

    /// Re-initialize the filter and clear the conditioning window.
    pub fn reset(&self, at: LatLon) {
        let mut core = self.filter.lock().expect("filter mutex poisoned");
        core.ekf.reset(at);
        let window = core.conditioner.window();
        core.conditioner =
            MovingAverageFilter::new(window).expect("existing window is valid");
        info!("service reset at {at}");
    }
}
