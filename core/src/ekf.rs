//! Extended Kalman Filter for magnetic anomaly navigation.
//!
//! The filter estimates a planar geodetic state `x = [lat, lon, vlat, vlon]`
//! (degrees and degrees/second) with a 4x4 covariance, propagated by a
//! constant-velocity model and corrected by scalar total-field anomaly
//! observations compared against a map. The measurement model is linearised
//! on the fly: the map gradient is taken by central finite difference at
//! the current state, which keeps the filter agnostic to the map backend.
//!
//! Numerical discipline:
//! - the covariance update uses the Joseph form
//!   `(I - KH) P (I - KH)^T + K R K^T`, which preserves symmetry and
//!   positive semi-definiteness under roundoff;
//! - after every update the covariance is re-symmetrized and its diagonal
//!   clamped to non-negative values;
//! - an ill-conditioned innovation covariance (below the configured floor)
//!   or any map miss downgrades the update to a no-op with zero reported
//!   quality instead of corrupting the state;
//! - a candidate state with non-finite entries is discarded, leaving the
//!   filter exactly where the predict step put it.

use log::{debug, warn};
use nalgebra::{Matrix2, Matrix2x4, Matrix4, RowVector4, Vector2, Vector4};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::error::{NavError, NavResult};
use crate::geo::{LatLon, MEAN_RADIUS};
use crate::AnomalyModel;

/// Filter tuning parameters.
///
/// The two process noise terms have physical meaning under the
/// constant-velocity model: `process_noise_pos` is direct position jitter
/// (deg^2/s) covering unmodelled motion, and `process_noise_vel` is a
/// velocity random walk (deg^2/s^3) covering acceleration the model cannot
/// see. Both scale linearly with the prediction interval.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfConfig {
    /// Position jitter qp in deg^2/s
    pub process_noise_pos: f64,
    /// Velocity random walk qv in deg^2/s^3
    pub process_noise_vel: f64,
    /// Scalar anomaly measurement variance R in nT^2
    pub measurement_variance: f64,
    /// Direct position observation variance in deg^2
    pub position_variance: f64,
    /// Central-difference step for the map gradient, degrees
    pub jacobian_step: f64,
    /// Innovation covariance floor; S below this skips the update
    pub innovation_floor: f64,
    /// Position variance p0 installed by reset, deg^2
    pub initial_position_var: f64,
    /// Velocity variance v0 installed by reset, (deg/s)^2
    pub initial_velocity_var: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        EkfConfig {
            process_noise_pos: 1e-9,
            process_noise_vel: 1e-11,
            measurement_variance: 25.0,
            position_variance: 1e-6,
            jacobian_step: 1e-5,
            innovation_floor: 1e-12,
            initial_position_var: 1.0,
            initial_velocity_var: 0.01,
        }
    }
}

impl EkfConfig {
    /// # Errors
    /// Returns [`NavError::Config`] when any variance or step is
    /// non-positive or non-finite.
    pub fn validate(&self) -> NavResult<()> {
        let positive = [
            ("process_noise_pos", self.process_noise_pos),
            ("process_noise_vel", self.process_noise_vel),
            ("measurement_variance", self.measurement_variance),
            ("position_variance", self.position_variance),
            ("jacobian_step", self.jacobian_step),
            ("innovation_floor", self.innovation_floor),
            ("initial_position_var", self.initial_position_var),
            ("initial_velocity_var", self.initial_velocity_var),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(NavError::Config(format!(
                    "{name} must be finite and > 0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Extended Kalman Filter over `[lat, lon, vlat, vlon]`.
#[derive(Clone, Debug)]
pub struct NavEkf {
    x: Vector4<f64>,
    p: Matrix4<f64>,
    config: EkfConfig,
}

impl Display for NavEkf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NavEkf(lat: {:.6}, lon: {:.6}, vlat: {:.2e}, vlon: {:.2e})",
            self.x[0], self.x[1], self.x[2], self.x[3]
        )
    }
}

impl NavEkf {
    /// Create a filter at an initial position with zero velocity.
    pub fn new(initial: LatLon, config: EkfConfig) -> NavResult<Self> {
        config.validate()?;
        let mut filter = NavEkf {
            x: Vector4::zeros(),
            p: Matrix4::zeros(),
            config,
        };
        filter.reset(initial);
        Ok(filter)
    }

    /// Re-initialize the state to `[lat, lon, 0, 0]` and the covariance to
    /// `diag(p0, p0, v0, v0)`.
    pub fn reset(&mut self, at: LatLon) {
        self.x = Vector4::new(at.lat(), at.lon(), 0.0, 0.0);
        self.p = Matrix4::from_diagonal(&Vector4::new(
            self.config.initial_position_var,
            self.config.initial_position_var,
            self.config.initial_velocity_var,
            self.config.initial_velocity_var,
        ));
        debug!("filter reset at {at}");
    }

    /// Propagate the state forward by `dt` seconds under the
    /// constant-velocity model.
    ///
    /// `dt = 0` leaves the state bit-for-bit unchanged.
    ///
    /// # Errors
    /// Returns [`NavError::Domain`] for a negative or non-finite `dt`.
    pub fn predict(&mut self, dt: f64) -> NavResult<()> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(NavError::Domain(format!(
                "prediction interval must be finite and >= 0, got {dt}"
            )));
        }
        if dt == 0.0 {
            return Ok(());
        }
        let mut f = Matrix4::identity();
        f[(0, 2)] = dt;
        f[(1, 3)] = dt;
        let q = Matrix4::from_diagonal(&Vector4::new(
            self.config.process_noise_pos,
            self.config.process_noise_pos,
            self.config.process_noise_vel,
            self.config.process_noise_vel,
        ));
        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + q * dt;
        Ok(())
    }

    /// Sample the anomaly model, folding the degradable outcomes (off-map,
    /// nodata) into `None`.
    fn sample_model<M: AnomalyModel + ?Sized>(
        model: &M,
        lat: f64,
        lon: f64,
    ) -> NavResult<Option<f64>> {
        match model.field_at(lat, lon) {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            Ok(_) => Ok(None),
            Err(e) if e.is_degradable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fuse a scalar total-field anomaly observation against the map.
    ///
    /// Returns the update quality in [0, 1]. Quality 0 means the update was
    /// skipped (observation off the map, nodata in the stencil, or an
    /// ill-conditioned innovation) and the state is exactly the predicted
    /// state.
    ///
    /// # Errors
    /// Returns [`NavError::Domain`] for a non-finite observation; map I/O
    /// failures propagate unchanged.
    pub fn update_field<M: AnomalyModel + ?Sized>(
        &mut self,
        z_obs: f64,
        model: &M,
    ) -> NavResult<f64> {
        if !z_obs.is_finite() {
            return Err(NavError::Domain(format!(
                "non-finite field observation {z_obs}"
            )));
        }
        let (lat, lon) = (self.x[0], self.x[1]);
        let step = self.config.jacobian_step;

        let Some(h0) = Self::sample_model(model, lat, lon)? else {
            debug!("update skipped: no field value at ({lat}, {lon})");
            return Ok(0.0);
        };
        // Central-difference gradient; any unusable sample voids the update
        let samples = [
            Self::sample_model(model, lat + step, lon)?,
            Self::sample_model(model, lat - step, lon)?,
            Self::sample_model(model, lat, lon + step)?,
            Self::sample_model(model, lat, lon - step)?,
        ];
        let [Some(lat_up), Some(lat_down), Some(lon_up), Some(lon_down)] = samples else {
            debug!("update skipped: gradient stencil leaves the map at ({lat}, {lon})");
            return Ok(0.0);
        };
        let h = RowVector4::new(
            (lat_up - lat_down) / (2.0 * step),
            (lon_up - lon_down) / (2.0 * step),
            0.0,
            0.0,
        );

        let r = self.config.measurement_variance;
        let s = (h * self.p * h.transpose())[(0, 0)] + r;
        if s < self.config.innovation_floor {
            warn!("update skipped: innovation covariance {s:.3e} below floor");
            return Ok(0.0);
        }
        let y = z_obs - h0;
        let k = self.p * h.transpose() / s;

        let x_next = self.x + k * y;
        let i_kh = Matrix4::identity() - k * h;
        let p_next = i_kh * self.p * i_kh.transpose() + (k * k.transpose()) * r;
        if !self.commit(x_next, p_next) {
            warn!("update aborted: non-finite candidate state");
            return Ok(0.0);
        }
        Ok((-y * y / (2.0 * s)).exp())
    }

    /// Fuse a direct position observation (the thin HTTP surface's shape).
    ///
    /// Returns the update quality in [0, 1], computed from the normalised
    /// innovation.
    pub fn update_position(&mut self, obs: LatLon) -> NavResult<f64> {
        let h = Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        let r = Matrix2::identity() * self.config.position_variance;
        let s = h * self.p * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            warn!("position update skipped: singular innovation covariance");
            return Ok(0.0);
        };
        let y = Vector2::new(obs.lat() - self.x[0], obs.lon() - self.x[1]);
        let k = self.p * h.transpose() * s_inv;

        let x_next = self.x + k * y;
        let i_kh = Matrix4::identity() - k * h;
        let p_next = i_kh * self.p * i_kh.transpose() + k * r * k.transpose();
        if !self.commit(x_next, p_next) {
            warn!("position update aborted: non-finite candidate state");
            return Ok(0.0);
        }
        let mahalanobis = (y.transpose() * s_inv * y)[(0, 0)];
        Ok((-mahalanobis / 2.0).exp())
    }

    /// Install a candidate state if it is finite; re-symmetrize the
    /// covariance and clamp its diagonal. Returns false (state untouched)
    /// when the candidate is unusable.
    fn commit(&mut self, x: Vector4<f64>, p: Matrix4<f64>) -> bool {
        if x.iter().any(|v| !v.is_finite()) || p.iter().any(|v| !v.is_finite()) {
            return false;
        }
        let mut p = (p + p.transpose()) * 0.5;
        for i in 0..4 {
            if p[(i, i)] < 0.0 {
                p[(i, i)] = 0.0;
            }
        }
        self.x = x;
        self.p = p;
        true
    }

    /// Current position estimate.
    ///
    /// # Errors
    /// Returns [`NavError::Domain`] if the state has drifted outside the
    /// geodetic ranges; callers treat that as a filter divergence signal.
    pub fn estimate(&self) -> NavResult<LatLon> {
        LatLon::new(self.x[0], self.x[1])
    }

    /// Velocity estimate in degrees/second
    pub fn velocity(&self) -> (f64, f64) {
        (self.x[2], self.x[3])
    }

    /// Velocity estimate as north/east meters per second on the mean sphere
    pub fn velocity_ms(&self) -> (f64, f64) {
        let north = self.x[2].to_radians() * MEAN_RADIUS;
        let east = self.x[3].to_radians() * MEAN_RADIUS * self.x[0].to_radians().cos();
        (north, east)
    }

    /// Position standard deviations (deg) from the covariance diagonal
    pub fn position_uncertainty(&self) -> (f64, f64) {
        (self.p[(0, 0)].max(0.0).sqrt(), self.p[(1, 1)].max(0.0).sqrt())
    }

    /// Velocity standard deviations (deg/s) from the covariance diagonal
    pub fn velocity_uncertainty(&self) -> (f64, f64) {
        (self.p[(2, 2)].max(0.0).sqrt(), self.p[(3, 3)].max(0.0).sqrt())
    }

    pub fn covariance(&self) -> &Matrix4<f64> {
        &self.p
    }

    pub fn covariance_diagonal(&self) -> [f64; 4] {
        [
            self.p[(0, 0)],
            self.p[(1, 1)],
            self.p[(2, 2)],
            self.p[(3, 3)],
        ]
    }

    pub fn config(&self) -> &EkfConfig {
        &self.config
    }
}

// === Unit tests ===
#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn plane_model() -> impl AnomalyModel {
        |lat: f64, lon: f64| -> NavResult<f64> { Ok(1000.0 + 500.0 * lat + 300.0 * lon) }
    }

    fn filter_at(lat: f64, lon: f64) -> NavEkf {
        NavEkf::new(LatLon::new(lat, lon).unwrap(), EkfConfig::default()).unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(EkfConfig::default().validate().is_ok());
        let mut bad = EkfConfig::default();
        bad.measurement_variance = 0.0;
        assert!(bad.validate().is_err());
        bad = EkfConfig::default();
        bad.jacobian_step = f64::NAN;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EkfConfig {
            measurement_variance: 9.0,
            ..EkfConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EkfConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn reset_is_exact() {
        let mut ekf = filter_at(10.0, 20.0);
        ekf.predict(5.0).unwrap();
        ekf.reset(LatLon::new(1.5, -2.5).unwrap());
        assert_eq!(ekf.x[0], 1.5);
        assert_eq!(ekf.x[1], -2.5);
        assert_eq!(ekf.x[2], 0.0);
        assert_eq!(ekf.x[3], 0.0);
        let diag = ekf.covariance_diagonal();
        assert_eq!(diag[0], EkfConfig::default().initial_position_var);
        assert_eq!(diag[2], EkfConfig::default().initial_velocity_var);
        assert_eq!(ekf.p[(0, 1)], 0.0);
    }

    #[test]
    fn predict_zero_dt_is_bitwise_noop() {
        let mut ekf = filter_at(5.0, 6.0);
        ekf.predict(1.0).unwrap();
        let x_before = ekf.x;
        let p_before = ekf.p;
        ekf.predict(0.0).unwrap();
        assert_eq!(ekf.x, x_before);
        assert_eq!(ekf.p, p_before);
    }

    #[test]
    fn predict_rejects_invalid_dt() {
        let mut ekf = filter_at(0.0, 0.0);
        assert!(matches!(ekf.predict(-0.5), Err(NavError::Domain(_))));
        assert!(ekf.predict(f64::NAN).is_err());
        assert!(ekf.predict(f64::INFINITY).is_err());
    }

    #[test]
    fn predict_advances_position_by_velocity() {
        let mut ekf = filter_at(0.0, 0.0);
        ekf.x[2] = 0.001; // deg/s north
        ekf.x[3] = -0.002;
        ekf.predict(10.0).unwrap();
        assert_approx_eq!(ekf.x[0], 0.01, 1e-12);
        assert_approx_eq!(ekf.x[1], -0.02, 1e-12);
        // Process noise grew the covariance
        assert!(ekf.p[(0, 0)] > EkfConfig::default().initial_position_var);
    }

    #[test]
    fn update_reduces_error_along_gradient() {
        let model = plane_model();
        let mut ekf = filter_at(0.4, 0.4);
        // Truth at (0.5, 0.5): observation is 1400
        let before = 500.0 * (0.5 - ekf.x[0]) + 300.0 * (0.5 - ekf.x[1]);
        for _ in 0..50 {
            ekf.predict(1.0).unwrap();
            let quality = ekf.update_field(1400.0, &model).unwrap();
            assert!(quality > 0.0 && quality <= 1.0);
        }
        let after = 500.0 * (0.5 - ekf.x[0]) + 300.0 * (0.5 - ekf.x[1]);
        assert!(after.abs() < before.abs() / 100.0);
    }

    #[test]
    fn covariance_stays_symmetric_through_updates() {
        let model = plane_model();
        let mut ekf = filter_at(0.3, 0.3);
        for i in 0..20 {
            ekf.predict(1.0).unwrap();
            ekf.update_field(1400.0 + (i % 3) as f64, &model).unwrap();
            let p = ekf.covariance();
            let asymmetry = (p - p.transpose()).abs().max();
            assert!(asymmetry <= 1e-12);
            for d in ekf.covariance_diagonal() {
                assert!(d >= 0.0);
            }
        }
    }

    #[test]
    fn informative_update_contracts_covariance_trace() {
        let model = plane_model();
        let mut ekf = filter_at(0.4, 0.4);
        ekf.predict(1.0).unwrap();
        let trace_before = ekf.covariance().trace();
        ekf.update_field(1400.0, &model).unwrap();
        assert!(ekf.covariance().trace() < trace_before + 1e-12);
    }

    #[test]
    fn flat_region_update_is_inert() {
        // Constant field: zero gradient, so the gain is zero and the update
        // must not move state or covariance at all.
        let model = |_lat: f64, _lon: f64| -> NavResult<f64> { Ok(750.0) };
        let mut ekf = filter_at(1.0, 1.0);
        ekf.predict(1.0).unwrap();
        let x_before = ekf.x;
        let p_before = ekf.p;
        let quality = ekf.update_field(760.0, &model).unwrap();
        assert_eq!(ekf.x, x_before);
        assert_eq!(ekf.p, p_before);
        // Quality still reflects the innovation against R
        assert!(quality > 0.0 && quality < 1.0);
    }

    #[test]
    fn off_map_update_reports_zero_quality() {
        let model = |_lat: f64, _lon: f64| -> NavResult<f64> {
            Err(NavError::OutOfMap { lat: 0.0, lon: 0.0 })
        };
        let mut ekf = filter_at(0.2, 0.2);
        ekf.predict(1.0).unwrap();
        let x_before = ekf.x;
        let quality = ekf.update_field(1234.0, &model).unwrap();
        assert_eq!(quality, 0.0);
        assert_eq!(ekf.x, x_before);
    }

    #[test]
    fn nodata_update_reports_zero_quality() {
        let model = |_lat: f64, _lon: f64| -> NavResult<f64> { Ok(f64::NAN) };
        let mut ekf = filter_at(0.2, 0.2);
        let quality = ekf.update_field(1234.0, &model).unwrap();
        assert_eq!(quality, 0.0);
    }

    #[test]
    fn partial_stencil_off_map_skips_update() {
        // Centre is on-map but the +lat probe is not
        let model = |lat: f64, _lon: f64| -> NavResult<f64> {
            if lat > 0.2 {
                Err(NavError::OutOfMap { lat, lon: 0.0 })
            } else {
                Ok(100.0)
            }
        };
        let mut ekf = filter_at(0.2, 0.0);
        let quality = ekf.update_field(100.0, &model).unwrap();
        assert_eq!(quality, 0.0);
    }

    #[test]
    fn ill_conditioned_innovation_skips_update() {
        let mut config = EkfConfig::default();
        config.measurement_variance = 1e-13; // below the 1e-12 floor
        let model = |_lat: f64, _lon: f64| -> NavResult<f64> { Ok(500.0) };
        let mut ekf = NavEkf::new(LatLon::new(0.0, 0.0).unwrap(), config).unwrap();
        // Flat model makes S = R < floor
        let quality = ekf.update_field(500.0, &model).unwrap();
        assert_eq!(quality, 0.0);
    }

    #[test]
    fn non_finite_observation_is_a_domain_error() {
        let model = plane_model();
        let mut ekf = filter_at(0.0, 0.0);
        assert!(matches!(
            ekf.update_field(f64::NAN, &model),
            Err(NavError::Domain(_))
        ));
    }

    #[test]
    fn hard_model_errors_propagate() {
        let model =
            |_lat: f64, _lon: f64| -> NavResult<f64> { Err(NavError::MapIo("disk gone".into())) };
        let mut ekf = filter_at(0.0, 0.0);
        assert!(matches!(
            ekf.update_field(100.0, &model),
            Err(NavError::MapIo(_))
        ));
    }

    #[test]
    fn position_update_pulls_toward_observation() {
        let mut ekf = filter_at(0.0, 0.0);
        ekf.predict(1.0).unwrap();
        let quality = ekf
            .update_position(LatLon::new(0.01, -0.01).unwrap())
            .unwrap();
        assert!(quality > 0.0 && quality <= 1.0);
        // Prior variance (1.0) dwarfs the observation variance (1e-6), so
        // the estimate lands essentially on the observation
        assert_approx_eq!(ekf.x[0], 0.01, 1e-5);
        assert_approx_eq!(ekf.x[1], -0.01, 1e-5);
    }

    #[test]
    fn velocity_accessors() {
        let mut ekf = filter_at(45.0, 0.0);
        ekf.x[2] = 1e-4;
        ekf.x[3] = 1e-4;
        let (vlat, vlon) = ekf.velocity();
        assert_eq!(vlat, 1e-4);
        assert_eq!(vlon, 1e-4);
        let (north, east) = ekf.velocity_ms();
        // At 45 degrees the east component shrinks by cos(45)
        assert!(north > 0.0 && east > 0.0);
        assert_approx_eq!(east / north, 45.0_f64.to_radians().cos(), 1e-9);
    }
}
