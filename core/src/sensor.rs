//! Magnetometer-related code for the navigation system.
//!
//! This module defines the raw measurement type, hard/soft-iron calibration
//! parameters, the moving-average conditioning window, and a small driver
//! seam so the same facade runs against hardware or the deterministic mock
//! used in tests. Samples are transient: a vector passed into the
//! conditioning path does not outlive the call that consumed it.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display};

use crate::error::{NavError, NavResult};

/// Magnetic-field vector components in nano-tesla (nT)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MagneticVector {
    pub bx: f64,
    pub by: f64,
    pub bz: f64,
}

impl MagneticVector {
    pub fn new(bx: f64, by: f64, bz: f64) -> Self {
        MagneticVector { bx, by, bz }
    }

    /// Scalar total field |B| in nT
    pub fn magnitude(&self) -> f64 {
        (self.bx * self.bx + self.by * self.by + self.bz * self.bz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.bx.is_finite() && self.by.is_finite() && self.bz.is_finite()
    }
}

impl Display for MagneticVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B({:.1}, {:.1}, {:.1}) nT", self.bx, self.by, self.bz)
    }
}

impl From<MagneticVector> for Vector3<f64> {
    fn from(v: MagneticVector) -> Self {
        Vector3::new(v.bx, v.by, v.bz)
    }
}

impl From<Vector3<f64>> for MagneticVector {
    fn from(v: Vector3<f64>) -> Self {
        MagneticVector::new(v.x, v.y, v.z)
    }
}

/// Hard/soft-iron calibration: `apply(v) = scale * (v - offset)`.
///
/// The scale matrix is validated and inverted at construction so the
/// inverse mapping is always available; a singular or non-finite matrix is
/// a construction failure, not a runtime surprise.
#[derive(Clone, Debug)]
pub struct CalibrationParams {
    offset: Vector3<f64>,
    scale: Matrix3<f64>,
    scale_inverse: Matrix3<f64>,
}

impl CalibrationParams {
    /// Build calibration parameters from a hard-iron offset and a soft-iron
    /// scale matrix.
    ///
    /// # Errors
    /// Returns [`NavError::Config`] when the matrix has non-finite entries
    /// or is not invertible.
    pub fn new(offset: Vector3<f64>, scale: Matrix3<f64>) -> NavResult<Self> {
        if offset.iter().any(|v| !v.is_finite()) || scale.iter().any(|v| !v.is_finite()) {
            return Err(NavError::Config(
                "calibration parameters must be finite".into(),
            ));
        }
        let scale_inverse = scale
            .try_inverse()
            .ok_or_else(|| NavError::Config("calibration scale matrix is singular".into()))?;
        Ok(CalibrationParams {
            offset,
            scale,
            scale_inverse,
        })
    }

    /// No-op calibration (zero offset, identity scale)
    pub fn identity() -> Self {
        CalibrationParams {
            offset: Vector3::zeros(),
            scale: Matrix3::identity(),
            scale_inverse: Matrix3::identity(),
        }
    }

    pub fn offset(&self) -> &Vector3<f64> {
        &self.offset
    }

    pub fn scale(&self) -> &Matrix3<f64> {
        &self.scale
    }

    /// Correct a raw reading: `scale * (v - offset)`
    pub fn apply(&self, raw: &MagneticVector) -> MagneticVector {
        let corrected = self.scale * (Vector3::from(*raw) - self.offset);
        corrected.into()
    }

    /// Undo [`apply`](Self::apply): `scale^-1 * v + offset`.
    ///
    /// For well-conditioned scale matrices the round trip reproduces the
    /// input to 1e-9 relative error.
    pub fn inverse_apply(&self, corrected: &MagneticVector) -> MagneticVector {
        let raw = self.scale_inverse * Vector3::from(*corrected) + self.offset;
        raw.into()
    }
}

/// Basic magnetometer specification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    sample_rate_hz: f64,
    noise_std_nt: f64,
}

impl SensorSpec {
    /// # Errors
    /// Returns [`NavError::Config`] when `sample_rate_hz <= 0` or the noise
    /// figure is negative or non-finite.
    pub fn new(sample_rate_hz: f64, noise_std_nt: f64) -> NavResult<Self> {
        if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
            return Err(NavError::Config(format!(
                "sample_rate_hz must be > 0, got {sample_rate_hz}"
            )));
        }
        if !noise_std_nt.is_finite() || noise_std_nt < 0.0 {
            return Err(NavError::Config(format!(
                "noise_std_nt must be >= 0, got {noise_std_nt}"
            )));
        }
        Ok(SensorSpec {
            sample_rate_hz,
            noise_std_nt,
        })
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    pub fn noise_std_nt(&self) -> f64 {
        self.noise_std_nt
    }

    /// Measurement variance (nT^2) handed to the filter as R
    pub fn measurement_variance(&self) -> f64 {
        self.noise_std_nt * self.noise_std_nt
    }
}

/// Sliding-window moving average over the incoming sample stream.
///
/// Holds the last `window` samples and returns the component-wise mean over
/// whatever is present. A fresh instance starts empty; state survives a
/// restart only through [`snapshot`](Self::snapshot) /
/// [`from_snapshot`](Self::from_snapshot).
#[derive(Clone, Debug)]
pub struct MovingAverageFilter {
    window: usize,
    buffer: VecDeque<MagneticVector>,
}

impl MovingAverageFilter {
    /// # Errors
    /// Returns [`NavError::Config`] when `window == 0`.
    pub fn new(window: usize) -> NavResult<Self> {
        if window == 0 {
            return Err(NavError::Config("window size must be > 0".into()));
        }
        Ok(MovingAverageFilter {
            window,
            buffer: VecDeque::with_capacity(window),
        })
    }

    /// Rebuild a filter from a previously captured snapshot. Only the most
    /// recent `window` samples of `state` are retained.
    pub fn from_snapshot(window: usize, state: &[MagneticVector]) -> NavResult<Self> {
        let mut filter = Self::new(window)?;
        let start = state.len().saturating_sub(window);
        for sample in &state[start..] {
            filter.buffer.push_back(*sample);
        }
        Ok(filter)
    }

    /// Append a sample and return the mean over the samples present.
    pub fn update(&mut self, sample: MagneticVector) -> MagneticVector {
        if self.buffer.len() == self.window {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
        let n = self.buffer.len() as f64;
        let sum = self
            .buffer
            .iter()
            .fold(Vector3::zeros(), |acc, v| acc + Vector3::from(*v));
        (sum / n).into()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Copy of the internal buffer, oldest first, for persistence
    pub fn snapshot(&self) -> Vec<MagneticVector> {
        self.buffer.iter().copied().collect()
    }
}

/// Seam that real and mock magnetometer drivers implement
pub trait Driver: Send {
    /// Return a raw magnetic vector in nano-tesla
    fn read(&mut self) -> MagneticVector;
}

/// Deterministic mock driver cycling through pre-programmed samples
pub struct MockDriver {
    samples: Vec<MagneticVector>,
    index: usize,
}

impl MockDriver {
    /// # Errors
    /// Returns [`NavError::Config`] when `samples` is empty.
    pub fn new(samples: Vec<MagneticVector>) -> NavResult<Self> {
        if samples.is_empty() {
            return Err(NavError::Config("at least one sample required".into()));
        }
        Ok(MockDriver { samples, index: 0 })
    }
}

impl Driver for MockDriver {
    fn read(&mut self) -> MagneticVector {
        let sample = self.samples[self.index];
        self.index = (self.index + 1) % self.samples.len();
        sample
    }
}

/// High-level sensor facade: driver -> calibration -> moving average
pub struct Magnetometer<D: Driver> {
    driver: D,
    calibration: CalibrationParams,
    filter: MovingAverageFilter,
}

impl<D: Driver> Magnetometer<D> {
    pub fn new(driver: D, calibration: CalibrationParams, window: usize) -> NavResult<Self> {
        Ok(Magnetometer {
            driver,
            calibration,
            filter: MovingAverageFilter::new(window)?,
        })
    }

    /// Return a calibrated, smoothed magnetic vector
    pub fn read(&mut self) -> MagneticVector {
        let raw = self.driver.read();
        let calibrated = self.calibration.apply(&raw);
        self.filter.update(calibrated)
    }
}

// === Unit tests ===
#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const EPS: f64 = 1e-12;

    #[test]
    fn magnitude_of_pythagorean_vector() {
        let v = MagneticVector::new(3.0, 4.0, 12.0);
        assert_approx_eq!(v.magnitude(), 13.0, EPS);
    }

    #[test]
    fn calibration_apply_and_inverse_round_trip() {
        let offset = Vector3::new(120.0, -45.0, 12.5);
        let scale = Matrix3::new(1.02, 0.01, 0.0, 0.01, 0.98, -0.02, 0.0, -0.02, 1.05);
        let cal = CalibrationParams::new(offset, scale).unwrap();
        // Property: inverse(apply(v)) reproduces v to 1e-9 relative
        for &(bx, by, bz) in &[
            (22000.0, 5000.0, 41000.0),
            (-18000.0, 30.0, -2.0),
            (0.0, 0.0, 0.0),
            (1e-3, -1e-3, 1e-3),
        ] {
            let v = MagneticVector::new(bx, by, bz);
            let round = cal.inverse_apply(&cal.apply(&v));
            let norm = v.magnitude().max(1.0);
            assert!((round.bx - v.bx).abs() / norm < 1e-9);
            assert!((round.by - v.by).abs() / norm < 1e-9);
            assert!((round.bz - v.bz).abs() / norm < 1e-9);
        }
    }

    #[test]
    fn calibration_rejects_singular_scale() {
        let singular = Matrix3::new(1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        assert!(matches!(
            CalibrationParams::new(Vector3::zeros(), singular),
            Err(NavError::Config(_))
        ));
    }

    #[test]
    fn calibration_rejects_non_finite() {
        let mut scale = Matrix3::identity();
        scale[(1, 1)] = f64::NAN;
        assert!(CalibrationParams::new(Vector3::zeros(), scale).is_err());
        assert!(
            CalibrationParams::new(Vector3::new(f64::INFINITY, 0.0, 0.0), Matrix3::identity())
                .is_err()
        );
    }

    #[test]
    fn sensor_spec_validation() {
        assert!(SensorSpec::new(10.0, 5.0).is_ok());
        assert!(SensorSpec::new(0.0, 5.0).is_err());
        assert!(SensorSpec::new(-1.0, 5.0).is_err());
        assert!(SensorSpec::new(10.0, -0.1).is_err());
        let spec = SensorSpec::new(50.0, 3.0).unwrap();
        assert_approx_eq!(spec.measurement_variance(), 9.0, EPS);
    }

    #[test]
    fn moving_average_partial_then_full_window() {
        let mut filter = MovingAverageFilter::new(3).unwrap();
        let mean1 = filter.update(MagneticVector::new(3.0, 0.0, 0.0));
        assert_approx_eq!(mean1.bx, 3.0, EPS);
        let mean2 = filter.update(MagneticVector::new(6.0, 0.0, 0.0));
        assert_approx_eq!(mean2.bx, 4.5, EPS);
        let mean3 = filter.update(MagneticVector::new(9.0, 0.0, 0.0));
        assert_approx_eq!(mean3.bx, 6.0, EPS);
        // Fourth sample pushes the first one out
        let mean4 = filter.update(MagneticVector::new(12.0, 0.0, 0.0));
        assert_approx_eq!(mean4.bx, 9.0, EPS);
        assert_eq!(filter.len(), 3);
    }

    #[test]
    fn moving_average_rejects_zero_window() {
        assert!(matches!(
            MovingAverageFilter::new(0),
            Err(NavError::Config(_))
        ));
    }

    #[test]
    fn moving_average_snapshot_round_trip() {
        let mut filter = MovingAverageFilter::new(2).unwrap();
        filter.update(MagneticVector::new(1.0, 1.0, 1.0));
        filter.update(MagneticVector::new(2.0, 2.0, 2.0));
        let snapshot = filter.snapshot();
        let mut restored = MovingAverageFilter::from_snapshot(2, &snapshot).unwrap();
        let mean = restored.update(MagneticVector::new(3.0, 3.0, 3.0));
        // Window of two: mean over {2, 3}
        assert_approx_eq!(mean.bx, 2.5, EPS);
    }

    #[test]
    fn snapshot_truncates_to_window() {
        let samples = vec![
            MagneticVector::new(1.0, 0.0, 0.0),
            MagneticVector::new(2.0, 0.0, 0.0),
            MagneticVector::new(3.0, 0.0, 0.0),
        ];
        let restored = MovingAverageFilter::from_snapshot(2, &samples).unwrap();
        assert_eq!(restored.len(), 2);
        let kept = restored.snapshot();
        assert_approx_eq!(kept[0].bx, 2.0, EPS);
        assert_approx_eq!(kept[1].bx, 3.0, EPS);
    }

    #[test]
    fn mock_driver_cycles() {
        let mut driver = MockDriver::new(vec![
            MagneticVector::new(1.0, 0.0, 0.0),
            MagneticVector::new(2.0, 0.0, 0.0),
        ])
        .unwrap();
        assert_approx_eq!(driver.read().bx, 1.0, EPS);
        assert_approx_eq!(driver.read().bx, 2.0, EPS);
        assert_approx_eq!(driver.read().bx, 1.0, EPS);
    }

    #[test]
    fn magnetometer_applies_calibration_and_smoothing() {
        let driver = MockDriver::new(vec![
            MagneticVector::new(110.0, 0.0, 0.0),
            MagneticVector::new(130.0, 0.0, 0.0),
        ])
        .unwrap();
        let cal =
            CalibrationParams::new(Vector3::new(100.0, 0.0, 0.0), Matrix3::identity()).unwrap();
        let mut mag = Magnetometer::new(driver, cal, 2).unwrap();
        assert_approx_eq!(mag.read().bx, 10.0, EPS);
        // Mean of calibrated {10, 30}
        assert_approx_eq!(mag.read().bx, 20.0, EPS);
    }
}
