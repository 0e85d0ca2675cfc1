//! Calibration estimation from collected magnetometer samples.
//!
//! Two estimators are provided. `simple_calibration` mean-centres each axis
//! and leaves the scale at identity; it is adequate when the sensor error is
//! dominated by a hard-iron offset. `ellipsoid_calibration` fits an
//! axis-aligned ellipsoid `(v - o)^T A (v - o) = 1` to the sample cloud in
//! closed form and returns the offset plus a diagonal scale that maps the
//! fitted ellipsoid onto a sphere of its mean radius, correcting per-axis
//! soft-iron distortion as well.
//!
//! The ellipsoid fit linearises the quadric as
//! `a x^2 + b y^2 + c z^2 + d x + e y + f z = 1` and solves the 6x6 normal
//! equations of the least-squares system. The centre falls out as
//! `o = (-d/2a, -e/2b, -f/2c)` and the semi-axes as `sqrt(g / a)` (and
//! likewise for b, c) with `g = 1 + d^2/4a + e^2/4b + f^2/4c`.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};
use crate::sensor::{CalibrationParams, MagneticVector};

/// Minimum sample count for a meaningful fit
pub const MIN_SAMPLES: usize = 8;

/// Calibration estimation method tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMethod {
    Ellipsoid,
    Simple,
}

impl std::str::FromStr for CalibrationMethod {
    type Err = NavError;

    fn from_str(s: &str) -> NavResult<Self> {
        match s {
            "ellipsoid" => Ok(CalibrationMethod::Ellipsoid),
            "simple" => Ok(CalibrationMethod::Simple),
            other => Err(NavError::Config(format!(
                "unsupported calibration method: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationMethod::Ellipsoid => write!(f, "ellipsoid"),
            CalibrationMethod::Simple => write!(f, "simple"),
        }
    }
}

/// Estimate calibration parameters with the requested method.
pub fn estimate(
    samples: &[MagneticVector],
    method: CalibrationMethod,
) -> NavResult<CalibrationParams> {
    match method {
        CalibrationMethod::Simple => simple_calibration(samples),
        CalibrationMethod::Ellipsoid => ellipsoid_calibration(samples),
    }
}

fn validate_samples(samples: &[MagneticVector]) -> NavResult<()> {
    if samples.len() < MIN_SAMPLES {
        return Err(NavError::Config(format!(
            "at least {MIN_SAMPLES} samples required, got {}",
            samples.len()
        )));
    }
    if samples.iter().any(|s| !s.is_finite()) {
        return Err(NavError::Config("samples must be finite".into()));
    }
    Ok(())
}

/// Per-axis mean-centre with unit scale.
pub fn simple_calibration(samples: &[MagneticVector]) -> NavResult<CalibrationParams> {
    validate_samples(samples)?;
    let n = samples.len() as f64;
    let sum = samples
        .iter()
        .fold(Vector3::zeros(), |acc, s| acc + Vector3::from(*s));
    CalibrationParams::new(sum / n, Matrix3::identity())
}

/// Least-squares axis-aligned ellipsoid fit.
///
/// # Errors
/// Returns [`NavError::Config`] when there are too few samples, the normal
/// equations are singular (degenerate sample geometry, e.g. coplanar
/// points), or the fitted quadric is not an ellipsoid (a non-positive
/// quadratic coefficient).
pub fn ellipsoid_calibration(samples: &[MagneticVector]) -> NavResult<CalibrationParams> {
    validate_samples(samples)?;

    let n = samples.len();
    let mut design = DMatrix::zeros(n, 6);
    for (i, s) in samples.iter().enumerate() {
        design[(i, 0)] = s.bx * s.bx;
        design[(i, 1)] = s.by * s.by;
        design[(i, 2)] = s.bz * s.bz;
        design[(i, 3)] = s.bx;
        design[(i, 4)] = s.by;
        design[(i, 5)] = s.bz;
    }
    let rhs = DVector::from_element(n, 1.0);

    // Normal equations of the linearised quadric
    let normal = design.transpose() * &design;
    let projected = design.transpose() * rhs;
    let coefficients = normal
        .lu()
        .solve(&projected)
        .ok_or_else(|| NavError::Config("degenerate sample geometry for ellipsoid fit".into()))?;

    let (a, b, c) = (coefficients[0], coefficients[1], coefficients[2]);
    let (d, e, f) = (coefficients[3], coefficients[4], coefficients[5]);
    if a <= 0.0 || b <= 0.0 || c <= 0.0 {
        return Err(NavError::Config(
            "fitted quadric is not an ellipsoid".into(),
        ));
    }

    let offset = Vector3::new(-d / (2.0 * a), -e / (2.0 * b), -f / (2.0 * c));
    let g = 1.0 + d * d / (4.0 * a) + e * e / (4.0 * b) + f * f / (4.0 * c);
    if g <= 0.0 {
        return Err(NavError::Config(
            "fitted quadric has no real semi-axes".into(),
        ));
    }
    let radii = Vector3::new((g / a).sqrt(), (g / b).sqrt(), (g / c).sqrt());
    let mean_radius = (radii.x + radii.y + radii.z) / 3.0;
    let scale = Matrix3::from_diagonal(&Vector3::new(
        mean_radius / radii.x,
        mean_radius / radii.y,
        mean_radius / radii.z,
    ));
    CalibrationParams::new(offset, scale)
}
