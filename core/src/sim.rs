//! Trajectory simulation utilities for tests and demos.
//!
//! Generates deterministic platform tracks between two positions, samples
//! the anomaly model along them, and adds seeded Gaussian measurement
//! noise. The same seed always reproduces the same sequence, which is what
//! makes the end-to-end filter tests repeatable. Points that fall off the
//! map carry NaN field values rather than failing the whole run; the filter
//! under test is expected to degrade on them, and the simulator should not
//! hide that case.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};
use crate::geo::{self, LatLon};
use crate::AnomalyModel;

/// Shape of the simulated track
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    #[default]
    Straight,
    Curved,
    Random,
}

impl std::str::FromStr for PathKind {
    type Err = NavError;

    fn from_str(s: &str) -> NavResult<Self> {
        match s {
            "straight" => Ok(PathKind::Straight),
            "curved" => Ok(PathKind::Curved),
            "random" => Ok(PathKind::Random),
            other => Err(NavError::Config(format!("unsupported path type: {other}"))),
        }
    }
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathKind::Straight => write!(f, "straight"),
            PathKind::Curved => write!(f, "curved"),
            PathKind::Random => write!(f, "random"),
        }
    }
}

/// Simulation parameters. The seed is explicit: there is no ambient
/// randomness anywhere in the simulator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrajectoryConfig {
    pub start: LatLon,
    pub end: LatLon,
    /// Platform speed in meters per second
    pub speed_mps: f64,
    /// Measurement rate in Hz
    pub sample_rate_hz: f64,
    /// Gaussian noise standard deviation on the field, nT
    pub noise_std_nt: f64,
    pub path: PathKind,
    pub seed: u64,
}

impl TrajectoryConfig {
    /// Defaults matching a slow survey platform: 10 m/s, 1 Hz, 5 nT noise,
    /// straight path.
    pub fn new(start: LatLon, end: LatLon) -> Self {
        TrajectoryConfig {
            start,
            end,
            speed_mps: 10.0,
            sample_rate_hz: 1.0,
            noise_std_nt: 5.0,
            path: PathKind::Straight,
            seed: 0,
        }
    }

    /// # Errors
    /// Returns [`NavError::Config`] for a non-positive speed or sample
    /// rate, or a negative/non-finite noise level.
    pub fn validate(&self) -> NavResult<()> {
        if !self.speed_mps.is_finite() || self.speed_mps <= 0.0 {
            return Err(NavError::Config(format!(
                "speed must be > 0 m/s, got {}",
                self.speed_mps
            )));
        }
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 {
            return Err(NavError::Config(format!(
                "sample rate must be > 0 Hz, got {}",
                self.sample_rate_hz
            )));
        }
        if !self.noise_std_nt.is_finite() || self.noise_std_nt < 0.0 {
            return Err(NavError::Config(format!(
                "noise level must be >= 0 nT, got {}",
                self.noise_std_nt
            )));
        }
        Ok(())
    }
}

/// One simulated observation
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TrajectorySample {
    /// Elapsed time in seconds
    pub t: f64,
    pub lat: f64,
    pub lon: f64,
    /// Map field at the true position; NaN off the map
    pub b_true: f64,
    /// `b_true` plus measurement noise; NaN off the map
    pub b_noisy: f64,
}

/// Cross-track amplitude of the curved path, as a fraction of track length
const CURVE_AMPLITUDE: f64 = 0.1;
/// Per-step random-walk standard deviation, as a fraction of track length
const WALK_STEP: f64 = 0.01;

/// Generate `(t, lat, lon, b_true, b_noisy)` samples along the configured
/// path.
///
/// # Errors
/// - [`NavError::Config`] for invalid parameters.
/// - [`NavError::Domain`] when a generated position leaves the geodetic
///   ranges (e.g. a track over a pole).
/// - Hard map errors ([`NavError::MapIo`]) propagate; off-map points yield
///   NaN field values instead.
pub fn simulate_trajectory<M: AnomalyModel + ?Sized>(
    config: &TrajectoryConfig,
    model: &M,
) -> NavResult<Vec<TrajectorySample>> {
    config.validate()?;
    let (north, east) = geo::ne_offset_m(&config.start, &config.end);
    let distance = north.hypot(east);
    let total_time = distance / config.speed_mps;
    let count = ((total_time * config.sample_rate_hz).round() as usize).max(2);
    debug!(
        "simulating {count} samples over {distance:.1} m ({}) with seed {}",
        config.path, config.seed
    );

    // Unit cross-track direction; zero for a degenerate (stationary) track
    let (cross_n, cross_e) = if distance > 0.0 {
        (-east / distance, north / distance)
    } else {
        (0.0, 0.0)
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let noise = Normal::new(0.0, config.noise_std_nt)
        .map_err(|e| NavError::Config(format!("noise distribution: {e}")))?;
    let walk = Normal::new(0.0, distance * WALK_STEP)
        .map_err(|e| NavError::Config(format!("walk distribution: {e}")))?;

    let mut samples = Vec::with_capacity(count);
    let mut wander = 0.0;
    for i in 0..count {
        let s = i as f64 / (count - 1) as f64;
        let along_lat = config.start.lat() + s * (config.end.lat() - config.start.lat());
        let along_lon = config.start.lon() + s * (config.end.lon() - config.start.lon());
        let base = LatLon::new(along_lat, along_lon)?;

        // Endpoint pinning: both deviations vanish at s = 0 and s = 1
        let offset_m = match config.path {
            PathKind::Straight => 0.0,
            PathKind::Curved => CURVE_AMPLITUDE * distance * (std::f64::consts::PI * s).sin(),
            PathKind::Random => {
                wander += walk.sample(&mut rng);
                wander * (std::f64::consts::PI * s).sin()
            }
        };
        let position = if offset_m == 0.0 {
            base
        } else {
            geo::offset_by_meters(&base, cross_n * offset_m, cross_e * offset_m)?
        };

        let b_true = match model.field_at(position.lat(), position.lon()) {
            Ok(value) => value,
            Err(e) if e.is_degradable() => f64::NAN,
            Err(e) => return Err(e),
        };
        let b_noisy = if b_true.is_finite() {
            b_true + noise.sample(&mut rng)
        } else {
            f64::NAN
        };
        samples.push(TrajectorySample {
            t: i as f64 / config.sample_rate_hz,
            lat: position.lat(),
            lon: position.lon(),
            b_true,
            b_noisy,
        });
    }
    Ok(samples)
}

/// Random jittered positions around the origin reference point, within
/// roughly 100 m (0.001 degrees). Backs the CLI `simulate` subcommand.
pub fn random_walk_positions(steps: usize, seed: u64) -> Vec<LatLon> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..steps)
        .map(|_| {
            let lat = rng.gen_range(-0.001..0.001);
            let lon = rng.gen_range(-0.001..0.001);
            LatLon::new(lat, lon).expect("jitter stays inside geodetic ranges")
        })
        .collect()
}

// === Unit tests ===
#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn plane_model() -> impl AnomalyModel {
        |lat: f64, lon: f64| -> NavResult<f64> { Ok(1000.0 + 500.0 * lat + 300.0 * lon) }
    }

    fn base_config() -> TrajectoryConfig {
        TrajectoryConfig {
            seed: 42,
            ..TrajectoryConfig::new(
                LatLon::new(0.0, 0.0).unwrap(),
                LatLon::new(0.009, 0.0).unwrap(),
            )
        }
    }

    #[test]
    fn validation_rejects_bad_parameters() {
        let mut config = base_config();
        config.speed_mps = 0.0;
        assert!(config.validate().is_err());
        config = base_config();
        config.sample_rate_hz = -1.0;
        assert!(config.validate().is_err());
        config = base_config();
        config.noise_std_nt = -0.5;
        assert!(config.validate().is_err());
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn same_seed_reproduces_the_sequence() {
        let model = plane_model();
        let config = base_config();
        let a = simulate_trajectory(&config, &model).unwrap();
        let b = simulate_trajectory(&config, &model).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.lat, y.lat);
            assert_eq!(x.lon, y.lon);
            assert_eq!(x.b_noisy, y.b_noisy);
        }
        let mut other = config;
        other.seed = 43;
        let c = simulate_trajectory(&other, &model).unwrap();
        assert!(a.iter().zip(&c).any(|(x, y)| x.b_noisy != y.b_noisy));
    }

    #[test]
    fn straight_path_hits_both_endpoints() {
        let model = plane_model();
        let config = base_config();
        let samples = simulate_trajectory(&config, &model).unwrap();
        assert!(samples.len() >= 2);
        let first = samples.first().unwrap();
        let last = samples.last().unwrap();
        assert_approx_eq!(first.lat, 0.0, 1e-12);
        assert_approx_eq!(last.lat, 0.009, 1e-12);
        // Sample spacing follows the configured rate
        assert_approx_eq!(samples[1].t - samples[0].t, 1.0, 1e-12);
    }

    #[test]
    fn zero_noise_means_exact_field_values() {
        let model = plane_model();
        let mut config = base_config();
        config.noise_std_nt = 0.0;
        let samples = simulate_trajectory(&config, &model).unwrap();
        for sample in samples {
            assert_eq!(sample.b_true, sample.b_noisy);
            assert_approx_eq!(
                sample.b_true,
                1000.0 + 500.0 * sample.lat + 300.0 * sample.lon,
                1e-9
            );
        }
    }

    #[test]
    fn curved_path_deviates_cross_track_but_pins_endpoints() {
        let model = plane_model();
        let mut config = base_config();
        config.path = PathKind::Curved;
        let samples = simulate_trajectory(&config, &model).unwrap();
        let first = samples.first().unwrap();
        let last = samples.last().unwrap();
        assert_approx_eq!(first.lon, 0.0, 1e-12);
        assert_approx_eq!(last.lon, 0.0, 1e-12);
        // The northbound track bends in longitude mid-way
        let mid = &samples[samples.len() / 2];
        assert!(mid.lon.abs() > 1e-6);
    }

    #[test]
    fn random_path_is_seeded_and_pinned() {
        let model = plane_model();
        let mut config = base_config();
        config.path = PathKind::Random;
        let a = simulate_trajectory(&config, &model).unwrap();
        let b = simulate_trajectory(&config, &model).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.lon, y.lon);
        }
        assert_approx_eq!(a.first().unwrap().lon, 0.0, 1e-12);
        assert_approx_eq!(a.last().unwrap().lon, 0.0, 1e-12);
    }

    #[test]
    fn off_map_points_carry_nan() {
        let model = |lat: f64, lon: f64| -> NavResult<f64> {
            if lat > 0.005 {
                Err(NavError::OutOfMap { lat, lon })
            } else {
                Ok(100.0)
            }
        };
        let samples = simulate_trajectory(&base_config(), &model).unwrap();
        assert!(samples.iter().any(|s| s.b_true.is_nan()));
        assert!(samples.iter().any(|s| s.b_true.is_finite()));
        for sample in &samples {
            assert_eq!(sample.b_true.is_nan(), sample.b_noisy.is_nan());
        }
    }

    #[test]
    fn hard_map_errors_propagate() {
        let model =
            |_lat: f64, _lon: f64| -> NavResult<f64> { Err(NavError::MapIo("gone".into())) };
        assert!(matches!(
            simulate_trajectory(&base_config(), &model),
            Err(NavError::MapIo(_))
        ));
    }

    #[test]
    fn random_walk_positions_are_bounded_and_seeded() {
        let a = random_walk_positions(25, 7);
        let b = random_walk_positions(25, 7);
        assert_eq!(a.len(), 25);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x, y);
            assert!(x.lat().abs() < 0.001);
            assert!(x.lon().abs() < 0.001);
        }
        let c = random_walk_positions(25, 8);
        assert!(a.iter().zip(&c).any(|(x, y)| x != y));
    }

    #[test]
    fn path_kind_parsing() {
        assert_eq!("straight".parse::<PathKind>().unwrap(), PathKind::Straight);
        assert_eq!("curved".parse::<PathKind>().unwrap(), PathKind::Curved);
        assert_eq!("random".parse::<PathKind>().unwrap(), PathKind::Random);
        assert!("zigzag".parse::<PathKind>().is_err());
    }
}
