//! Tool-call operations exposed to AI assistants.
//!
//! Each tool takes loosely-typed JSON arguments, validates them into a
//! typed struct, runs against the shared navigation service, and returns a
//! JSON value. Argument errors surface as [`NavError::Domain`] so the
//! transport maps them to 400; everything else keeps its service-level
//! error kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use magnav::calibrate::{self, CalibrationMethod};
use magnav::geo::LatLon;
use magnav::map::InterpMethod;
use magnav::sensor::MagneticVector;
use magnav::service::NavService;
use magnav::sim::{self, PathKind, TrajectoryConfig, TrajectorySample};
use magnav::{NavError, NavResult};

fn parse_args<T: for<'de> Deserialize<'de>>(arguments: Value) -> NavResult<T> {
    serde_json::from_value(arguments)
        .map_err(|e| NavError::Domain(format!("invalid tool arguments: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> NavResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| NavError::Numeric(format!("response serialization: {e}")))
}

#[derive(Debug, Deserialize)]
struct QueryFieldArgs {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    interpolation_method: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryFieldResponse {
    value: f64,
    unit: &'static str,
    method: String,
}

/// `query_magnetic_field(latitude, longitude, interpolation_method?)`
pub fn query_magnetic_field(service: &NavService, arguments: Value) -> NavResult<Value> {
    let args: QueryFieldArgs = parse_args(arguments)?;
    let method = match args.interpolation_method.as_deref() {
        Some(name) => name.parse::<InterpMethod>()?,
        None => InterpMethod::Bilinear,
    };
    let value = service.query_field(args.latitude, args.longitude, method)?;
    to_value(&QueryFieldResponse {
        value,
        unit: "nT",
        method: method.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct EstimatePositionArgs {
    magnetic_field: f64,
    #[serde(default)]
    initial_latitude: Option<f64>,
    #[serde(default)]
    initial_longitude: Option<f64>,
    #[serde(default)]
    dt: Option<f64>,
    #[serde(default)]
    reset: Option<bool>,
}

/// `estimate_position(magnetic_field, initial_latitude?, initial_longitude?,
/// dt?, reset?)`
///
/// A reset is performed when `reset` is true or when both initial
/// coordinates are supplied; an explicit reset without coordinates is
/// rejected rather than guessed.
pub fn estimate_position(service: &NavService, arguments: Value) -> NavResult<Value> {
    let args: EstimatePositionArgs = parse_args(arguments)?;
    let dt = args.dt.unwrap_or(1.0);
    let wants_reset = args.reset.unwrap_or(false)
        || (args.initial_latitude.is_some() && args.initial_longitude.is_some());
    if wants_reset {
        let lat = args.initial_latitude.ok_or_else(|| {
            NavError::Domain("reset requires initial_latitude".into())
        })?;
        let lon = args.initial_longitude.ok_or_else(|| {
            NavError::Domain("reset requires initial_longitude".into())
        })?;
        service.reset(LatLon::new(lat, lon)?);
    }
    let estimate = service.observe_scalar(args.magnetic_field, dt)?;
    to_value(&estimate)
}

#[derive(Debug, Deserialize)]
struct CalibrateArgs {
    samples: Vec<[f64; 3]>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, Serialize)]
struct CalibrateResponse {
    offset: [f64; 3],
    scale: [[f64; 3]; 3],
    method: String,
    samples_used: usize,
}

/// `calibrate_sensor(samples, method?)` with `method` defaulting to the
/// ellipsoid fit.
pub fn calibrate_sensor(arguments: Value) -> NavResult<Value> {
    let args: CalibrateArgs = parse_args(arguments)?;
    let method = match args.method.as_deref() {
        Some(name) => name.parse::<CalibrationMethod>()?,
        None => CalibrationMethod::Ellipsoid,
    };
    let samples: Vec<MagneticVector> = args
        .samples
        .iter()
        .map(|[bx, by, bz]| MagneticVector::new(*bx, *by, *bz))
        .collect();
    let params = calibrate::estimate(&samples, method)?;

    let offset = params.offset();
    let scale = params.scale();
    let mut scale_rows = [[0.0; 3]; 3];
    for (i, row) in scale_rows.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = scale[(i, j)];
        }
    }
    to_value(&CalibrateResponse {
        offset: [offset.x, offset.y, offset.z],
        scale: scale_rows,
        method: method.to_string(),
        samples_used: samples.len(),
    })
}

#[derive(Debug, Deserialize)]
struct SimulateArgs {
    start_latitude: f64,
    start_longitude: f64,
    end_latitude: f64,
    end_longitude: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    sample_rate: Option<f64>,
    #[serde(default)]
    noise_level: Option<f64>,
    #[serde(default)]
    path_type: Option<String>,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SimulateResponse {
    samples: Vec<TrajectorySample>,
}

/// `simulate_trajectory(start, end, speed?, sample_rate?, noise_level?,
/// path_type?, seed?)` against the loaded map.
pub fn simulate_trajectory(service: &NavService, arguments: Value) -> NavResult<Value> {
    let args: SimulateArgs = parse_args(arguments)?;
    let start = LatLon::new(args.start_latitude, args.start_longitude)?;
    let end = LatLon::new(args.end_latitude, args.end_longitude)?;
    let mut config = TrajectoryConfig::new(start, end);
    if let Some(speed) = args.speed {
        config.speed_mps = speed;
    }
    if let Some(rate) = args.sample_rate {
        config.sample_rate_hz = rate;
    }
    if let Some(noise) = args.noise_level {
        config.noise_std_nt = noise;
    }
    if let Some(path) = args.path_type.as_deref() {
        config.path = path.parse::<PathKind>()?;
    }
    config.seed = args.seed.unwrap_or(0);

    let map = service.map_handle()?;
    let samples = sim::simulate_trajectory(&config, map.as_ref())?;
    to_value(&SimulateResponse { samples })
}
