//! NetCDF raster loader.
//!
//! Expects one 2-D anomaly variable indexed by explicit `lat` and `lon`
//! coordinate vectors. The coordinate vectors define the grid geometry
//! directly (values are cell centres), so they must be strictly monotonic
//! and uniformly spaced; spacing jitter beyond 1e-9 relative is a format
//! error rather than something to silently average over. A `_FillValue`
//! attribute on the data variable is honoured as the nodata sentinel.

use std::path::Path;

use log::info;

use crate::error::{NavError, NavResult};
use crate::map::{GridSource, MapHeader};

/// Coordinate variable names probed, in order
const LAT_NAMES: [&str; 2] = ["lat", "latitude"];
const LON_NAMES: [&str; 2] = ["lon", "longitude"];
/// Data variable names probed before falling back to any 2-D variable
const DATA_NAMES: [&str; 3] = ["z", "magnetic_anomaly", "anomaly"];

/// Relative tolerance on coordinate spacing uniformity
const SPACING_TOLERANCE: f64 = 1e-9;

/// Verify strict monotonicity and uniform spacing; returns the step.
fn uniform_step(values: &[f64], name: &str) -> NavResult<f64> {
    if values.len() < 2 {
        return Err(NavError::MapFormat(format!(
            "coordinate '{name}' needs at least 2 entries"
        )));
    }
    let step = values[1] - values[0];
    if step == 0.0 || !step.is_finite() {
        return Err(NavError::MapFormat(format!(
            "coordinate '{name}' is not strictly monotonic"
        )));
    }
    for window in values.windows(2) {
        let delta = window[1] - window[0];
        if delta * step <= 0.0 {
            return Err(NavError::MapFormat(format!(
                "coordinate '{name}' is not strictly monotonic"
            )));
        }
        if (delta - step).abs() > SPACING_TOLERANCE * step.abs() {
            return Err(NavError::MapFormat(format!(
                "coordinate '{name}' is not uniformly spaced"
            )));
        }
    }
    Ok(step)
}

fn find_variable<'f>(
    file: &'f ::netcdf::File,
    names: &[&str],
) -> Option<::netcdf::Variable<'f>> {
    names.iter().find_map(|name| file.variable(name))
}

/// Load a NetCDF grid into the uniform representation.
///
/// # Errors
/// - [`NavError::MapIo`] when the file cannot be opened or read.
/// - [`NavError::MapFormat`] for missing coordinates, a missing or
///   mis-shaped data variable, or non-uniform spacing.
pub fn load_netcdf<P: AsRef<Path>>(path: P) -> NavResult<GridSource> {
    let path = path.as_ref();
    let file = ::netcdf::open(path)
        .map_err(|e| NavError::MapIo(format!("{}: {e}", path.display())))?;

    let lat_var = find_variable(&file, &LAT_NAMES)
        .ok_or_else(|| NavError::MapFormat("missing 'lat' coordinate variable".into()))?;
    let lon_var = find_variable(&file, &LON_NAMES)
        .ok_or_else(|| NavError::MapFormat("missing 'lon' coordinate variable".into()))?;
    let data_var = find_variable(&file, &DATA_NAMES)
        .or_else(|| {
            // Fall back to the first 2-D variable that is not a coordinate
            file.variables().find(|v| {
                v.dimensions().len() == 2 && {
                    let name = v.name();
                    !LAT_NAMES.contains(&name.as_str()) && !LON_NAMES.contains(&name.as_str())
                }
            })
        })
        .ok_or_else(|| NavError::MapFormat("no 2-D anomaly variable found".into()))?;

    let lats: Vec<f64> = lat_var
        .get_values(..)
        .map_err(|e| NavError::MapIo(format!("reading latitudes: {e}")))?;
    let lons: Vec<f64> = lon_var
        .get_values(..)
        .map_err(|e| NavError::MapIo(format!("reading longitudes: {e}")))?;
    let dlat = uniform_step(&lats, "lat")?;
    let dlon = uniform_step(&lons, "lon")?;

    let dims = data_var.dimensions();
    if dims.len() != 2 || dims[0].len() != lats.len() || dims[1].len() != lons.len() {
        return Err(NavError::MapFormat(format!(
            "variable '{}' is not a (lat, lon) grid",
            data_var.name()
        )));
    }
    let values: Vec<f64> = data_var
        .get_values(..)
        .map_err(|e| NavError::MapIo(format!("reading '{}': {e}", data_var.name())))?;

    let nodata = data_var
        .attribute("_FillValue")
        .and_then(|attr| attr.value().ok())
        .and_then(|value| match value {
            ::netcdf::AttributeValue::Double(v) => Some(v),
            ::netcdf::AttributeValue::Float(v) => Some(f64::from(v)),
            _ => None,
        });

    let header = MapHeader::new(
        lats.len(),
        lons.len(),
        lats[0],
        lons[0],
        dlat,
        dlon,
        nodata,
    )?;
    info!(
        "loaded NetCDF {}: {}x{} cells, lat step {}, lon step {}",
        path.display(),
        header.nrows,
        header.ncols,
        header.dlat,
        header.dlon
    );
    GridSource::new(header, values.into_iter().map(|v| v as f32).collect())
}
