//! Magnetic anomaly map engine: header, raster sources, loaders, and the
//! interpolating facade.
//!
//! A map is a regular latitude/longitude grid of scalar anomaly values in
//! nano-tesla. The grid geometry lives in a [`MapHeader`]; cell `(i, j)` is
//! centred at `(lat0 + i*dlat, lon0 + j*dlon)` and the spacings may be
//! negative, which is how north-up rasters (latitude decreasing with row)
//! are represented without re-ordering the data.
//!
//! Raster backends implement [`RasterSource`], a minimal random-access
//! window reader. Both file loaders (GeoTIFF via the `tiff` crate, NetCDF
//! via the `netcdf` crate) decode into the common [`GridSource`]
//! representation, so the rest of the system sees only the uniform view.
//!
//! [`MagneticMap`] composes a source, the tile cache, and the interpolation
//! kernels behind one `interpolate(lat, lon, method)` call. The map is
//! read-only after construction and safe to share across threads; all
//! interior mutation is confined to the cache.

pub mod geotiff;
pub mod interpolate;
pub mod netcdf;
pub mod tile;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{NavError, NavResult};
use crate::AnomalyModel;

pub use interpolate::{CellGrid, InterpMethod};
pub use tile::{TileCache, TileKey, TileMetadata, DEFAULT_CACHE_CAPACITY, DEFAULT_TILE_SIZE};

/// Geometry and nodata sentinel of a regular lat/lon grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapHeader {
    pub nrows: usize,
    pub ncols: usize,
    /// Latitude of the centre of cell (0, j) in degrees
    pub lat0: f64,
    /// Longitude of the centre of cell (i, 0) in degrees
    pub lon0: f64,
    /// Latitude step per row in degrees; negative for north-up rasters
    pub dlat: f64,
    /// Longitude step per column in degrees
    pub dlon: f64,
    /// Sentinel value marking missing cells, surfaced as NaN
    pub nodata: Option<f64>,
}

impl MapHeader {
    /// # Errors
    /// Returns [`NavError::MapFormat`] when the grid is smaller than 2x2 or
    /// any geometry parameter is non-finite or zero-spaced.
    pub fn new(
        nrows: usize,
        ncols: usize,
        lat0: f64,
        lon0: f64,
        dlat: f64,
        dlon: f64,
        nodata: Option<f64>,
    ) -> NavResult<Self> {
        if nrows < 2 || ncols < 2 {
            return Err(NavError::MapFormat(format!(
                "grid must be at least 2x2, got {nrows}x{ncols}"
            )));
        }
        if !lat0.is_finite() || !lon0.is_finite() {
            return Err(NavError::MapFormat("grid origin must be finite".into()));
        }
        if !dlat.is_finite() || !dlon.is_finite() || dlat == 0.0 || dlon == 0.0 {
            return Err(NavError::MapFormat(format!(
                "grid spacing must be finite and non-zero, got ({dlat}, {dlon})"
            )));
        }
        Ok(MapHeader {
            nrows,
            ncols,
            lat0,
            lon0,
            dlat,
            dlon,
            nodata,
        })
    }

    /// Fractional grid indices for a geodetic coordinate
    pub fn fractional_index(&self, lat: f64, lon: f64) -> (f64, f64) {
        ((lat - self.lat0) / self.dlat, (lon - self.lon0) / self.dlon)
    }

    /// Geodetic centre of cell (i, j)
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.lat0 + row as f64 * self.dlat,
            self.lon0 + col as f64 * self.dlon,
        )
    }
}

/// Random-access raster backend. Implementations must be cheap to window
/// into repeatedly; the tile cache bounds how often each region is read.
pub trait RasterSource: Send + Sync {
    fn header(&self) -> &MapHeader;

    /// Row-major window of cell values; nodata cells are NaN
    fn read_window(
        &self,
        row0: usize,
        col0: usize,
        nrows: usize,
        ncols: usize,
    ) -> NavResult<Vec<f32>>;
}

/// Fully-decoded in-memory raster. Both file loaders produce this uniform
/// representation; tests build it directly.
pub struct GridSource {
    header: MapHeader,
    cells: Vec<f32>,
}

impl GridSource {
    /// Build a source from decoded cells, replacing nodata sentinel values
    /// with NaN.
    ///
    /// # Errors
    /// Returns [`NavError::MapFormat`] when the cell count does not match
    /// the header dimensions.
    pub fn new(header: MapHeader, mut cells: Vec<f32>) -> NavResult<Self> {
        if cells.len() != header.nrows * header.ncols {
            return Err(NavError::MapFormat(format!(
                "expected {} cells for a {}x{} grid, got {}",
                header.nrows * header.ncols,
                header.nrows,
                header.ncols,
                cells.len()
            )));
        }
        if let Some(sentinel) = header.nodata {
            for value in cells.iter_mut() {
                if f64::from(*value) == sentinel {
                    *value = f32::NAN;
                }
            }
        }
        Ok(GridSource { header, cells })
    }

    /// Build a source by evaluating a field function at every cell centre.
    pub fn from_fn<F: Fn(f64, f64) -> f64>(header: MapHeader, field: F) -> NavResult<Self> {
        let mut cells = Vec::with_capacity(header.nrows * header.ncols);
        for row in 0..header.nrows {
            for col in 0..header.ncols {
                let (lat, lon) = header.cell_center(row, col);
                cells.push(field(lat, lon) as f32);
            }
        }
        GridSource::new(header, cells)
    }
}

impl RasterSource for GridSource {
    fn header(&self) -> &MapHeader {
        &self.header
    }

    fn read_window(
        &self,
        row0: usize,
        col0: usize,
        nrows: usize,
        ncols: usize,
    ) -> NavResult<Vec<f32>> {
        if row0 + nrows > self.header.nrows || col0 + ncols > self.header.ncols {
            return Err(NavError::Domain(format!(
                "window {}x{} at ({}, {}) exceeds the {}x{} grid",
                nrows, ncols, row0, col0, self.header.nrows, self.header.ncols
            )));
        }
        let mut window = Vec::with_capacity(nrows * ncols);
        for row in row0..row0 + nrows {
            let start = row * self.header.ncols + col0;
            window.extend_from_slice(&self.cells[start..start + ncols]);
        }
        Ok(window)
    }
}

/// Load a map from a file, dispatching on the extension.
///
/// # Errors
/// [`NavError::MapFormat`] for an unrecognised extension, otherwise
/// whatever the format loader reports.
pub fn open_map<P: AsRef<Path>>(path: P) -> NavResult<MagneticMap> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let source = match extension.as_str() {
        "tif" | "tiff" => geotiff::load_geotiff(path)?,
        "nc" | "netcdf" => netcdf::load_netcdf(path)?,
        other => {
            return Err(NavError::MapFormat(format!(
                "cannot infer map format from extension '{other}'"
            )));
        }
    };
    Ok(MagneticMap::new(Arc::new(source)))
}

/// Stencil of resident tiles assembled for one interpolation call.
struct TileWindow {
    tiles: Vec<Arc<tile::Tile>>,
    nrows: usize,
    ncols: usize,
}

impl CellGrid for TileWindow {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn cell(&self, row: usize, col: usize) -> f64 {
        for tile in &self.tiles {
            if tile.covers(row, col) {
                return tile.cell(row, col);
            }
        }
        debug_assert!(false, "cell ({row}, {col}) not covered by the gathered tiles");
        f64::NAN
    }
}

/// Magnetic anomaly map: raster source + tile cache + interpolation.
///
/// Created at service startup and read-only afterwards; share it with
/// `Arc`. Concurrent `interpolate` calls only contend on the cache, and
/// only when they miss.
pub struct MagneticMap {
    source: Arc<dyn RasterSource>,
    cache: TileCache,
}

impl MagneticMap {
    /// Wrap a source with the default tile geometry (256-cell tiles,
    /// 16 resident).
    pub fn new(source: Arc<dyn RasterSource>) -> Self {
        Self::with_cache(source, DEFAULT_TILE_SIZE, DEFAULT_CACHE_CAPACITY)
            .expect("default cache parameters are valid")
    }

    /// Wrap a source with explicit tile geometry.
    pub fn with_cache(
        source: Arc<dyn RasterSource>,
        tile_size: usize,
        capacity: usize,
    ) -> NavResult<Self> {
        Ok(MagneticMap {
            source,
            cache: TileCache::new(tile_size, capacity)?,
        })
    }

    pub fn header(&self) -> &MapHeader {
        self.source.header()
    }

    /// Whole-map extent as tile metadata
    pub fn tile_metadata(&self) -> TileMetadata {
        let header = self.header();
        TileMetadata {
            row0: 0,
            col0: 0,
            nrows: header.nrows,
            ncols: header.ncols,
        }
    }

    /// Number of tiles currently resident in the cache
    pub fn resident_tiles(&self) -> usize {
        self.cache.resident()
    }

    /// Raw cell value at absolute grid indices, honouring nodata as NaN.
    pub fn cell(&self, row: usize, col: usize) -> NavResult<f64> {
        let header = self.header();
        if row >= header.nrows || col >= header.ncols {
            return Err(NavError::Domain(format!(
                "cell ({row}, {col}) outside the {}x{} grid",
                header.nrows, header.ncols
            )));
        }
        let window = self.gather(row, row, col, col)?;
        Ok(window.cell(row, col))
    }

    /// Interpolate the anomaly value at a geodetic coordinate.
    ///
    /// # Errors
    /// - [`NavError::Domain`] for non-finite coordinates.
    /// - [`NavError::OutOfMap`] (carrying the coordinates) when the bilinear
    ///   stencil does not fit; the exact border is in bounds.
    ///
    /// A NaN result means the stencil touched nodata; callers decide policy.
    pub fn interpolate(&self, lat: f64, lon: f64, method: InterpMethod) -> NavResult<f64> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(NavError::Domain(format!(
                "non-finite query coordinates ({lat}, {lon})"
            )));
        }
        let header = self.header();
        let (r, c) = header.fractional_index(lat, lon);
        let max_r = (header.nrows - 1) as f64;
        let max_c = (header.ncols - 1) as f64;
        if !(0.0..=max_r).contains(&r) || !(0.0..=max_c).contains(&c) {
            return Err(NavError::OutOfMap { lat, lon });
        }
        let r0 = (r.floor() as usize).min(header.nrows - 2);
        let c0 = (c.floor() as usize).min(header.ncols - 2);
        let wide = r0 >= 1 && r0 + 2 < header.nrows && c0 >= 1 && c0 + 2 < header.ncols;
        let (row_min, row_max, col_min, col_max) = match method {
            InterpMethod::Bicubic if wide => (r0 - 1, r0 + 2, c0 - 1, c0 + 2),
            _ => (r0, r0 + 1, c0, c0 + 1),
        };
        let window = self.gather(row_min, row_max, col_min, col_max)?;
        Ok(interpolate::interpolate_at(&window, r, c, method))
    }

    /// Acquire every tile overlapping the inclusive cell range.
    fn gather(
        &self,
        row_min: usize,
        row_max: usize,
        col_min: usize,
        col_max: usize,
    ) -> NavResult<TileWindow> {
        let ts = self.cache.tile_size();
        let header = self.header();
        let mut tiles = Vec::with_capacity(4);
        for tile_row in (row_min / ts)..=(row_max / ts) {
            for tile_col in (col_min / ts)..=(col_max / ts) {
                tiles.push(self.cache.get_or_load(
                    TileKey {
                        row: tile_row,
                        col: tile_col,
                    },
                    self.source.as_ref(),
                )?);
            }
        }
        Ok(TileWindow {
            tiles,
            nrows: header.nrows,
            ncols: header.ncols,
        })
    }
}

impl AnomalyModel for MagneticMap {
    fn field_at(&self, lat: f64, lon: f64) -> NavResult<f64> {
        self.interpolate(lat, lon, InterpMethod::Bilinear)
    }
}
