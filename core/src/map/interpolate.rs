//! Interpolation kernels over a regular grid.
//!
//! The kernels work in fractional grid coordinates `(r, c)` and assume the
//! caller has already verified that the bilinear stencil fits (`0 <= r <=
//! nrows-1`, same for columns); the map facade performs that check so it can
//! attach the offending geodetic coordinates to the error. The exact grid
//! border is valid: the base index is clamped to `n - 2` with fraction 1, so
//! a query on the last row/column reproduces the border value.
//!
//! Bicubic uses a Catmull-Rom kernel on a 4x4 stencil. Where the wide
//! stencil does not fit (within one cell of the border) it falls back to
//! bilinear rather than failing, keeping the output defined over the whole
//! in-bounds region. NaN cells propagate into the result; they are a data
//! statement, not an error.

use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};

/// Interpolation method tag. A closed set dispatched by match; adding a
/// method means adding a variant and a kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpMethod {
    #[default]
    Bilinear,
    Bicubic,
}

impl std::str::FromStr for InterpMethod {
    type Err = NavError;

    fn from_str(s: &str) -> NavResult<Self> {
        match s {
            "bilinear" => Ok(InterpMethod::Bilinear),
            "bicubic" => Ok(InterpMethod::Bicubic),
            other => Err(NavError::Config(format!(
                "unsupported interpolation method: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for InterpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpMethod::Bilinear => write!(f, "bilinear"),
            InterpMethod::Bicubic => write!(f, "bicubic"),
        }
    }
}

/// Read-only cell access for the kernels. Implemented by the tile window
/// assembled by the map facade and by plain buffers in tests.
pub trait CellGrid {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
    /// Value at absolute grid indices; nodata cells are NaN
    fn cell(&self, row: usize, col: usize) -> f64;
}

/// Base index and fraction for a fractional coordinate, with the border
/// clamped into the last interior cell.
fn split_index(x: f64, n: usize) -> (usize, f64) {
    let base = (x.floor() as usize).min(n - 2);
    (base, x - base as f64)
}

/// Bilinear interpolation at fractional grid coordinates.
pub fn bilinear<G: CellGrid + ?Sized>(grid: &G, r: f64, c: f64) -> f64 {
    let (r0, fr) = split_index(r, grid.nrows());
    let (c0, fc) = split_index(c, grid.ncols());
    let q00 = grid.cell(r0, c0);
    let q01 = grid.cell(r0, c0 + 1);
    let q10 = grid.cell(r0 + 1, c0);
    let q11 = grid.cell(r0 + 1, c0 + 1);
    q00 * (1.0 - fr) * (1.0 - fc) + q01 * (1.0 - fr) * fc + q10 * fr * (1.0 - fc) + q11 * fr * fc
}

/// Catmull-Rom weights for fraction `t` in [0, 1]. Sum to one; at t = 0 the
/// weight vector is (0, 1, 0, 0) so grid points are reproduced exactly.
fn catmull_rom_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

/// Bicubic (Catmull-Rom) interpolation on the 4x4 stencil centred at the
/// base cell. Falls back to [`bilinear`] when the stencil does not fit.
pub fn bicubic<G: CellGrid + ?Sized>(grid: &G, r: f64, c: f64) -> f64 {
    let (r0, fr) = split_index(r, grid.nrows());
    let (c0, fc) = split_index(c, grid.ncols());
    if r0 < 1 || r0 + 2 >= grid.nrows() || c0 < 1 || c0 + 2 >= grid.ncols() {
        return bilinear(grid, r, c);
    }
    let wr = catmull_rom_weights(fr);
    let wc = catmull_rom_weights(fc);
    let mut acc = 0.0;
    for (i, wri) in wr.iter().enumerate() {
        for (j, wcj) in wc.iter().enumerate() {
            acc += wri * wcj * grid.cell(r0 - 1 + i, c0 - 1 + j);
        }
    }
    acc
}

/// Dispatch on the method tag.
pub fn interpolate_at<G: CellGrid + ?Sized>(
    grid: &G,
    r: f64,
    c: f64,
    method: InterpMethod,
) -> f64 {
    match method {
        InterpMethod::Bilinear => bilinear(grid, r, c),
        InterpMethod::Bicubic => bicubic(grid, r, c),
    }
}
