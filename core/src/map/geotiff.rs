//! GeoTIFF raster loader.
//!
//! Reads a single-band, axis-aligned GeoTIFF: the georeferencing must be
//! expressed as a `ModelPixelScale` plus a `ModelTiepoint` anchored at the
//! raster origin. Rotated or sheared rasters (a full `ModelTransformation`
//! affine) are not representable in the uniform grid model and are rejected
//! as a format error. The GDAL nodata convention (ASCII tag 42113) is
//! honoured; sentinel cells surface as NaN.
//!
//! GeoTIFF anchors the tiepoint at the outer corner of pixel (0, 0) (raster
//! space "pixel is area"), so the centre of the first cell sits half a
//! pixel inward. Rows run north to south in a conventional raster, which
//! the header expresses as a negative latitude step.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::info;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::error::{NavError, NavResult};
use crate::map::{GridSource, MapHeader};

fn io_err(path: &Path, err: impl std::fmt::Display) -> NavError {
    NavError::MapIo(format!("{}: {err}", path.display()))
}

/// Load a single-band GeoTIFF into the uniform grid representation.
///
/// # Errors
/// - [`NavError::MapIo`] when the file cannot be opened or decoded.
/// - [`NavError::MapFormat`] for multi-band images, missing or malformed
///   georeferencing, or unsupported sample types.
pub fn load_geotiff<P: AsRef<Path>>(path: P) -> NavResult<GridSource> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| io_err(path, e))?;

    let (width, height) = decoder.dimensions().map_err(|e| io_err(path, e))?;
    match decoder.colortype().map_err(|e| io_err(path, e))? {
        ColorType::Gray(_) => {}
        other => {
            return Err(NavError::MapFormat(format!(
                "expected a single-band raster, got {other:?}"
            )));
        }
    }

    let pixel_scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .map_err(|_| NavError::MapFormat("missing ModelPixelScale tag".into()))?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .map_err(|_| NavError::MapFormat("missing ModelTiepoint tag".into()))?;
    if pixel_scale.len() < 2 {
        return Err(NavError::MapFormat("short ModelPixelScale tag".into()));
    }
    if tiepoint.len() < 5 {
        return Err(NavError::MapFormat("short ModelTiepoint tag".into()));
    }
    // Only tiepoints anchored at the raster origin describe a pure
    // scale-and-translate affine
    if tiepoint[0] != 0.0 || tiepoint[1] != 0.0 {
        return Err(NavError::MapFormat(
            "ModelTiepoint not anchored at the raster origin".into(),
        ));
    }
    let (scale_x, scale_y) = (pixel_scale[0], pixel_scale[1]);
    if scale_x <= 0.0 || scale_y <= 0.0 {
        return Err(NavError::MapFormat(format!(
            "non-positive pixel scale ({scale_x}, {scale_y})"
        )));
    }
    let (origin_lon, origin_lat) = (tiepoint[3], tiepoint[4]);

    let nodata = decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f64>().ok());

    let cells = match decoder.read_image().map_err(|e| io_err(path, e))? {
        DecodingResult::F32(values) => values,
        DecodingResult::F64(values) => values.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::U16(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::U32(values) => values.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::I16(values) => values.into_iter().map(f32::from).collect(),
        DecodingResult::I32(values) => values.into_iter().map(|v| v as f32).collect(),
        _ => {
            return Err(NavError::MapFormat(
                "unsupported GeoTIFF sample format".into(),
            ));
        }
    };

    // Cell centres sit half a pixel inward from the tiepoint corner; rows
    // run southward, hence the negative latitude step.
    let header = MapHeader::new(
        height as usize,
        width as usize,
        origin_lat - 0.5 * scale_y,
        origin_lon + 0.5 * scale_x,
        -scale_y,
        scale_x,
        nodata,
    )?;
    info!(
        "loaded GeoTIFF {}: {}x{} cells, lat step {}, lon step {}",
        path.display(),
        header.nrows,
        header.ncols,
        header.dlat,
        header.dlon
    );
    GridSource::new(header, cells)
}

// === Unit tests ===
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            load_geotiff("/nonexistent/map.tif"),
            Err(NavError::MapIo(_))
        ));
    }

    #[test]
    fn garbage_file_is_an_io_error() {
        let dir = std::env::temp_dir();
        let path = dir.join("magnav_not_a_tiff.tif");
        std::fs::write(&path, b"definitely not a tiff").unwrap();
        let result = load_geotiff(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(NavError::MapIo(_))));
    }
}
