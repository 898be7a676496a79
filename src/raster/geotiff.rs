//! Minimal GeoTIFF adapter: single-band float rasters with
//! ModelPixelScale/ModelTiepoint georeferencing tags.
//!
//! This is deliberately small; full-format raster I/O belongs to an external
//! adapter. Rasters written here round-trip exactly through [`read_geotiff`].

use crate::error::StageError;
use crate::raster::{GeoTransform, Raster};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

fn format_err(path: &Path, what: impl std::fmt::Display) -> StageError {
    StageError::UnsupportedFormat(format!("{}: {}", path.display(), what))
}

/// Read a single-band floating-point GeoTIFF.
///
/// Multi-band files fall back to band 0 (pixel-interleaved). Missing
/// georeferencing tags default to a unit transform at the origin.
pub fn read_geotiff(path: &Path) -> Result<Raster, StageError> {
    if !path.exists() {
        return Err(StageError::InputMissing {
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| format_err(path, e))?;

    let (width, height) = decoder.dimensions().map_err(|e| format_err(path, e))?;
    let (cols, rows) = (width as usize, height as usize);

    let mut pixel_w = 1.0f64;
    let mut pixel_h = 1.0f64;
    let mut origin_x = 0.0f64;
    let mut origin_y = rows as f64;

    if let Ok(Some(scale)) = decoder.find_tag(Tag::ModelPixelScaleTag) {
        if let Ok(scale) = scale.into_f64_vec() {
            if scale.len() >= 2 {
                pixel_w = scale[0];
                pixel_h = scale[1];
            }
        }
    } else {
        tracing::debug!("{}: no ModelPixelScale tag, assuming 1.0", path.display());
    }
    if let Ok(Some(tie)) = decoder.find_tag(Tag::ModelTiepointTag) {
        if let Ok(tie) = tie.into_f64_vec() {
            if tie.len() >= 6 {
                origin_x = tie[3];
                origin_y = tie[4];
            }
        }
    }

    let raw: Vec<f64> = match decoder.read_image().map_err(|e| format_err(path, e))? {
        DecodingResult::F64(v) => v,
        DecodingResult::F32(v) => v.iter().map(|&x| x as f64).collect(),
        DecodingResult::U16(v) => v.iter().map(|&x| x as f64).collect(),
        DecodingResult::U8(v) => v.iter().map(|&x| x as f64).collect(),
        _ => return Err(format_err(path, "unsupported sample format")),
    };

    let total = rows * cols;
    if total == 0 || raw.len() % total != 0 {
        return Err(format_err(path, "pixel count does not match dimensions"));
    }
    let bands = raw.len() / total;
    let band: Vec<f64> = if bands > 1 {
        tracing::debug!("{}: {} bands, reading band 0", path.display(), bands);
        (0..total).map(|px| raw[px * bands]).collect()
    } else {
        raw
    };

    let data = Array2::from_shape_vec((rows, cols), band)
        .map_err(|e| format_err(path, e))?;
    Ok(Raster::from_array(
        data,
        GeoTransform::north_up(origin_x, origin_y, pixel_w, pixel_h),
        "unspecified",
    ))
}

/// Write a raster as a single-band 32-bit float GeoTIFF.
pub fn write_geotiff(path: &Path, raster: &Raster) -> Result<(), StageError> {
    let file = File::create(path)?;
    let mut encoder =
        TiffEncoder::new(BufWriter::new(file)).map_err(|e| format_err(path, e))?;

    let mut image = encoder
        .new_image::<colortype::Gray32Float>(raster.cols() as u32, raster.rows() as u32)
        .map_err(|e| format_err(path, e))?;

    let scale = [raster.transform.a.abs(), raster.transform.e.abs(), 0.0];
    let tiepoint = [0.0, 0.0, 0.0, raster.transform.c, raster.transform.f, 0.0];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])
        .map_err(|e| format_err(path, e))?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
        .map_err(|e| format_err(path, e))?;

    let pixels: Vec<f32> = raster.data.iter().map(|&v| v as f32).collect();
    image.write_data(&pixels).map_err(|e| format_err(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_values_and_georeferencing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chm.tif");

        let gt = GeoTransform::north_up(5000.0, 62000.0, 0.5, 0.5);
        let mut raster = Raster::filled(8, 6, 0.0, gt, "unspecified");
        raster.data[[2, 3]] = 12.5;
        raster.data[[7, 0]] = -0.25;

        write_geotiff(&path, &raster).unwrap();
        let back = read_geotiff(&path).unwrap();

        assert_eq!((back.rows(), back.cols()), (8, 6));
        assert_eq!(back.transform.c, 5000.0);
        assert_eq!(back.transform.f, 62000.0);
        assert_eq!(back.transform.a, 0.5);
        assert_eq!(back.transform.e, -0.5);
        assert_eq!(back.data[[2, 3]], 12.5);
        assert_eq!(back.data[[7, 0]], -0.25);
    }

    #[test]
    fn test_missing_file_is_input_missing() {
        let err = read_geotiff(Path::new("/nonexistent/dsm.tif")).unwrap_err();
        assert!(matches!(err, StageError::InputMissing { .. }));
    }
}
