//! Single-band raster grid with affine georeferencing.
//!
//! ## Coordinate conventions
//!
//! - Pixel (row, col) indexes the top-left cell; `e` is negative for the
//!   standard top-down raster orientation.
//! - World coordinates of a pixel *corner* come from [`GeoTransform::pixel_to_world`];
//!   cell centres are offset by half a pixel.
//! - Bounds arrays elsewhere in the crate are `[min_x, min_y, max_x, max_y]`.

use crate::error::StageError;
use ndarray::Array2;

/// Affine geotransform in GDAL coefficient order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// Pixel width (x scale)
    pub a: f64,
    /// Row rotation (typically 0)
    pub b: f64,
    /// X origin (upper-left x coordinate)
    pub c: f64,
    /// Column rotation (typically 0)
    pub d: f64,
    /// Pixel height (y scale, negative for top-down)
    pub e: f64,
    /// Y origin (upper-left y coordinate)
    pub f: f64,
}

impl GeoTransform {
    /// North-up transform with the given origin and square-ish pixel size.
    pub fn north_up(origin_x: f64, origin_y: f64, pixel_w: f64, pixel_h: f64) -> Self {
        Self {
            a: pixel_w,
            b: 0.0,
            c: origin_x,
            d: 0.0,
            e: -pixel_h.abs(),
            f: origin_y,
        }
    }

    /// Convert pixel coordinates to world coordinates.
    ///
    /// Takes (column, row) and returns (x, y); integer inputs land on pixel
    /// corners, half-integer inputs on cell centres.
    #[inline]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.a * col + self.b * row + self.c;
        let y = self.d * col + self.e * row + self.f;
        (x, y)
    }

    /// Convert world coordinates to fractional pixel coordinates.
    ///
    /// Assumes no rotation (b = d = 0), which holds for every raster this
    /// pipeline produces.
    #[inline]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.c) / self.a;
        let row = (y - self.f) / self.e;
        (col, row)
    }

    /// Transform for a grid resampled by `scale` (0.5 = half the pixels per
    /// axis). Pixel size grows by `1/scale`; the origin is unchanged.
    pub fn rescaled(&self, scale: f64) -> Self {
        Self {
            a: self.a / scale,
            e: self.e / scale,
            ..*self
        }
    }

    /// Absolute area covered by one cell, in squared map units.
    #[inline]
    pub fn cell_area(&self) -> f64 {
        (self.a * self.e - self.b * self.d).abs()
    }

    fn approx_eq(&self, other: &Self) -> bool {
        const EPS: f64 = 1e-9;
        (self.a - other.a).abs() < EPS
            && (self.b - other.b).abs() < EPS
            && (self.c - other.c).abs() < EPS
            && (self.d - other.d).abs() < EPS
            && (self.e - other.e).abs() < EPS
            && (self.f - other.f).abs() < EPS
    }
}

/// A single-band floating-point raster with georeferencing.
#[derive(Debug, Clone)]
pub struct Raster {
    /// Cell values, row-major (row 0 at the north edge).
    pub data: Array2<f64>,
    /// Affine geotransform.
    pub transform: GeoTransform,
    /// Coordinate reference identifier (e.g. "EPSG:32633").
    pub crs: String,
}

impl Raster {
    /// Create a raster filled with a constant value.
    pub fn filled(rows: usize, cols: usize, fill: f64, transform: GeoTransform, crs: &str) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), fill),
            transform,
            crs: crs.to_string(),
        }
    }

    /// Wrap an existing array.
    pub fn from_array(data: Array2<f64>, transform: GeoTransform, crs: &str) -> Self {
        Self {
            data,
            transform,
            crs: crs.to_string(),
        }
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// World coordinates of a cell centre.
    #[inline]
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.transform
            .pixel_to_world(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Grid alignment invariant for pixel-wise combination: identical
    /// dimensions, geotransform, and CRS.
    pub fn check_aligned(&self, other: &Raster) -> Result<(), StageError> {
        if self.data.dim() != other.data.dim() {
            return Err(StageError::GridMismatch(format!(
                "dimensions differ: {:?} vs {:?}",
                self.data.dim(),
                other.data.dim()
            )));
        }
        if !self.transform.approx_eq(&other.transform) {
            return Err(StageError::GridMismatch(
                "geotransforms differ".to_string(),
            ));
        }
        if self.crs != other.crs {
            return Err(StageError::GridMismatch(format!(
                "CRS differ: {} vs {}",
                self.crs, other.crs
            )));
        }
        Ok(())
    }

    /// Pixel-wise subtraction, preserving this raster's georeferencing.
    pub fn subtract(&self, other: &Raster) -> Result<Raster, StageError> {
        self.check_aligned(other)?;
        Ok(Raster {
            data: &self.data - &other.data,
            transform: self.transform,
            crs: self.crs.clone(),
        })
    }
}
