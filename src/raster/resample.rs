//! Resampling and smoothing kernels.
//!
//! Three resamplers cover the pipeline's needs: nearest-neighbour for the
//! coarse terrain sampling, Catmull-Rom bicubic for the smooth terrain
//! estimate, and an area-weighted box filter (anti-aliased) for delineation
//! downscaling. All of them preserve NaN cells where the source is NaN.

use crate::raster::{GeoTransform, Raster};
use ndarray::Array2;

/// Downsample to a coarser pixel size using nearest-neighbour sampling.
///
/// Each output cell takes the value of the source cell whose centre is
/// nearest to the output cell centre. Used to sample the surface sparsely
/// enough that canopy detail is mostly discarded.
pub fn downsample_nearest(src: &Raster, target_pixel: f64) -> Raster {
    let fx = target_pixel / src.transform.a.abs();
    let fy = target_pixel / src.transform.e.abs();
    let out_cols = ((src.cols() as f64 / fx).round() as usize).max(1);
    let out_rows = ((src.rows() as f64 / fy).round() as usize).max(1);

    let mut data = Array2::zeros((out_rows, out_cols));
    for r in 0..out_rows {
        // Nearest source cell centre to the output cell centre.
        let sr = (((r as f64 + 0.5) * fy - 0.5).round() as isize)
            .clamp(0, src.rows() as isize - 1) as usize;
        for c in 0..out_cols {
            let sc = (((c as f64 + 0.5) * fx - 0.5).round() as isize)
                .clamp(0, src.cols() as isize - 1) as usize;
            data[[r, c]] = src.data[[sr, sc]];
        }
    }

    let transform = GeoTransform {
        a: src.transform.a.signum() * target_pixel,
        e: src.transform.e.signum() * target_pixel,
        ..src.transform
    };
    Raster::from_array(data, transform, &src.crs)
}

/// Catmull-Rom weight for a sample at distance `t` (|t| < 2).
#[inline]
fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

/// Upsample onto an explicit target grid using bicubic interpolation.
///
/// Sample positions are mapped through world coordinates so the output grid
/// can differ from the source in both pixel size and dimensions. Border
/// samples are edge-clamped. Interpolating a constant field reproduces the
/// constant exactly (the Catmull-Rom weights sum to 1).
pub fn upsample_bicubic(
    src: &Raster,
    out_rows: usize,
    out_cols: usize,
    out_transform: GeoTransform,
) -> Raster {
    let mut data = Array2::zeros((out_rows, out_cols));
    let src_rows = src.rows() as isize;
    let src_cols = src.cols() as isize;

    for r in 0..out_rows {
        for c in 0..out_cols {
            let (x, y) = out_transform.pixel_to_world(c as f64 + 0.5, r as f64 + 0.5);
            let (fc, fr) = src.transform.world_to_pixel(x, y);
            // Continuous position in source cell-centre space.
            let fc = fc - 0.5;
            let fr = fr - 0.5;
            let c0 = fc.floor() as isize;
            let r0 = fr.floor() as isize;

            let mut acc = 0.0;
            let mut wsum = 0.0;
            for dr in -1..=2isize {
                let wr = cubic_weight(fr - (r0 + dr) as f64);
                if wr == 0.0 {
                    continue;
                }
                let rr = (r0 + dr).clamp(0, src_rows - 1) as usize;
                for dc in -1..=2isize {
                    let wc = cubic_weight(fc - (c0 + dc) as f64);
                    if wc == 0.0 {
                        continue;
                    }
                    let cc = (c0 + dc).clamp(0, src_cols - 1) as usize;
                    let v = src.data[[rr, cc]];
                    if v.is_nan() {
                        continue;
                    }
                    acc += v * wr * wc;
                    wsum += wr * wc;
                }
            }
            data[[r, c]] = if wsum.abs() > f64::EPSILON {
                acc / wsum
            } else {
                f64::NAN
            };
        }
    }

    Raster::from_array(data, out_transform, &src.crs)
}

/// Anti-aliased downsample by a scale factor in (0, 1].
///
/// Each output cell is the area-weighted mean of the source cells its
/// footprint covers, so thin positive features still contribute rather than
/// aliasing away. The geotransform pixel size grows by `1/scale`.
pub fn downsample_area(src: &Raster, scale: f64) -> Raster {
    let inv = 1.0 / scale;
    let out_rows = ((src.rows() as f64 * scale).floor() as usize).max(1);
    let out_cols = ((src.cols() as f64 * scale).floor() as usize).max(1);

    let mut data = Array2::zeros((out_rows, out_cols));
    for r in 0..out_rows {
        let y0 = r as f64 * inv;
        let y1 = (r + 1) as f64 * inv;
        for c in 0..out_cols {
            let x0 = c as f64 * inv;
            let x1 = (c + 1) as f64 * inv;

            let mut acc = 0.0;
            let mut wsum = 0.0;
            let mut sr = y0.floor() as usize;
            while (sr as f64) < y1 && sr < src.rows() {
                let wy = (y1.min((sr + 1) as f64) - y0.max(sr as f64)).max(0.0);
                let mut sc = x0.floor() as usize;
                while (sc as f64) < x1 && sc < src.cols() {
                    let wx = (x1.min((sc + 1) as f64) - x0.max(sc as f64)).max(0.0);
                    let v = src.data[[sr, sc]];
                    if !v.is_nan() {
                        acc += v * wx * wy;
                        wsum += wx * wy;
                    }
                    sc += 1;
                }
                sr += 1;
            }
            data[[r, c]] = if wsum > 0.0 { acc / wsum } else { f64::NAN };
        }
    }

    Raster::from_array(data, src.transform.rescaled(scale), &src.crs)
}

/// Separable gaussian blur with kernel radius `3*sigma`.
///
/// NaN cells stay NaN; near NaN cells and borders the kernel is renormalised
/// over the valid support.
pub fn gaussian_blur(src: &Raster, sigma: f64) -> Raster {
    if sigma <= 0.0 {
        return src.clone();
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|i| {
            let x = i as f64;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();

    let pass = |input: &Array2<f64>, horizontal: bool| -> Array2<f64> {
        let (rows, cols) = input.dim();
        let mut out = input.clone();
        for r in 0..rows {
            for c in 0..cols {
                if input[[r, c]].is_nan() {
                    continue;
                }
                let mut acc = 0.0;
                let mut wsum = 0.0;
                for (ki, di) in (-radius..=radius).enumerate() {
                    let (rr, cc) = if horizontal {
                        (r as isize, c as isize + di)
                    } else {
                        (r as isize + di, c as isize)
                    };
                    if rr < 0 || cc < 0 || rr >= rows as isize || cc >= cols as isize {
                        continue;
                    }
                    let v = input[[rr as usize, cc as usize]];
                    if v.is_nan() {
                        continue;
                    }
                    acc += v * kernel[ki];
                    wsum += kernel[ki];
                }
                if wsum > 0.0 {
                    out[[r, c]] = acc / wsum;
                }
            }
        }
        out
    };

    let tmp = pass(&src.data, true);
    let data = pass(&tmp, false);
    Raster::from_array(data, src.transform, &src.crs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_meter_raster(rows: usize, cols: usize, fill: f64) -> Raster {
        let gt = GeoTransform::north_up(0.0, rows as f64 * 0.5, 0.5, 0.5);
        Raster::filled(rows, cols, fill, gt, "EPSG:32633")
    }

    #[test]
    fn test_downsample_nearest_dimensions_and_transform() {
        let src = half_meter_raster(100, 100, 7.0);
        let coarse = downsample_nearest(&src, 5.0);
        assert_eq!((coarse.rows(), coarse.cols()), (10, 10));
        assert_eq!(coarse.transform.a, 5.0);
        assert_eq!(coarse.transform.e, -5.0);
        assert!(coarse.data.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_bicubic_constant_is_exact() {
        let src = half_meter_raster(100, 100, 123.25);
        let coarse = downsample_nearest(&src, 5.0);
        let up = upsample_bicubic(&coarse, 100, 100, src.transform);
        assert!(up.data.iter().all(|&v| (v - 123.25).abs() < 1e-9));
    }

    #[test]
    fn test_bicubic_matches_source_grid() {
        let src = half_meter_raster(40, 40, 1.0);
        let coarse = downsample_nearest(&src, 5.0);
        let up = upsample_bicubic(&coarse, 40, 40, src.transform);
        assert_eq!((up.rows(), up.cols()), (40, 40));
        assert_eq!(up.transform, src.transform);
    }

    #[test]
    fn test_downsample_area_halves_grid() {
        let mut src = half_meter_raster(4, 4, 0.0);
        src.data[[0, 0]] = 4.0;
        let down = downsample_area(&src, 0.5);
        assert_eq!((down.rows(), down.cols()), (2, 2));
        // Top-left output cell averages a 2x2 block containing the single 4.0.
        assert!((down.data[[0, 0]] - 1.0).abs() < 1e-12);
        assert_eq!(down.data[[1, 1]], 0.0);
        assert_eq!(down.transform.a, 1.0);
    }

    #[test]
    fn test_downsample_area_keeps_thin_features_positive() {
        let mut src = half_meter_raster(8, 8, 0.0);
        src.data[[3, 3]] = 8.0;
        let down = downsample_area(&src, 0.5);
        assert!(down.data[[1, 1]] > 0.0);
    }

    #[test]
    fn test_gaussian_blur_preserves_constant() {
        let src = half_meter_raster(20, 20, 3.5);
        let blurred = gaussian_blur(&src, 2.0);
        assert!(blurred.data.iter().all(|&v| (v - 3.5).abs() < 1e-9));
    }

    #[test]
    fn test_gaussian_blur_spreads_peak() {
        let mut src = half_meter_raster(21, 21, 0.0);
        src.data[[10, 10]] = 100.0;
        let blurred = gaussian_blur(&src, 2.0);
        assert!(blurred.data[[10, 10]] < 100.0);
        assert!(blurred.data[[10, 12]] > 0.0);
        // Peak stays the maximum.
        let max = blurred.data.iter().cloned().fold(f64::MIN, f64::max);
        assert_eq!(max, blurred.data[[10, 10]]);
    }
}
