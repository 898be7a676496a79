//! Canopy height model derivation.
//!
//! The terrain under the canopy is estimated by sampling the surface model
//! sparsely (nearest-neighbour at a coarse pixel size, which mostly misses
//! crowns) and interpolating smoothly back to the full grid. Canopy height is
//! then surface minus estimated terrain.
//!
//! Interpolation overshoot can leave small negative heights; they are not
//! clipped here — the delineator thresholds them away.

use crate::config::ChmConfig;
use crate::error::StageError;
use crate::raster::{downsample_nearest, upsample_bicubic, Raster};

/// Derive a canopy height raster from a surface-elevation raster.
///
/// The output shares the input's dimensions, geotransform, and CRS exactly,
/// and is deterministic: identical input yields bit-identical output.
pub fn build_chm(dsm: &Raster, config: &ChmConfig) -> Result<Raster, StageError> {
    let coarse = downsample_nearest(dsm, config.ground_sample_m);
    tracing::debug!(
        "terrain sample: {}x{} at {} map units",
        coarse.rows(),
        coarse.cols(),
        config.ground_sample_m
    );

    let terrain = upsample_bicubic(&coarse, dsm.rows(), dsm.cols(), dsm.transform);
    let chm = dsm.subtract(&terrain)?;

    tracing::info!(
        "CHM built: {}x{} cells, max height {:.2}",
        chm.rows(),
        chm.cols(),
        chm.data.iter().cloned().filter(|v| v.is_finite()).fold(f64::MIN, f64::max)
    );
    Ok(chm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;

    fn default_config() -> ChmConfig {
        ChmConfig { ground_sample_m: 5.0 }
    }

    /// 100x100 cells at 0.5 m with flat ground plus a conical hill whose
    /// footprint avoids every coarse terrain sample point.
    fn synthetic_dsm() -> Raster {
        let gt = GeoTransform::north_up(0.0, 50.0, 0.5, 0.5);
        let mut dsm = Raster::filled(100, 100, 100.0, gt, "unspecified");
        let (cx, cy, radius, peak) = (25.25_f64, 25.25_f64, 3.0_f64, 10.0_f64);
        for r in 0..100 {
            for c in 0..100 {
                let (x, y) = dsm.cell_center(r, c);
                let d = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
                if d < radius {
                    dsm.data[[r, c]] = 100.0 + peak * (1.0 - d / radius);
                }
            }
        }
        dsm
    }

    #[test]
    fn test_output_grid_matches_input() {
        let dsm = synthetic_dsm();
        let chm = build_chm(&dsm, &default_config()).unwrap();
        assert_eq!(chm.data.dim(), dsm.data.dim());
        assert_eq!(chm.transform, dsm.transform);
        assert_eq!(chm.crs, dsm.crs);
    }

    #[test]
    fn test_flat_surface_yields_zero_heights() {
        let gt = GeoTransform::north_up(0.0, 50.0, 0.5, 0.5);
        let dsm = Raster::filled(100, 100, 250.0, gt, "unspecified");
        let chm = build_chm(&dsm, &default_config()).unwrap();
        assert!(chm.data.iter().all(|&v| v.abs() < 1e-9));
    }

    #[test]
    fn test_hill_survives_as_canopy_height() {
        let dsm = synthetic_dsm();
        let chm = build_chm(&dsm, &default_config()).unwrap();
        // No coarse sample lands on the hill, so terrain is exactly flat and
        // the full cone height survives. The peak sits at a cell centre.
        let max = chm.data.iter().cloned().fold(f64::MIN, f64::max);
        assert!((max - 10.0).abs() < 1e-9);
        // Away from the hill, height is zero.
        assert!(chm.data[[5, 5]].abs() < 1e-9);
    }

    #[test]
    fn test_determinism_bit_identical() {
        let dsm = synthetic_dsm();
        let a = build_chm(&dsm, &default_config()).unwrap();
        let b = build_chm(&dsm, &default_config()).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_negative_overshoot_not_clipped() {
        // A sharp pit in the surface makes the interpolated terrain overshoot
        // below the surface nearby; those negatives must pass through.
        let gt = GeoTransform::north_up(0.0, 50.0, 0.5, 0.5);
        let mut dsm = Raster::filled(100, 100, 100.0, gt, "unspecified");
        for r in 40..60 {
            for c in 40..60 {
                dsm.data[[r, c]] = 80.0;
            }
        }
        let chm = build_chm(&dsm, &ChmConfig { ground_sample_m: 10.0 }).unwrap();
        let min = chm.data.iter().cloned().fold(f64::MAX, f64::min);
        assert!(min < 0.0);
    }
}
