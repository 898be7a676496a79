//! Per-tree metric extraction and allometric carbon estimation.

use crate::config::{AllometryConfig, FilterConfig};
use crate::error::StageError;
use crate::raster::Raster;
use crate::vector::CrownPolygon;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// One row of the carbon inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeMetrics {
    pub tree_id: u32,
    pub height_m: f64,
    pub crown_area_sqm: f64,
    pub estimated_dbh_cm: f64,
    pub agb_kg: f64,
    pub total_biomass_kg: f64,
    pub carbon_kg: f64,
    pub co2_sequestered_kg: f64,
}

/// Completed inventory plus the unit-level aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarbonSummary {
    pub trees: Vec<TreeMetrics>,
    pub total_co2_tonnes: f64,
}

/// Raw measurements read off the canopy height raster for one crown.
struct CrownSample {
    label: u32,
    height_m: f64,
    area_sqm: f64,
}

/// Estimate carbon stock for every plausible tree crown.
///
/// Crowns are measured against the height raster in parallel; crowns that
/// cannot be measured are skipped with a warning rather than failing the
/// unit. Implausible trees are removed by the height/area window before the
/// allometric chain runs. An empty inventory at either point is an error:
/// the unit produced no usable trees.
pub fn estimate_carbon(
    chm: &Raster,
    crowns: &[CrownPolygon],
    filter: &FilterConfig,
    allometry: &AllometryConfig,
) -> Result<CarbonSummary, StageError> {
    if crowns.is_empty() {
        return Err(StageError::NoCandidatesFound(
            "delineation produced no crowns".into(),
        ));
    }

    let measured: Vec<Result<CrownSample, StageError>> = crowns
        .par_iter()
        .map(|crown| sample_crown(chm, crown))
        .collect();

    let mut samples = Vec::with_capacity(measured.len());
    for result in measured {
        match result {
            Ok(sample) => samples.push(sample),
            Err(e) if e.is_recoverable() => {
                tracing::warn!("skipping crown: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    let total = samples.len();
    if !samples.is_empty() {
        let (h_min, h_mean, h_max) = describe(samples.iter().map(|s| s.height_m));
        let (a_min, a_mean, a_max) = describe(samples.iter().map(|s| s.area_sqm));
        tracing::info!(
            "measured {} crowns: height min/mean/max = {:.2}/{:.2}/{:.2} m, \
             area min/mean/max = {:.2}/{:.2}/{:.2} m2",
            total,
            h_min,
            h_mean,
            h_max,
            a_min,
            a_mean,
            a_max
        );
    }
    samples.retain(|s| {
        s.height_m >= filter.min_height_m
            && s.height_m <= filter.max_height_m
            && s.area_sqm >= filter.min_crown_area_sqm
            && s.area_sqm <= filter.max_crown_area_sqm
    });
    tracing::info!(
        "plausibility filter kept {} of {} measured crowns",
        samples.len(),
        total
    );
    if samples.is_empty() {
        return Err(StageError::NoCandidatesFound(format!(
            "all {} measured crowns fell outside the plausibility window",
            total
        )));
    }

    let trees: Vec<TreeMetrics> = samples
        .iter()
        .map(|s| allometric_chain(s, allometry))
        .collect();
    let total_kg: f64 = trees.iter().map(|t| t.co2_sequestered_kg).sum();

    Ok(CarbonSummary {
        trees,
        total_co2_tonnes: total_kg / 1000.0,
    })
}

/// (min, mean, max) over a non-empty sample sequence.
fn describe(values: impl Iterator<Item = f64>) -> (f64, f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
        n += 1;
    }
    (min, sum / n as f64, max)
}

/// Measure one crown: height is the maximum finite canopy value over the
/// cells whose centre falls inside the outline, area is the planimetric
/// polygon area.
fn sample_crown(chm: &Raster, crown: &CrownPolygon) -> Result<CrownSample, StageError> {
    let area = crown.area();
    if !area.is_finite() || area <= 0.0 {
        return Err(StageError::MetricExtraction {
            tree_id: crown.label,
            reason: "degenerate outline".into(),
        });
    }

    let [min_x, min_y, max_x, max_y] = crown.bounds();
    let (rows, cols) = chm.data.dim();
    // Pixel window covering the bounding box, clamped to the raster.
    let corners = [
        chm.transform.world_to_pixel(min_x, min_y),
        chm.transform.world_to_pixel(min_x, max_y),
        chm.transform.world_to_pixel(max_x, min_y),
        chm.transform.world_to_pixel(max_x, max_y),
    ];
    let r0 = corners
        .iter()
        .map(|p| p.1.floor() as isize)
        .min()
        .unwrap_or(0)
        .max(0) as usize;
    let r1 = corners
        .iter()
        .map(|p| p.1.ceil() as isize)
        .max()
        .unwrap_or(0)
        .clamp(0, rows as isize) as usize;
    let c0 = corners
        .iter()
        .map(|p| p.0.floor() as isize)
        .min()
        .unwrap_or(0)
        .max(0) as usize;
    let c1 = corners
        .iter()
        .map(|p| p.0.ceil() as isize)
        .max()
        .unwrap_or(0)
        .clamp(0, cols as isize) as usize;
    if r0 >= r1 || c0 >= c1 {
        return Err(StageError::MetricExtraction {
            tree_id: crown.label,
            reason: "outline lies outside the height raster".into(),
        });
    }

    let mut height = f64::NEG_INFINITY;
    let mut hit = false;
    for r in r0..r1 {
        for c in c0..c1 {
            let (x, y) = chm.cell_center(r, c);
            if !crown.contains(x, y) {
                continue;
            }
            hit = true;
            let v = chm.data[[r, c]];
            if v.is_finite() && v > height {
                height = v;
            }
        }
    }
    // A sliver narrower than one cell covers no centres; report zero height
    // and let the plausibility filter discard it.
    let height = if hit && height.is_finite() { height } else { 0.0 };

    Ok(CrownSample {
        label: crown.label,
        height_m: height,
        area_sqm: area,
    })
}

/// Height/area → DBH → biomass → carbon → CO2e, per the configured
/// allometric coefficients.
fn allometric_chain(sample: &CrownSample, a: &AllometryConfig) -> TreeMetrics {
    let dbh_cm = a.dbh_slope * sample.height_m + a.dbh_intercept;
    let agb_kg = a.coeff_a * a.wood_density * dbh_cm.powf(a.exponent_b);
    let total_biomass_kg = agb_kg * (1.0 + a.bgb_ratio);
    let carbon_kg = total_biomass_kg * a.carbon_fraction;
    let co2_kg = carbon_kg * a.co2_factor;
    TreeMetrics {
        tree_id: sample.label,
        height_m: sample.height_m,
        crown_area_sqm: sample.area_sqm,
        estimated_dbh_cm: dbh_cm,
        agb_kg,
        total_biomass_kg,
        carbon_kg,
        co2_sequestered_kg: co2_kg,
    }
}

/// Write the inventory CSV artifact, one row per tree.
pub fn write_inventory(path: &Path, summary: &CarbonSummary) -> Result<(), StageError> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    for tree in &summary.trees {
        writer
            .serialize(tree)
            .map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
    Ok(())
}
