//! Configuration for the canopy carbon pipeline.
//!
//! All scientific constants and tuning thresholds live here rather than in
//! code, so recalibration never requires a redeploy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding one exclusive subdirectory per processing unit
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Canopy height model derivation
    #[serde(default)]
    pub chm: ChmConfig,

    /// Tree crown delineation
    #[serde(default)]
    pub delineation: DelineationConfig,

    /// Realistic-dimension filtering applied before the allometric chain
    #[serde(default)]
    pub filtering: FilterConfig,

    /// Allometric constants
    #[serde(default)]
    pub allometry: AllometryConfig,
}

/// CHM builder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChmConfig {
    /// Coarse pixel size (map units) for the sparse terrain sample.
    /// Larger values discard more canopy detail from the terrain estimate.
    #[serde(default = "default_ground_sample")]
    pub ground_sample_m: f64,
}

/// Crown delineation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelineationConfig {
    /// Cells below this height are zeroed before segmentation (ground noise)
    #[serde(default = "default_min_height")]
    pub min_height_m: f64,

    /// Downsample factor applied before segmentation, in (0, 1]
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,

    /// Gaussian sigma (pixels) smoothing the downsampled raster
    #[serde(default = "default_smoothing_sigma")]
    pub smoothing_sigma: f64,

    /// Minimum pairwise pixel separation between detected apexes
    #[serde(default = "default_min_peak_distance")]
    pub min_peak_distance: usize,

    /// Crown polygons at or below this planar area are dropped as fragments
    #[serde(default = "default_min_crown_area")]
    pub min_crown_area_sqm: f64,
}

/// Realistic tree dimension bounds. Trees outside either range are sensor
/// noise or clipped-edge artifacts and are discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_filter_min_height")]
    pub min_height_m: f64,

    #[serde(default = "default_filter_max_height")]
    pub max_height_m: f64,

    #[serde(default = "default_filter_min_area")]
    pub min_crown_area_sqm: f64,

    #[serde(default = "default_filter_max_area")]
    pub max_crown_area_sqm: f64,
}

/// Allometric chain constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllometryConfig {
    /// estimated_dbh_cm = dbh_slope * height_m + dbh_intercept
    #[serde(default = "default_dbh_slope")]
    pub dbh_slope: f64,

    #[serde(default = "default_dbh_intercept")]
    pub dbh_intercept: f64,

    /// agb_kg = coeff_a * (wood_density * dbh^exponent_b)
    #[serde(default = "default_coeff_a")]
    pub coeff_a: f64,

    #[serde(default = "default_exponent_b")]
    pub exponent_b: f64,

    /// Wood density rho (g/cm3)
    #[serde(default = "default_wood_density")]
    pub wood_density: f64,

    /// Below-ground to above-ground biomass ratio
    #[serde(default = "default_bgb_ratio")]
    pub bgb_ratio: f64,

    /// Carbon fraction of total biomass
    #[serde(default = "default_carbon_fraction")]
    pub carbon_fraction: f64,

    /// CO2 mass per unit carbon mass
    #[serde(default = "default_co2_factor")]
    pub co2_factor: f64,
}

impl Default for ChmConfig {
    fn default() -> Self {
        Self {
            ground_sample_m: default_ground_sample(),
        }
    }
}

impl Default for DelineationConfig {
    fn default() -> Self {
        Self {
            min_height_m: default_min_height(),
            scale_factor: default_scale_factor(),
            smoothing_sigma: default_smoothing_sigma(),
            min_peak_distance: default_min_peak_distance(),
            min_crown_area_sqm: default_min_crown_area(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_height_m: default_filter_min_height(),
            max_height_m: default_filter_max_height(),
            min_crown_area_sqm: default_filter_min_area(),
            max_crown_area_sqm: default_filter_max_area(),
        }
    }
}

impl Default for AllometryConfig {
    fn default() -> Self {
        Self {
            dbh_slope: default_dbh_slope(),
            dbh_intercept: default_dbh_intercept(),
            coeff_a: default_coeff_a(),
            exponent_b: default_exponent_b(),
            wood_density: default_wood_density(),
            bgb_ratio: default_bgb_ratio(),
            carbon_fraction: default_carbon_fraction(),
            co2_factor: default_co2_factor(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            chm: ChmConfig::default(),
            delineation: DelineationConfig::default(),
            filtering: FilterConfig::default(),
            allometry: AllometryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON, so it also covers untagged files
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chm.ground_sample_m <= 0.0 {
            anyhow::bail!("ground_sample_m must be > 0");
        }
        let d = &self.delineation;
        if !(d.scale_factor > 0.0 && d.scale_factor <= 1.0) {
            anyhow::bail!("delineation scale_factor must be in (0, 1]");
        }
        if d.smoothing_sigma < 0.0 {
            anyhow::bail!("smoothing_sigma must be >= 0");
        }
        if d.min_peak_distance == 0 {
            anyhow::bail!("min_peak_distance must be >= 1");
        }
        let f = &self.filtering;
        if f.min_height_m >= f.max_height_m {
            anyhow::bail!("filter height bounds must satisfy min < max");
        }
        if f.min_crown_area_sqm >= f.max_crown_area_sqm {
            anyhow::bail!("filter area bounds must satisfy min < max");
        }
        if self.allometry.exponent_b <= 0.0 {
            anyhow::bail!("allometric exponent_b must be > 0");
        }
        if self.allometry.wood_density <= 0.0 {
            anyhow::bail!("wood_density must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_data_root() -> PathBuf { PathBuf::from("./data") }
fn default_ground_sample() -> f64 { 5.0 }
fn default_min_height() -> f64 { 1.0 }
fn default_scale_factor() -> f64 { 0.5 }
fn default_smoothing_sigma() -> f64 { 2.0 }
fn default_min_peak_distance() -> usize { 3 }
fn default_min_crown_area() -> f64 { 2.0 }
fn default_filter_min_height() -> f64 { 0.5 }
fn default_filter_max_height() -> f64 { 50.0 }
fn default_filter_min_area() -> f64 { 0.5 }
fn default_filter_max_area() -> f64 { 500.0 }
fn default_dbh_slope() -> f64 { 0.3 }
fn default_dbh_intercept() -> f64 { 0.1 }
fn default_coeff_a() -> f64 { 0.1 }
fn default_exponent_b() -> f64 { 2.46 }
fn default_wood_density() -> f64 { 0.65 }
fn default_bgb_ratio() -> f64 { 0.5 }
fn default_carbon_fraction() -> f64 { 0.47 }
fn default_co2_factor() -> f64 { 3.67 }
