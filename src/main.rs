//! Canopy Carbon Pipeline CLI
//!
//! Runs a drone elevation raster through CHM generation, crown delineation,
//! and carbon estimation.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use canopy_carbon::{
    build_runtime, init_rayon, run_unit, Config, JsonStatusStore, TokioDispatcher, UnitStatus,
};

#[derive(Parser)]
#[command(name = "canopy-carbon")]
#[command(about = "Per-tree carbon estimation from drone elevation rasters", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one elevation raster through the full pipeline
    Run {
        /// Input surface-elevation GeoTIFF
        dsm: PathBuf,

        /// Human-readable name for the processing unit
        #[arg(short, long, default_value = "unnamed-unit")]
        name: String,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { dsm, name } => run_command(cli.config, dsm, name)?,
        Commands::Validate => validate_command(cli.config)?,
        Commands::GenerateConfig { output } => generate_config_command(output)?,
    }

    Ok(())
}

fn run_command(config_path: PathBuf, dsm: PathBuf, name: String) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;

    init_rayon(None)?;
    let runtime = build_runtime(None)?;
    let dispatcher = TokioDispatcher::new(runtime.handle().clone());
    let store = Arc::new(JsonStatusStore::new(config.data_root.clone()));

    let record = run_unit(config, store, &dispatcher, &name, &dsm)?;
    println!("unit {} ({}): {}", record.id, record.name, record.status);
    match record.status {
        UnitStatus::Completed => {
            if let (Some(total), Some(results)) = (record.total_co2_tonnes, &record.results_path) {
                println!("total CO2e: {:.3} tonnes", total);
                println!("inventory: {}", results.display());
            }
            Ok(())
        }
        status => anyhow::bail!("processing did not complete: {}", status),
    }
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Canopy Carbon Pipeline Configuration

# Root directory for per-unit artifact directories.
# Each unit N writes dsm.tif, chm.tif, tree_crowns.csv, carbon_inventory.csv
# and its status record under <data_root>/N/.
data_root: "/tmp/canopy-carbon"

# === CHM: terrain estimation ===
chm:
  # Coarse pixel size (meters) used to sample approximate bare ground.
  # Larger values assume wider canopies; must exceed the input pixel size.
  ground_sample_m: 5.0

# === DELINEATION: crown segmentation ===
delineation:
  # Canopy below this height (meters) is treated as ground noise
  min_height_m: 1.0

  # Downsampling factor applied before segmentation (0 < factor <= 1)
  scale_factor: 0.5

  # Gaussian sigma (pixels) for pre-segmentation smoothing
  smoothing_sigma: 2.0

  # Minimum pixel separation between detected tree apexes
  min_peak_distance: 3

  # Crown polygons at or below this area (m2) are discarded as fragments
  min_crown_area_sqm: 2.0

# === FILTERING: plausibility window for measured trees ===
filtering:
  min_height_m: 0.5
  max_height_m: 50.0
  min_crown_area_sqm: 0.5
  max_crown_area_sqm: 500.0

# === ALLOMETRY: carbon model coefficients ===
allometry:
  # estimated_dbh_cm = dbh_slope * height_m + dbh_intercept
  dbh_slope: 0.3
  dbh_intercept: 0.1

  # agb_kg = coeff_a * wood_density * dbh_cm ^ exponent_b
  coeff_a: 0.1
  exponent_b: 2.46
  wood_density: 0.65

  # Below-ground biomass as a fraction of above-ground
  bgb_ratio: 0.5

  # Carbon mass fraction of dry biomass
  carbon_fraction: 0.47

  # CO2-equivalent mass per unit carbon mass
  co2_factor: 3.67
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["canopy-carbon", "run", "dsm.tif", "-n", "plot-a"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_validate() {
        let cli = Cli::try_parse_from(["canopy-carbon", "validate", "-c", "test.yaml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_generated_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(path.clone()).unwrap();
        let yaml = std::fs::read_to_string(path).unwrap();
        let config = Config::from_yaml(&yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.delineation.min_peak_distance, 3);
    }
}
