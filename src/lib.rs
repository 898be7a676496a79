//! Canopy Carbon Pipeline
//!
//! Batch pipeline turning a drone-derived elevation surface into a per-tree
//! carbon-sequestration inventory.
//!
//! # Architecture
//!
//! - **Raster**: gridded elevation I/O, resampling, and smoothing
//! - **Vector**: crown polygon geometry and WKT serialization
//! - **Stages**: canopy height derivation, watershed crown delineation,
//!   allometric carbon estimation
//! - **Pipeline**: status state machine, work dispatch, and the
//!   stage-sequencing orchestrator
//!
//! # Usage
//!
//! ```no_run
//! use canopy_carbon::{Config, JsonStatusStore, InProcessDispatcher, run_unit};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let store = Arc::new(JsonStatusStore::new(config.data_root.clone()));
//!     let record = run_unit(
//!         config,
//!         store,
//!         &InProcessDispatcher::new(),
//!         "survey-plot",
//!         "dsm.tif".as_ref(),
//!     )?;
//!     println!("{}", record.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod raster;
pub mod stages;
pub mod vector;

pub use config::{AllometryConfig, ChmConfig, Config, DelineationConfig, FilterConfig};
pub use error::StageError;
pub use pipeline::{
    Dispatcher, InMemoryStatusStore, InProcessDispatcher, JsonStatusStore, Orchestrator,
    StatusStore, TokioDispatcher, UnitRecord, UnitStatus, UnitUpdate,
};
pub use raster::Raster;
pub use stages::{CarbonSummary, TreeMetrics};
pub use vector::CrownPolygon;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Submit one elevation raster through the full pipeline and wait for its
/// terminal state.
///
/// Allocates a fresh unit id from the store, stages the surface model into
/// the unit's artifact directory, marks it accepted, and dispatches the
/// stage chain. The returned record is always terminal (`COMPLETED` or
/// `FAILED:*`); stage failures are encoded in the record, not surfaced as
/// an `Err`.
pub fn run_unit(
    config: Config,
    store: Arc<dyn StatusStore>,
    dispatcher: &dyn Dispatcher,
    name: &str,
    dsm_source: &Path,
) -> Result<UnitRecord> {
    config.validate()?;

    let unit_id = store.next_id()?;
    tracing::info!("unit {}: submitting '{}'", unit_id, name);

    store
        .create(UnitRecord::new(unit_id, name))
        .context("creating unit record")?;

    pipeline::paths::ensure_unit_dir(&config.data_root, unit_id)?;
    let dsm_dest = pipeline::paths::dsm_path(&config.data_root, unit_id);
    std::fs::copy(dsm_source, &dsm_dest)
        .with_context(|| format!("staging {}", dsm_source.display()))?;

    let orchestrator = Arc::new(Orchestrator::new(config, store.clone()));
    orchestrator.accept(unit_id)?;
    orchestrator.initiate(dispatcher, unit_id).wait();

    Ok(store.get(unit_id)?)
}

/// Build a Tokio runtime with the specified configuration.
///
/// Stage chains run on the blocking pool, so no I/O or timer drivers are
/// enabled.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
