//! Stage sequencing for one processing unit.
//!
//! The orchestrator runs the chain DSM → CHM → crowns → carbon inventory,
//! persisting a status transition before each stage and a terminal state at
//! the end. Stages hand each other explicit result records, never derived
//! paths. The first failure short-circuits the rest of the chain and records
//! `FAILED` with the diagnostic.

use crate::config::Config;
use crate::error::StageError;
use crate::pipeline::dispatch::{Dispatcher, JobHandle};
use crate::pipeline::paths;
use crate::pipeline::status::{StatusStore, UnitStatus, UnitUpdate};
use crate::raster::{read_geotiff, write_geotiff};
use crate::stages::{build_chm, delineate_crowns, estimate_carbon, read_crowns, write_crowns, write_inventory};
use std::path::PathBuf;
use std::sync::Arc;

/// First-stage result: the surface model is staged and readable.
struct DsmReady {
    unit_id: u64,
    dsm_path: PathBuf,
}

/// Second-stage result: the canopy height raster artifact.
struct ChmReady {
    unit_id: u64,
    chm_path: PathBuf,
}

/// Third-stage result: the crown outlines artifact, plus the height raster
/// the carbon stage re-reads.
struct CrownsReady {
    unit_id: u64,
    chm_path: PathBuf,
    crowns_path: PathBuf,
}

pub struct Orchestrator {
    config: Config,
    store: Arc<dyn StatusStore>,
}

impl Orchestrator {
    pub fn new(config: Config, store: Arc<dyn StatusStore>) -> Self {
        Self { config, store }
    }

    /// Mark a freshly uploaded unit ready for processing.
    pub fn accept(&self, unit_id: u64) -> Result<(), StageError> {
        self.store
            .update(unit_id, UnitStatus::Accepted, UnitUpdate::default())
    }

    /// Submit the unit's stage chain for asynchronous execution. Returns as
    /// soon as the job is handed to the dispatcher; the handle resolves when
    /// the chain reaches a terminal state.
    pub fn initiate(self: &Arc<Self>, dispatcher: &dyn Dispatcher, unit_id: u64) -> JobHandle {
        let orchestrator = Arc::clone(self);
        dispatcher.submit(Box::new(move || {
            orchestrator.run_chain(unit_id);
        }))
    }

    /// Execute the full chain, recording the terminal state. Never panics on
    /// stage failure.
    fn run_chain(&self, unit_id: u64) {
        tracing::info!("unit {}: starting stage chain", unit_id);
        match self.execute_stages(unit_id) {
            Ok(total) => {
                tracing::info!("unit {}: completed, {:.3} t CO2e", unit_id, total);
            }
            Err(e) => {
                tracing::error!("unit {}: failed: {}", unit_id, e);
                let failed = UnitStatus::Failed(e.to_string());
                if let Err(write_err) = self.store.update(unit_id, failed, UnitUpdate::default()) {
                    tracing::error!(
                        "unit {}: could not record failure: {}",
                        unit_id,
                        write_err
                    );
                }
            }
        }
    }

    fn execute_stages(&self, unit_id: u64) -> Result<f64, StageError> {
        let dsm = self.stage_photogrammetry(unit_id)?;
        let chm = self.stage_generate_chm(dsm)?;
        let crowns = self.stage_segment_trees(chm)?;
        self.stage_calculate_carbon(crowns)
    }

    /// Surface reconstruction is out of scope here; this stage verifies the
    /// staged elevation raster exists before committing the unit to
    /// processing.
    fn stage_photogrammetry(&self, unit_id: u64) -> Result<DsmReady, StageError> {
        self.store
            .update(unit_id, UnitStatus::Photogrammetry, UnitUpdate::default())?;
        let dsm_path = paths::dsm_path(&self.config.data_root, unit_id);
        if !dsm_path.exists() {
            return Err(StageError::InputMissing { path: dsm_path });
        }
        Ok(DsmReady { unit_id, dsm_path })
    }

    fn stage_generate_chm(&self, input: DsmReady) -> Result<ChmReady, StageError> {
        self.store.update(
            input.unit_id,
            UnitStatus::GeneratingChm,
            UnitUpdate::default(),
        )?;
        let dsm = read_geotiff(&input.dsm_path)?;
        let chm = build_chm(&dsm, &self.config.chm)?;
        let chm_path = paths::chm_path(&self.config.data_root, input.unit_id);
        write_geotiff(&chm_path, &chm)?;
        self.store.update(
            input.unit_id,
            UnitStatus::SegmentingTrees,
            UnitUpdate {
                chm_path: Some(chm_path.clone()),
                ..Default::default()
            },
        )?;
        Ok(ChmReady {
            unit_id: input.unit_id,
            chm_path,
        })
    }

    fn stage_segment_trees(&self, input: ChmReady) -> Result<CrownsReady, StageError> {
        let chm = read_geotiff(&input.chm_path)?;
        let crowns = delineate_crowns(&chm, &self.config.delineation);
        let crowns_path = paths::crowns_path(&self.config.data_root, input.unit_id);
        write_crowns(&crowns_path, &crowns)?;
        self.store.update(
            input.unit_id,
            UnitStatus::CalculatingCarbon,
            UnitUpdate {
                crowns_path: Some(crowns_path.clone()),
                ..Default::default()
            },
        )?;
        Ok(CrownsReady {
            unit_id: input.unit_id,
            chm_path: input.chm_path,
            crowns_path,
        })
    }

    fn stage_calculate_carbon(&self, input: CrownsReady) -> Result<f64, StageError> {
        let chm = read_geotiff(&input.chm_path)?;
        let crowns = read_crowns(&input.crowns_path)?;
        let summary = estimate_carbon(
            &chm,
            &crowns,
            &self.config.filtering,
            &self.config.allometry,
        )?;
        let results_path = paths::inventory_path(&self.config.data_root, input.unit_id);
        write_inventory(&results_path, &summary)?;
        self.store.update(
            input.unit_id,
            UnitStatus::Completed,
            UnitUpdate {
                results_path: Some(results_path),
                total_co2_tonnes: Some(summary.total_co2_tonnes),
                ..Default::default()
            },
        )?;
        Ok(summary.total_co2_tonnes)
    }
}
