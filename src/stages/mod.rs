//! The three analytical stages of the pipeline.
//!
//! Each stage is a pure transform from the previous stage's output to the
//! next artifact; the orchestrator owns sequencing and status persistence.

mod carbon;
mod chm;
mod delineate;

pub use carbon::{estimate_carbon, write_inventory, CarbonSummary, TreeMetrics};
pub use chm::build_chm;
pub use delineate::{delineate_crowns, read_crowns, write_crowns};
