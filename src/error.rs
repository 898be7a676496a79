//! Stage-level error taxonomy.
//!
//! `MetricExtraction` is the only recoverable variant: the estimator catches
//! it per tree, logs, and continues. Everything else aborts the remaining
//! chain for the unit and lands in a terminal `FAILED:<message>` status.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// A required input artifact is absent at stage start.
    #[error("required input missing: {path}")]
    InputMissing { path: PathBuf },

    /// Zero crowns after segmentation, or zero trees after filtering.
    #[error("no tree candidates found: {0}")]
    NoCandidatesFound(String),

    /// Per-tree masking/geometry failure. Recoverable: skip the tree.
    #[error("metric extraction failed for tree {tree_id}: {reason}")]
    MetricExtraction { tree_id: u32, reason: String },

    /// Unreadable raster or vector artifact.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Two rasters combined pixel-wise do not share a grid.
    #[error("raster grids not aligned: {0}")]
    GridMismatch(String),

    /// A status write violated the state machine (regression or write after
    /// a terminal state).
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    /// Unknown processing unit id.
    #[error("unknown unit: {0}")]
    UnknownUnit(u64),

    /// A create would clobber an already-submitted unit.
    #[error("unit already exists: {0}")]
    DuplicateUnit(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether the estimator may skip the offending item and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StageError::MetricExtraction { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_metric_extraction_is_recoverable() {
        assert!(StageError::MetricExtraction {
            tree_id: 3,
            reason: "degenerate ring".into()
        }
        .is_recoverable());
        assert!(!StageError::NoCandidatesFound("empty".into()).is_recoverable());
        assert!(!StageError::InputMissing {
            path: "dsm.tif".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_failure_messages_are_diagnostic() {
        let err = StageError::InputMissing {
            path: PathBuf::from("/data/7/dsm.tif"),
        };
        assert!(err.to_string().contains("/data/7/dsm.tif"));
    }
}
