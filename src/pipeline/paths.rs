//! Canonical artifact layout for a processing unit.
//!
//! Every artifact of unit N lives under `<data_root>/N/`. All path
//! construction goes through this module so stages and the status store
//! never derive locations from each other's outputs.

use crate::error::StageError;
use std::path::{Path, PathBuf};

pub const DSM_FILENAME: &str = "dsm.tif";
pub const CHM_FILENAME: &str = "chm.tif";
pub const CROWNS_FILENAME: &str = "tree_crowns.csv";
pub const INVENTORY_FILENAME: &str = "carbon_inventory.csv";

/// Exclusive artifact directory for one unit.
pub fn unit_dir(data_root: &Path, id: u64) -> PathBuf {
    data_root.join(id.to_string())
}

pub fn dsm_path(data_root: &Path, id: u64) -> PathBuf {
    unit_dir(data_root, id).join(DSM_FILENAME)
}

pub fn chm_path(data_root: &Path, id: u64) -> PathBuf {
    unit_dir(data_root, id).join(CHM_FILENAME)
}

pub fn crowns_path(data_root: &Path, id: u64) -> PathBuf {
    unit_dir(data_root, id).join(CROWNS_FILENAME)
}

pub fn inventory_path(data_root: &Path, id: u64) -> PathBuf {
    unit_dir(data_root, id).join(INVENTORY_FILENAME)
}

pub fn ensure_unit_dir(data_root: &Path, id: u64) -> Result<PathBuf, StageError> {
    let dir = unit_dir(data_root, id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_layout() {
        let root = Path::new("/data");
        assert_eq!(dsm_path(root, 3), PathBuf::from("/data/3/dsm.tif"));
        assert_eq!(chm_path(root, 3), PathBuf::from("/data/3/chm.tif"));
        assert_eq!(
            crowns_path(root, 3),
            PathBuf::from("/data/3/tree_crowns.csv")
        );
        assert_eq!(
            inventory_path(root, 3),
            PathBuf::from("/data/3/carbon_inventory.csv")
        );
    }

    #[test]
    fn test_ensure_unit_dir_creates() {
        let dir = tempfile::tempdir().unwrap();
        let created = ensure_unit_dir(dir.path(), 9).unwrap();
        assert!(created.is_dir());
    }
}
