//! Per-unit processing status and the durable record behind it.
//!
//! Statuses form a linear state machine. Transitions only move forward;
//! `Completed` and `Failed` are terminal. Any non-terminal state may jump
//! straight to `Failed` with a diagnostic message.

use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Processing state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum UnitStatus {
    PendingUpload,
    Accepted,
    Photogrammetry,
    GeneratingChm,
    SegmentingTrees,
    CalculatingCarbon,
    Completed,
    Failed(String),
}

impl UnitStatus {
    /// Position in the forward sequence. `Failed` sits past `Completed` so
    /// ordinal comparison alone never permits leaving it.
    fn ordinal(&self) -> u8 {
        match self {
            UnitStatus::PendingUpload => 0,
            UnitStatus::Accepted => 1,
            UnitStatus::Photogrammetry => 2,
            UnitStatus::GeneratingChm => 3,
            UnitStatus::SegmentingTrees => 4,
            UnitStatus::CalculatingCarbon => 5,
            UnitStatus::Completed => 6,
            UnitStatus::Failed(_) => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed(_))
    }

    /// Whether moving from `self` to `to` is a legal forward transition.
    pub fn can_transition(&self, to: &UnitStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            UnitStatus::Failed(_) => true,
            _ => to.ordinal() > self.ordinal(),
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::PendingUpload => write!(f, "PENDING_UPLOAD"),
            UnitStatus::Accepted => write!(f, "ACCEPTED"),
            UnitStatus::Photogrammetry => write!(f, "PROCESSING:PHOTOGRAMMETRY"),
            UnitStatus::GeneratingChm => write!(f, "PROCESSING:GENERATING_CHM"),
            UnitStatus::SegmentingTrees => write!(f, "PROCESSING:SEGMENTING_TREES"),
            UnitStatus::CalculatingCarbon => write!(f, "PROCESSING:CALCULATING_CARBON"),
            UnitStatus::Completed => write!(f, "COMPLETED"),
            UnitStatus::Failed(msg) => write!(f, "FAILED:{}", msg),
        }
    }
}

impl From<UnitStatus> for String {
    fn from(status: UnitStatus) -> String {
        status.to_string()
    }
}

impl TryFrom<String> for UnitStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "PENDING_UPLOAD" => Ok(UnitStatus::PendingUpload),
            "ACCEPTED" => Ok(UnitStatus::Accepted),
            "PROCESSING:PHOTOGRAMMETRY" => Ok(UnitStatus::Photogrammetry),
            "PROCESSING:GENERATING_CHM" => Ok(UnitStatus::GeneratingChm),
            "PROCESSING:SEGMENTING_TREES" => Ok(UnitStatus::SegmentingTrees),
            "PROCESSING:CALCULATING_CARBON" => Ok(UnitStatus::CalculatingCarbon),
            "COMPLETED" => Ok(UnitStatus::Completed),
            other => match other.strip_prefix("FAILED:") {
                Some(msg) => Ok(UnitStatus::Failed(msg.to_string())),
                None => Err(format!("unknown unit status: {}", other)),
            },
        }
    }
}

/// Durable record for one processing unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Unit identifier, unique under one data root
    pub id: u64,

    /// Human-readable name supplied at submission
    pub name: String,

    /// Current processing state
    pub status: UnitStatus,

    /// Canopy height raster artifact, once generated
    pub chm_path: Option<PathBuf>,

    /// Crown outlines artifact, once delineated
    pub crowns_path: Option<PathBuf>,

    /// Carbon inventory artifact, once estimated
    pub results_path: Option<PathBuf>,

    /// Aggregate sequestration, set only on completion
    pub total_co2_tonnes: Option<f64>,
}

impl UnitRecord {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: UnitStatus::PendingUpload,
            chm_path: None,
            crowns_path: None,
            results_path: None,
            total_co2_tonnes: None,
        }
    }
}

/// Field updates applied alongside a status transition. Absent fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct UnitUpdate {
    pub chm_path: Option<PathBuf>,
    pub crowns_path: Option<PathBuf>,
    pub results_path: Option<PathBuf>,
    pub total_co2_tonnes: Option<f64>,
}

impl UnitUpdate {
    fn apply(self, record: &mut UnitRecord) {
        if let Some(p) = self.chm_path {
            record.chm_path = Some(p);
        }
        if let Some(p) = self.crowns_path {
            record.crowns_path = Some(p);
        }
        if let Some(p) = self.results_path {
            record.results_path = Some(p);
        }
        if let Some(t) = self.total_co2_tonnes {
            record.total_co2_tonnes = Some(t);
        }
    }
}

/// Durable per-unit status storage with single-record update semantics.
pub trait StatusStore: Send + Sync {
    /// Allocate an id for a new unit: one past the highest id the store
    /// already holds. Ids stay unique across process runs for durable
    /// stores.
    fn next_id(&self) -> Result<u64, StageError>;

    /// Persist a freshly submitted unit. Rejects an id that already exists;
    /// records are never re-created or reset.
    fn create(&self, record: UnitRecord) -> Result<(), StageError>;

    /// Fetch the current record.
    fn get(&self, id: u64) -> Result<UnitRecord, StageError>;

    /// Transition a unit and merge field updates atomically. Rejects
    /// backward or out-of-terminal transitions.
    fn update(&self, id: u64, status: UnitStatus, fields: UnitUpdate) -> Result<(), StageError>;
}

fn checked_transition(
    record: &mut UnitRecord,
    status: UnitStatus,
    fields: UnitUpdate,
) -> Result<(), StageError> {
    if !record.status.can_transition(&status) {
        return Err(StageError::InvalidTransition(format!(
            "unit {}: {} -> {}",
            record.id, record.status, status
        )));
    }
    record.status = status;
    fields.apply(record);
    Ok(())
}

/// In-memory store. Keeps the full transition history per unit, which the
/// tests use to assert status ordering.
#[derive(Default)]
pub struct InMemoryStatusStore {
    inner: Mutex<HashMap<u64, (UnitRecord, Vec<UnitStatus>)>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status the unit has held, in write order.
    pub fn history(&self, id: u64) -> Vec<UnitStatus> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&id).map(|(_, h)| h.clone()).unwrap_or_default()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn next_id(&self) -> Result<u64, StageError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.keys().max().map_or(1, |max| max + 1))
    }

    fn create(&self, record: UnitRecord) -> Result<(), StageError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.contains_key(&record.id) {
            return Err(StageError::DuplicateUnit(record.id));
        }
        let history = vec![record.status.clone()];
        inner.insert(record.id, (record, history));
        Ok(())
    }

    fn get(&self, id: u64) -> Result<UnitRecord, StageError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(&id)
            .map(|(r, _)| r.clone())
            .ok_or(StageError::UnknownUnit(id))
    }

    fn update(&self, id: u64, status: UnitStatus, fields: UnitUpdate) -> Result<(), StageError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (record, history) = inner.get_mut(&id).ok_or(StageError::UnknownUnit(id))?;
        checked_transition(record, status, fields)?;
        history.push(record.status.clone());
        Ok(())
    }
}

/// File-backed store: one JSON document per unit at
/// `<data_root>/<id>/unit.json`, replaced atomically via rename.
pub struct JsonStatusStore {
    data_root: PathBuf,
    // Serializes read-modify-write cycles across threads of this process.
    lock: Mutex<()>,
}

impl JsonStatusStore {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.data_root.join(id.to_string()).join("unit.json")
    }

    fn write_record(&self, record: &UnitRecord) -> Result<(), StageError> {
        let path = self.record_path(record.id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record(&self, path: &Path, id: u64) -> Result<UnitRecord, StageError> {
        if !path.exists() {
            return Err(StageError::UnknownUnit(id));
        }
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| StageError::UnsupportedFormat(e.to_string()))
    }
}

impl StatusStore for JsonStatusStore {
    /// Scans the unit directories under the data root, so ids survive
    /// process restarts.
    fn next_id(&self) -> Result<u64, StageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut max_id = 0u64;
        if self.data_root.exists() {
            for entry in std::fs::read_dir(&self.data_root)? {
                let entry = entry?;
                if let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u64>().ok())
                {
                    max_id = max_id.max(id);
                }
            }
        }
        Ok(max_id + 1)
    }

    fn create(&self, record: UnitRecord) -> Result<(), StageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.record_path(record.id).exists() {
            return Err(StageError::DuplicateUnit(record.id));
        }
        self.write_record(&record)
    }

    fn get(&self, id: u64) -> Result<UnitRecord, StageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_record(&self.record_path(id), id)
    }

    fn update(&self, id: u64, status: UnitStatus, fields: UnitUpdate) -> Result<(), StageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.record_path(id);
        let mut record = self.read_record(&path, id)?;
        checked_transition(&mut record, status, fields)?;
        self.write_record(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        let all = [
            UnitStatus::PendingUpload,
            UnitStatus::Accepted,
            UnitStatus::Photogrammetry,
            UnitStatus::GeneratingChm,
            UnitStatus::SegmentingTrees,
            UnitStatus::CalculatingCarbon,
            UnitStatus::Completed,
            UnitStatus::Failed("dsm missing".into()),
        ];
        for status in all {
            let s = status.to_string();
            assert_eq!(UnitStatus::try_from(s).unwrap(), status);
        }
        assert_eq!(
            UnitStatus::GeneratingChm.to_string(),
            "PROCESSING:GENERATING_CHM"
        );
        assert!(UnitStatus::try_from("BOGUS".to_string()).is_err());
    }

    #[test]
    fn test_transitions_only_move_forward() {
        assert!(UnitStatus::Accepted.can_transition(&UnitStatus::Photogrammetry));
        assert!(UnitStatus::Accepted.can_transition(&UnitStatus::GeneratingChm));
        assert!(!UnitStatus::GeneratingChm.can_transition(&UnitStatus::Accepted));
        assert!(!UnitStatus::Accepted.can_transition(&UnitStatus::Accepted));
    }

    #[test]
    fn test_terminal_states_are_locked() {
        let failed = UnitStatus::Failed("boom".into());
        assert!(!UnitStatus::Completed.can_transition(&failed));
        assert!(!failed.can_transition(&UnitStatus::Completed));
        assert!(!failed.can_transition(&UnitStatus::Failed("again".into())));
        assert!(UnitStatus::CalculatingCarbon.can_transition(&failed));
    }

    #[test]
    fn test_in_memory_store_update_and_history() {
        let store = InMemoryStatusStore::new();
        store.create(UnitRecord::new(1, "plot-a")).unwrap();
        store
            .update(1, UnitStatus::Accepted, UnitUpdate::default())
            .unwrap();
        store
            .update(
                1,
                UnitStatus::Completed,
                UnitUpdate {
                    total_co2_tonnes: Some(1.5),
                    ..Default::default()
                },
            )
            .unwrap();
        let record = store.get(1).unwrap();
        assert_eq!(record.status, UnitStatus::Completed);
        assert_eq!(record.total_co2_tonnes, Some(1.5));
        assert_eq!(
            store.history(1),
            vec![
                UnitStatus::PendingUpload,
                UnitStatus::Accepted,
                UnitStatus::Completed
            ]
        );
    }

    #[test]
    fn test_store_rejects_backward_transition() {
        let store = InMemoryStatusStore::new();
        store.create(UnitRecord::new(1, "plot-a")).unwrap();
        store
            .update(1, UnitStatus::SegmentingTrees, UnitUpdate::default())
            .unwrap();
        let err = store
            .update(1, UnitStatus::Accepted, UnitUpdate::default())
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidTransition(_)));
    }

    #[test]
    fn test_unknown_unit() {
        let store = InMemoryStatusStore::new();
        assert!(matches!(store.get(99), Err(StageError::UnknownUnit(99))));
    }

    #[test]
    fn test_create_never_resets_an_existing_unit() {
        let store = InMemoryStatusStore::new();
        store.create(UnitRecord::new(1, "plot-a")).unwrap();
        store
            .update(1, UnitStatus::Accepted, UnitUpdate::default())
            .unwrap();
        store
            .update(
                1,
                UnitStatus::Completed,
                UnitUpdate {
                    total_co2_tonnes: Some(4.2),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = store.create(UnitRecord::new(1, "plot-b")).unwrap_err();
        assert!(matches!(err, StageError::DuplicateUnit(1)));

        // The terminal record survives untouched.
        let record = store.get(1).unwrap();
        assert_eq!(record.name, "plot-a");
        assert_eq!(record.status, UnitStatus::Completed);
        assert_eq!(record.total_co2_tonnes, Some(4.2));
    }

    #[test]
    fn test_in_memory_next_id_advances_past_existing() {
        let store = InMemoryStatusStore::new();
        assert_eq!(store.next_id().unwrap(), 1);
        store.create(UnitRecord::new(1, "plot-a")).unwrap();
        store.create(UnitRecord::new(5, "plot-b")).unwrap();
        assert_eq!(store.next_id().unwrap(), 6);
    }

    #[test]
    fn test_json_next_id_survives_store_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonStatusStore::new(dir.path());
            let id = store.next_id().unwrap();
            assert_eq!(id, 1);
            store.create(UnitRecord::new(id, "plot-a")).unwrap();
        }
        // A fresh store over the same root allocates past the persisted unit.
        let store = JsonStatusStore::new(dir.path());
        assert_eq!(store.next_id().unwrap(), 2);
        let err = store.create(UnitRecord::new(1, "plot-b")).unwrap_err();
        assert!(matches!(err, StageError::DuplicateUnit(1)));
        assert_eq!(store.get(1).unwrap().name, "plot-a");
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStatusStore::new(dir.path());
        store.create(UnitRecord::new(7, "plot-b")).unwrap();
        store
            .update(
                7,
                UnitStatus::Accepted,
                UnitUpdate {
                    chm_path: Some(dir.path().join("7/chm.tif")),
                    ..Default::default()
                },
            )
            .unwrap();
        let record = store.get(7).unwrap();
        assert_eq!(record.name, "plot-b");
        assert_eq!(record.status, UnitStatus::Accepted);
        assert!(record.chm_path.is_some());
        assert!(dir.path().join("7/unit.json").exists());
    }
}
