//! Unit lifecycle: status persistence, work dispatch, artifact layout, and
//! the stage-sequencing orchestrator.

pub mod dispatch;
pub mod orchestrator;
pub mod paths;
pub mod status;

pub use dispatch::{Dispatcher, InProcessDispatcher, Job, JobHandle, TokioDispatcher};
pub use orchestrator::Orchestrator;
pub use status::{
    InMemoryStatusStore, JsonStatusStore, StatusStore, UnitRecord, UnitStatus, UnitUpdate,
};
