//! servcur-state: Layer 0 of servcur
//!
//! Records and persistence behind the orchestrator:
//! - the job registry (one active job per project and command)
//! - the project store (`<data>/store/projects.json`)
//! - the build archive (`<data>/builds/<io_id>.json`)
//!
//! Everything above this crate talks to the traits in [`storage_traits`].

pub mod archive;
pub mod error;
pub mod file_store;
pub mod memory;
pub mod schema;
pub mod storage_traits;

pub use archive::FsJobArchive;
pub use error::StorageError;
pub use file_store::JsonProjectStore;
pub use memory::{MemoryJobArchive, MemoryJobRegistry, MemoryProjectStore};
pub use schema::{
    ArchivedJob, DockerFile, ExitInfo, HistoryPage, JobCommand, JobId, JobRecord, JobState,
    Project, ProjectKey, ProjectKind,
};
pub use storage_traits::{JobArchive, JobRegistry, ProjectStore, StorageResult};
