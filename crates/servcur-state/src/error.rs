//! Error types for servcur-state

use thiserror::Error;

use crate::schema::{JobCommand, JobState};

/// Errors that can occur in the state layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// No job with this io_id was ever registered
    #[error("job not found: {io_id}")]
    JobNotFound { io_id: String },

    /// A non-terminal job already exists for the (project, command) key
    #[error("{command} already active for {project} (io_id {active})")]
    AlreadyActive {
        project: String,
        command: JobCommand,
        active: String,
    },

    /// Requested state change would regress or repeat a state
    #[error("invalid transition for job {io_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        io_id: String,
        from: JobState,
        to: JobState,
    },

    /// Project not registered
    #[error("project not found: {project}")]
    ProjectNotFound { project: String },

    /// Filesystem error in a file-backed store
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
