//! Storage trait definitions for servcur
//!
//! - `JobRegistry`: in-flight and historical jobs, one-active-job rule
//! - `ProjectStore`: declared projects keyed by `(name, branch)`
//! - `JobArchive`: finished jobs with their output
//!
//! All traits are async and backend-agnostic.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{
    ArchivedJob, ExitInfo, HistoryPage, JobCommand, JobId, JobRecord, JobState, Project,
    ProjectKey,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// JobRegistry
// ---------------------------------------------------------------------------

/// Registry of dispatched jobs.
///
/// Guarantees:
/// - `io_id`s are unique for the registry's lifetime.
/// - At most one non-terminal job per `(project, command)`; `create` checks
///   and claims the slot in one step.
/// - States only move forward; terminal records never change again.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Register a new `Pending` job. Fails with `AlreadyActive` if the
    /// `(project, command)` slot is taken.
    async fn create(&self, project: &ProjectKey, command: JobCommand) -> StorageResult<JobRecord>;

    /// Look up a job by id.
    async fn get(&self, io_id: &JobId) -> StorageResult<Option<JobRecord>>;

    /// All non-terminal jobs, newest first.
    async fn list_active(&self) -> StorageResult<Vec<JobRecord>>;

    /// All jobs, newest first, paginated.
    async fn list_history(&self, page: HistoryPage) -> StorageResult<Vec<JobRecord>>;

    /// Move a job to `next`. Rejects regressions with `InvalidTransition`.
    async fn transition(&self, io_id: &JobId, next: JobState) -> StorageResult<JobRecord>;

    /// Move a job to a terminal state and record how it ended.
    async fn finish(
        &self,
        io_id: &JobId,
        terminal: JobState,
        exit: ExitInfo,
    ) -> StorageResult<JobRecord>;

    /// The active job holding the `(project, command)` slot, if any.
    async fn active_for(
        &self,
        project: &ProjectKey,
        command: JobCommand,
    ) -> StorageResult<Option<JobRecord>>;
}

// ---------------------------------------------------------------------------
// ProjectStore
// ---------------------------------------------------------------------------

/// Declared projects.
///
/// Semantics:
/// - `insert_if_absent` is idempotent on the key: an existing project is
///   returned unchanged together with `false`.
/// - `update` replaces an existing record; it never creates one.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Insert unless a project with the same key exists.
    /// Returns the stored project and whether it was newly created.
    async fn insert_if_absent(&self, project: Project) -> StorageResult<(Project, bool)>;

    async fn get(&self, key: &ProjectKey) -> StorageResult<Option<Project>>;

    /// All projects ordered by key.
    async fn list(&self) -> StorageResult<Vec<Project>>;

    /// Replace an existing project. Fails with `ProjectNotFound` if absent.
    async fn update(&self, project: Project) -> StorageResult<()>;

    /// Remove a project, returning it if it existed.
    async fn remove(&self, key: &ProjectKey) -> StorageResult<Option<Project>>;
}

// ---------------------------------------------------------------------------
// JobArchive
// ---------------------------------------------------------------------------

/// Write-once archive of finished jobs.
#[async_trait]
pub trait JobArchive: Send + Sync {
    async fn store(&self, job: &ArchivedJob) -> StorageResult<()>;

    async fn load(&self, io_id: &JobId) -> StorageResult<Option<ArchivedJob>>;
}
