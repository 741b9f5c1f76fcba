//! In-memory backends.
//!
//! `MemoryJobRegistry` is the registry the daemon runs with; the project
//! store and archive here are used in tests and for ephemeral setups.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::schema::*;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryJobRegistry
// ---------------------------------------------------------------------------

type SlotKey = (ProjectKey, JobCommand);

/// Holder of the active job for one `(project, command)` key.
type Slot = Arc<Mutex<Option<JobId>>>;

#[derive(Debug)]
struct JobEntry {
    record: JobRecord,
    seq: u64,
}

/// Job registry with one lock per `(project, command)` key.
///
/// `create` holds only its key's slot lock while checking and claiming, so
/// unrelated projects never wait on each other. Lock order is always
/// slot → jobs; terminal transitions release the jobs lock before touching
/// the slot.
#[derive(Debug, Default)]
pub struct MemoryJobRegistry {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    seq: AtomicU64,
}

impl MemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &SlotKey) -> Slot {
        let mut slots = lock(&self.slots);
        slots.entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &SlotKey) -> Option<Slot> {
        lock(&self.slots).get(key).cloned()
    }

    fn fresh_id(jobs: &HashMap<JobId, JobEntry>) -> JobId {
        loop {
            let id = JobId::new();
            if !jobs.contains_key(&id) {
                return id;
            }
        }
    }

    fn is_live(&self, io_id: &JobId) -> bool {
        read(&self.jobs)
            .get(io_id)
            .map(|e| !e.record.state.is_terminal())
            .unwrap_or(false)
    }

    fn apply(
        &self,
        io_id: &JobId,
        next: JobState,
        exit: Option<ExitInfo>,
    ) -> StorageResult<JobRecord> {
        let record = {
            let mut jobs = write(&self.jobs);
            let entry = jobs.get_mut(io_id).ok_or_else(|| StorageError::JobNotFound {
                io_id: io_id.to_string(),
            })?;
            let from = entry.record.state;
            if !from.can_transition_to(next) || (exit.is_some() && !next.is_terminal()) {
                return Err(StorageError::InvalidTransition {
                    io_id: io_id.to_string(),
                    from,
                    to: next,
                });
            }
            entry.record.state = next;
            if next.is_terminal() {
                entry.record.ended_at = Some(Utc::now());
                entry.record.exit_info = exit;
            }
            entry.record.clone()
        };

        if record.state.is_terminal() {
            self.release(&record);
        }
        Ok(record)
    }

    fn release(&self, record: &JobRecord) {
        let key = (record.project.clone(), record.command);
        if let Some(slot) = self.existing_slot(&key) {
            let mut active = lock(&slot);
            if active.as_ref() == Some(&record.io_id) {
                *active = None;
            }
        }
    }

    fn sorted(&self, filter: impl Fn(&JobRecord) -> bool) -> Vec<JobRecord> {
        let jobs = read(&self.jobs);
        let mut entries: Vec<&JobEntry> = jobs.values().filter(|e| filter(&e.record)).collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries.into_iter().map(|e| e.record.clone()).collect()
    }
}

#[async_trait]
impl JobRegistry for MemoryJobRegistry {
    async fn create(&self, project: &ProjectKey, command: JobCommand) -> StorageResult<JobRecord> {
        let slot = self.slot(&(project.clone(), command));
        let mut active = lock(&slot);

        if let Some(current) = active.as_ref() {
            if self.is_live(current) {
                return Err(StorageError::AlreadyActive {
                    project: project.to_string(),
                    command,
                    active: current.to_string(),
                });
            }
        }

        let record = {
            let mut jobs = write(&self.jobs);
            let io_id = Self::fresh_id(&jobs);
            let record = JobRecord {
                io_id: io_id.clone(),
                project: project.clone(),
                command,
                state: JobState::Pending,
                started_at: Utc::now(),
                ended_at: None,
                exit_info: None,
            };
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            jobs.insert(
                io_id,
                JobEntry {
                    record: record.clone(),
                    seq,
                },
            );
            record
        };

        *active = Some(record.io_id.clone());
        Ok(record)
    }

    async fn get(&self, io_id: &JobId) -> StorageResult<Option<JobRecord>> {
        Ok(read(&self.jobs).get(io_id).map(|e| e.record.clone()))
    }

    async fn list_active(&self) -> StorageResult<Vec<JobRecord>> {
        Ok(self.sorted(|r| !r.state.is_terminal()))
    }

    async fn list_history(&self, page: HistoryPage) -> StorageResult<Vec<JobRecord>> {
        Ok(self
            .sorted(|_| true)
            .into_iter()
            .skip(page.page.saturating_mul(page.per_page))
            .take(page.per_page)
            .collect())
    }

    async fn transition(&self, io_id: &JobId, next: JobState) -> StorageResult<JobRecord> {
        self.apply(io_id, next, None)
    }

    async fn finish(
        &self,
        io_id: &JobId,
        terminal: JobState,
        exit: ExitInfo,
    ) -> StorageResult<JobRecord> {
        self.apply(io_id, terminal, Some(exit))
    }

    async fn active_for(
        &self,
        project: &ProjectKey,
        command: JobCommand,
    ) -> StorageResult<Option<JobRecord>> {
        let Some(slot) = self.existing_slot(&(project.clone(), command)) else {
            return Ok(None);
        };
        let active = lock(&slot).clone();
        let Some(io_id) = active else {
            return Ok(None);
        };
        Ok(read(&self.jobs)
            .get(&io_id)
            .map(|e| e.record.clone())
            .filter(|r| !r.state.is_terminal()))
    }
}

// ---------------------------------------------------------------------------
// MemoryProjectStore
// ---------------------------------------------------------------------------

/// Project store backed by a `BTreeMap<ProjectKey, Project>`.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: Mutex<BTreeMap<ProjectKey, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn insert_if_absent(&self, project: Project) -> StorageResult<(Project, bool)> {
        let mut projects = lock(&self.projects);
        let key = project.key();
        if let Some(existing) = projects.get(&key) {
            return Ok((existing.clone(), false));
        }
        projects.insert(key, project.clone());
        Ok((project, true))
    }

    async fn get(&self, key: &ProjectKey) -> StorageResult<Option<Project>> {
        Ok(lock(&self.projects).get(key).cloned())
    }

    async fn list(&self) -> StorageResult<Vec<Project>> {
        Ok(lock(&self.projects).values().cloned().collect())
    }

    async fn update(&self, project: Project) -> StorageResult<()> {
        let mut projects = lock(&self.projects);
        let key = project.key();
        match projects.get_mut(&key) {
            Some(slot) => {
                *slot = project;
                Ok(())
            }
            None => Err(StorageError::ProjectNotFound {
                project: key.to_string(),
            }),
        }
    }

    async fn remove(&self, key: &ProjectKey) -> StorageResult<Option<Project>> {
        Ok(lock(&self.projects).remove(key))
    }
}

// ---------------------------------------------------------------------------
// MemoryJobArchive
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryJobArchive {
    jobs: Mutex<HashMap<JobId, ArchivedJob>>,
}

impl MemoryJobArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobArchive for MemoryJobArchive {
    async fn store(&self, job: &ArchivedJob) -> StorageResult<()> {
        lock(&self.jobs).insert(job.record.io_id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, io_id: &JobId) -> StorageResult<Option<ArchivedJob>> {
        Ok(lock(&self.jobs).get(io_id).cloned())
    }
}
