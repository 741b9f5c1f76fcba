//! Record types shared by every layer.
//!
//! - `Project` / `ProjectKind`: declared projects and their build strategy
//! - `JobRecord`: one dispatched project action, addressed by its `io_id`
//! - `ArchivedJob`: a finished job together with its retained output

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// `(name, branch)`: the unique key of a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub name: String,
    pub branch: String,
}

impl ProjectKey {
    pub fn new(name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.branch)
    }
}

/// Container-image-file build strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerFile {
    /// Version of the last successfully built image (0 = never built).
    #[serde(default)]
    pub image_version: u64,
    /// Chain a `Start` job after every successful `Build`.
    #[serde(default)]
    pub run_after_build: bool,
}

/// Build strategy of a project, tagged by kind name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProjectKind {
    DockerFile(DockerFile),
}

impl Default for ProjectKind {
    fn default() -> Self {
        ProjectKind::DockerFile(DockerFile::default())
    }
}

impl ProjectKind {
    /// Kind name as used in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            ProjectKind::DockerFile(_) => "DockerFile",
        }
    }

    /// Whether a successful build should be followed by a start.
    pub fn builds_then_runs(&self) -> bool {
        match self {
            ProjectKind::DockerFile(d) => d.run_after_build,
        }
    }

    /// Record a successful build of `version`.
    pub fn advance_version(&mut self, version: u64) {
        match self {
            ProjectKind::DockerFile(d) => d.image_version = d.image_version.max(version),
        }
    }
}

/// A declared project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub branch: String,
    /// Checkout directory.
    pub path: PathBuf,
    /// Webhook URI that refreshes this project's sources.
    pub uri: String,
    pub kind: ProjectKind,
}

impl Project {
    pub fn key(&self) -> ProjectKey {
        ProjectKey::new(&self.name, &self.branch)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Opaque job handle (`io_id`).
///
/// Random (UUIDv4, simple form) so two builds of identical content are still
/// distinct jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Project action a job executes. Also the command class for the
/// one-active-job rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCommand {
    Build,
    Start,
    Stop,
}

impl JobCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCommand::Build => "build",
            JobCommand::Start => "start",
            JobCommand::Stop => "stop",
        }
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// `Pending → Running → {Succeeded, Failed, Cancelled}`. A pending job may
/// also go straight to `Failed` or `Cancelled` when invocation never
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self → next` is a forward move of the state machine.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Running) => true,
            (JobState::Pending | JobState::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Process exit code, when the job ran a process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Human-readable reason (error message, cancellation cause).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Job chained after this one (build-then-run).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<JobId>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// One dispatched project action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub io_id: JobId,
    pub project: ProjectKey,
    pub command: JobCommand,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_info: Option<ExitInfo>,
}

/// History page request (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_per_page() -> usize {
    50
}

impl Default for HistoryPage {
    fn default() -> Self {
        Self {
            page: 0,
            per_page: default_per_page(),
        }
    }
}

/// Finished job plus the output that was still retained when it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub record: JobRecord,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_distinct_and_opaque() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn terminal_states_never_move() {
        for terminal in [JobState::Succeeded, JobState::Failed, JobState::Cancelled] {
            for next in [
                JobState::Pending,
                JobState::Running,
                JobState::Succeeded,
                JobState::Failed,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn pending_may_fail_without_running() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
        assert!(!JobState::Running.can_transition_to(JobState::Running));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
    }

    #[test]
    fn project_kind_is_tagged_by_type() {
        let kind = ProjectKind::DockerFile(DockerFile {
            image_version: 3,
            run_after_build: true,
        });
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "DockerFile");
        assert_eq!(json["image_version"], 3);

        let parsed: ProjectKind = serde_json::from_str(r#"{"type":"DockerFile"}"#).unwrap();
        assert!(!parsed.builds_then_runs());
    }

    #[test]
    fn advance_version_never_goes_back() {
        let mut kind = ProjectKind::DockerFile(DockerFile {
            image_version: 5,
            run_after_build: false,
        });
        kind.advance_version(4);
        kind.advance_version(6);
        let ProjectKind::DockerFile(d) = kind;
        assert_eq!(d.image_version, 6);
    }
}
