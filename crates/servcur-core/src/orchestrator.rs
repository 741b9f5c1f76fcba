//! Orchestrator: runs project actions as cancellable jobs.
//!
//! `dispatch` validates the action, claims the `(project, command)` slot in
//! the registry, opens the job's log streams and spawns a driver task. The
//! driver runs the job's [`Step`] to a terminal state, then runs the chained
//! follow-up (build-then-run) in the same task, if one was dispatched.
//!
//! State machine: `Pending → Running → {Succeeded, Failed, Cancelled}`.
//! Launch failures go straight from `Pending` to `Failed` once retries of
//! transient errors are exhausted. Once output has started, nothing is
//! re-run.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use servcur_state::{
    ArchivedJob, ExitInfo, HistoryPage, JobArchive, JobCommand, JobId, JobRecord, JobRegistry,
    JobState, Project, ProjectKey,
};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::controls::{retry_transient, RetryPolicy};
use crate::domain::{Channel, CoreError, CoreResult, ResourceKind, Verb};
use crate::kind::{strategy, Step, StepPlan};
use crate::launcher::{OutputPipe, StepLauncher};
use crate::logmux::LogMux;
use crate::metrics::METRICS;
use crate::obs::{self, JobSpan};
use crate::projects::ProjectService;
use crate::proxy::ResourceProxy;

const PUMP_BUFFER: usize = 8 * 1024;
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a successful build dispatches a `Start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStart {
    /// Follow the project kind's `run_after_build` flag.
    #[default]
    Kind,
    Always,
    Never,
}

impl FromStr for AutoStart {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kind" => Ok(AutoStart::Kind),
            "always" => Ok(AutoStart::Always),
            "never" => Ok(AutoStart::Never),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown auto-start policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry of transient runtime failures before a step starts.
    pub retry: RetryPolicy,
    /// Graceful-exit window after a stop request, before the step is killed.
    pub stop_timeout: Duration,
    pub auto_start: AutoStart,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stop_timeout: Duration::from_secs(10),
            auto_start: AutoStart::Kind,
        }
    }
}

/// Reply to a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatched {
    pub project: ProjectKey,
    pub io_id: JobId,
}

/// Collaborators of the orchestrator.
pub struct OrchestratorParts {
    pub projects: Arc<ProjectService>,
    pub registry: Arc<dyn JobRegistry>,
    pub archive: Arc<dyn JobArchive>,
    pub proxy: Arc<ResourceProxy>,
    pub launcher: Arc<dyn StepLauncher>,
    pub mux: Arc<LogMux>,
}

struct JobHandle {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// A registered job that has not run yet.
struct PreparedJob {
    record: JobRecord,
    project: Project,
    step: Step,
    cancel: watch::Receiver<bool>,
    done: watch::Sender<bool>,
    started: Instant,
}

struct Outcome {
    state: JobState,
    exit: ExitInfo,
    produced: Option<u64>,
}

impl Outcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            exit: ExitInfo::message(message),
            produced: None,
        }
    }

    fn succeeded(exit: ExitInfo) -> Self {
        Self {
            state: JobState::Succeeded,
            exit,
            produced: None,
        }
    }
}

enum Waited {
    Exited(CoreResult<i32>),
    Cancelled,
}

struct Inner {
    parts: OrchestratorParts,
    config: OrchestratorConfig,
    handles: Mutex<HashMap<JobId, JobHandle>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Resolves once `rx` reads `true`. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Copy one output pipe into the job's stream, one append per read.
fn spawn_pump(mux: Arc<LogMux>, io_id: JobId, channel: Channel, mut pipe: OutputPipe) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_BUFFER];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = mux.append(&io_id, channel, Bytes::copy_from_slice(&buf[..n])) {
                        tracing::debug!(%io_id, %channel, error = %e, "output dropped");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(%io_id, %channel, error = %e, "output pipe failed");
                    break;
                }
            }
        }
    })
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts,
                config,
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<JobId, JobHandle>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn mux(&self) -> &Arc<LogMux> {
        &self.inner.parts.mux
    }

    pub fn projects(&self) -> &Arc<ProjectService> {
        &self.inner.parts.projects
    }

    /// Start `command` on a project. Returns as soon as the job is
    /// registered; the job runs in the background.
    pub async fn dispatch(&self, key: &ProjectKey, command: JobCommand) -> CoreResult<Dispatched> {
        let project = self.inner.parts.projects.get(key).await?;
        let job = self.prepare(project, command).await?;
        let io_id = job.record.io_id.clone();
        tokio::spawn(self.clone().drive(job));
        Ok(Dispatched {
            project: key.clone(),
            io_id,
        })
    }

    /// Validate, claim the slot, open streams.
    async fn prepare(&self, project: Project, command: JobCommand) -> CoreResult<PreparedJob> {
        let step = strategy(&project.kind).step(&project, command)?;
        let record = self
            .inner
            .parts
            .registry
            .create(&project.key(), command)
            .await?;
        self.inner.parts.mux.open(&record.io_id);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.handles().insert(
            record.io_id.clone(),
            JobHandle {
                cancel: cancel_tx,
                done: done_rx,
            },
        );

        METRICS.inc_jobs_dispatched();
        obs::emit_job_dispatched(&record.io_id, &record.project, command);
        Ok(PreparedJob {
            record,
            project,
            step,
            cancel: cancel_rx,
            done: done_tx,
            started: Instant::now(),
        })
    }

    async fn drive(self, first: PreparedJob) {
        let mut next = Some(first);
        while let Some(job) = next {
            let span = JobSpan::new(&job.record.io_id, &job.record.project, job.record.command);
            next = span.in_span(self.run_job(job)).await;
        }
    }

    /// Run one job to a terminal state. Returns the chained follow-up job.
    async fn run_job(&self, job: PreparedJob) -> Option<PreparedJob> {
        let outcome = match &job.step {
            Step::Launch(plan) => self.run_launch(&job, plan).await,
            Step::StopContainer { container } => self.run_stop(&job, container).await,
        };
        self.finalize(job, outcome).await
    }

    fn note(&self, io_id: &JobId, channel: Channel, text: &str) {
        if let Err(e) = self
            .inner
            .parts
            .mux
            .append(io_id, channel, Bytes::copy_from_slice(text.as_bytes()))
        {
            tracing::debug!(%io_id, error = %e, "note dropped");
        }
    }

    async fn enter_running(&self, io_id: &JobId) -> CoreResult<()> {
        self.inner
            .parts
            .registry
            .transition(io_id, JobState::Running)
            .await?;
        obs::emit_job_transition(io_id, JobState::Pending, JobState::Running);
        Ok(())
    }

    async fn run_launch(&self, job: &PreparedJob, plan: &StepPlan) -> Outcome {
        let io_id = &job.record.io_id;
        if *job.cancel.borrow() {
            return Outcome {
                state: JobState::Cancelled,
                exit: ExitInfo::message("cancelled before start"),
                produced: None,
            };
        }

        let parts = &self.inner.parts;
        let launched = retry_transient(&self.inner.config.retry, "launch", || async {
            parts.proxy.ping().await?;
            parts.launcher.launch(plan).await
        })
        .await;
        let launched = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.note(io_id, Channel::Stderr, &format!("{e}\n"));
                return Outcome::failed(e.to_string());
            }
        };

        let mut child = launched.child;
        if let Err(e) = self.enter_running(io_id).await {
            if let Err(kill_err) = child.kill().await {
                tracing::warn!(%io_id, error = %kill_err, "kill failed");
            }
            return Outcome::failed(e.to_string());
        }

        let pumps = [
            spawn_pump(parts.mux.clone(), io_id.clone(), Channel::Stdout, launched.stdout),
            spawn_pump(parts.mux.clone(), io_id.clone(), Channel::Stderr, launched.stderr),
        ];

        let mut cancel = job.cancel.clone();
        let waited = tokio::select! {
            result = child.wait() => Waited::Exited(result),
            _ = cancelled(&mut cancel) => Waited::Cancelled,
        };

        let outcome = match waited {
            Waited::Exited(Ok(0)) => Outcome {
                state: JobState::Succeeded,
                exit: ExitInfo::code(0),
                produced: plan.produces_version,
            },
            Waited::Exited(Ok(code)) => Outcome {
                state: JobState::Failed,
                exit: ExitInfo::code(code),
                produced: None,
            },
            Waited::Exited(Err(e)) => Outcome::failed(e.to_string()),
            Waited::Cancelled => {
                tracing::info!(%io_id, container = ?plan.container, "stop requested");
                if let Some(container) = &plan.container {
                    if let Err(e) = parts
                        .proxy
                        .action(ResourceKind::Containers, container, Verb::Stop)
                        .await
                    {
                        tracing::warn!(%io_id, %container, error = %e, "container stop failed");
                    }
                }
                let code = match tokio::time::timeout(self.inner.config.stop_timeout, child.wait()).await {
                    Ok(Ok(code)) => code,
                    _ => {
                        tracing::warn!(%io_id, "step did not exit in time, killing");
                        if let Err(e) = child.kill().await {
                            tracing::warn!(%io_id, error = %e, "kill failed");
                        }
                        -1
                    }
                };
                Outcome {
                    state: JobState::Cancelled,
                    exit: ExitInfo {
                        code: Some(code),
                        message: Some("stopped".to_string()),
                        follow_up: None,
                    },
                    produced: None,
                }
            }
        };

        for pump in pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                tracing::warn!(%io_id, "output still open after exit, dropping it");
                abort.abort();
            }
        }
        outcome
    }

    async fn run_stop(&self, job: &PreparedJob, container: &str) -> Outcome {
        let io_id = &job.record.io_id;
        if let Err(e) = self.enter_running(io_id).await {
            return Outcome::failed(e.to_string());
        }
        let parts = &self.inner.parts;

        let active = match parts
            .registry
            .active_for(&job.record.project, JobCommand::Start)
            .await
        {
            Ok(active) => active,
            Err(e) => return Outcome::failed(e.to_string()),
        };

        if let Some(start) = active {
            self.note(io_id, Channel::Stdout, &format!("stopping start job {}\n", start.io_id));
            let Some(mut done) = self.request_cancel(&start.io_id) else {
                return Outcome::succeeded(ExitInfo::message("start job already finished"));
            };
            let bound = self.inner.config.stop_timeout * 2 + parts.proxy.call_timeout();
            let finished = tokio::time::timeout(bound, async {
                while !*done.borrow_and_update() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            return match finished {
                Ok(()) => Outcome::succeeded(ExitInfo::message(format!(
                    "stopped start job {}",
                    start.io_id
                ))),
                Err(_) => {
                    let msg = format!("start job {} did not stop in time", start.io_id);
                    self.note(io_id, Channel::Stderr, &format!("{msg}\n"));
                    Outcome::failed(msg)
                }
            };
        }

        self.note(io_id, Channel::Stdout, &format!("stopping container {container}\n"));
        let stopped = retry_transient(&self.inner.config.retry, "stop container", || {
            parts.proxy.action(ResourceKind::Containers, container, Verb::Stop)
        })
        .await;
        match stopped {
            Ok(()) => Outcome::succeeded(ExitInfo::message(format!("stopped {container}"))),
            Err(e) => {
                self.note(io_id, Channel::Stderr, &format!("{e}\n"));
                Outcome::failed(e.to_string())
            }
        }
    }

    /// Signal a job to stop. Returns its completion watch if it is still
    /// tracked.
    fn request_cancel(&self, io_id: &JobId) -> Option<watch::Receiver<bool>> {
        let handles = self.handles();
        let handle = handles.get(io_id)?;
        handle.cancel.send_replace(true);
        Some(handle.done.clone())
    }

    fn chains_start(&self, project: &Project) -> bool {
        match self.inner.config.auto_start {
            AutoStart::Kind => project.kind.builds_then_runs(),
            AutoStart::Always => true,
            AutoStart::Never => false,
        }
    }

    async fn follow_up(&self, key: &ProjectKey) -> CoreResult<PreparedJob> {
        let project = self.inner.parts.projects.get(key).await?;
        self.prepare(project, JobCommand::Start).await
    }

    async fn finalize(&self, job: PreparedJob, mut outcome: Outcome) -> Option<PreparedJob> {
        let parts = &self.inner.parts;
        let io_id = job.record.io_id.clone();
        let key = job.record.project.clone();

        if let Some(version) = outcome.produced {
            if let Err(e) = parts.projects.record_build(&key, version).await {
                tracing::warn!(%io_id, project = %key, error = %e, "built version not recorded");
            }
        }

        let mut next = None;
        if outcome.state == JobState::Succeeded
            && job.record.command == JobCommand::Build
            && self.chains_start(&job.project)
        {
            match self.follow_up(&key).await {
                Ok(start) => {
                    outcome.exit.follow_up = Some(start.record.io_id.clone());
                    next = Some(start);
                }
                Err(e) => {
                    tracing::warn!(%io_id, project = %key, error = %e, "follow-up start not dispatched");
                    outcome.exit.message = Some(format!("follow-up start not dispatched: {e}"));
                }
            }
        }

        let record = match parts
            .registry
            .finish(&io_id, outcome.state, outcome.exit.clone())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(%io_id, error = %e, "job could not be finished");
                let mut record = job.record.clone();
                record.state = outcome.state;
                record.exit_info = Some(outcome.exit.clone());
                record
            }
        };
        parts.mux.close(&io_id);

        let duration_ms = job.started.elapsed().as_millis() as u64;
        obs::emit_job_finished(&io_id, record.state, duration_ms, outcome.exit.code);
        METRICS.record_finished(record.state);

        let snapshot = |channel| {
            parts
                .mux
                .stream(&io_id, channel)
                .map(|s| s.snapshot_text())
                .unwrap_or_default()
        };
        let archived = ArchivedJob {
            stdout: snapshot(Channel::Stdout),
            stderr: snapshot(Channel::Stderr),
            record,
        };
        if let Err(e) = parts.archive.store(&archived).await {
            tracing::warn!(%io_id, error = %e, "job output not archived");
        }

        job.done.send_replace(true);
        self.handles().remove(&io_id);
        next
    }

    // -- queries --------------------------------------------------------

    pub async fn job(&self, io_id: &JobId) -> CoreResult<JobRecord> {
        self.inner
            .parts
            .registry
            .get(io_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {io_id} does not exist")))
    }

    pub async fn active(&self) -> CoreResult<Vec<JobRecord>> {
        Ok(self.inner.parts.registry.list_active().await?)
    }

    pub async fn history(&self, page: HistoryPage) -> CoreResult<Vec<JobRecord>> {
        Ok(self.inner.parts.registry.list_history(page).await?)
    }

    pub async fn archived(&self, io_id: &JobId) -> CoreResult<ArchivedJob> {
        self.inner
            .parts
            .archive
            .load(io_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {io_id} has no archived output")))
    }

    /// Wait until a job is terminal and return its record.
    pub async fn wait(&self, io_id: &JobId) -> CoreResult<JobRecord> {
        let done = self.handles().get(io_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.job(io_id).await
    }
}
