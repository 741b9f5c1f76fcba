//! In-process fakes for the runtime, launcher and fetcher seams.
//!
//! Used by the unit and integration tests of this crate and of the daemon;
//! nothing here touches Docker, git or child processes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::domain::{
    CoreError, CoreResult, LogLine, PruneReport, Resource, ResourceKind, RuntimeEvent,
    SystemInfo, Verb,
};
use crate::kind::StepPlan;
use crate::launcher::{LaunchedStep, StepChild, StepLauncher};
use crate::runtime::ContainerRuntime;
use crate::source::SourceFetcher;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryRuntime
// ---------------------------------------------------------------------------

struct FakeResource {
    resource: Resource,
    in_use: bool,
    size: u64,
}

#[derive(Clone)]
enum LogFeed {
    Line(String, LogLine),
    Stopped(String),
}

#[derive(Default)]
struct RuntimeState {
    resources: BTreeMap<ResourceKind, BTreeMap<String, FakeResource>>,
    logs: HashMap<String, Vec<LogLine>>,
}

impl RuntimeState {
    fn find_key(&self, kind: ResourceKind, id: &str) -> Option<String> {
        let items = self.resources.get(&kind)?;
        if items.contains_key(id) {
            return Some(id.to_string());
        }
        items
            .iter()
            .find(|(_, r)| r.resource.name == id)
            .map(|(k, _)| k.clone())
    }
}

/// Container runtime held entirely in memory.
///
/// Mirrors the Docker behaviours the core relies on: removing a running
/// container or an in-use resource is a conflict, stopping a stopped
/// container is a conflict, prune removes only unreferenced resources.
pub struct MemoryRuntime {
    state: Mutex<RuntimeState>,
    events: broadcast::Sender<RuntimeEvent>,
    logs: broadcast::Sender<LogFeed>,
    available: AtomicBool,
    fail_next: AtomicU32,
    delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (logs, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(RuntimeState::default()),
            events,
            logs,
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            delay: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, kind: ResourceKind, name: &str, state: Option<&str>, size: u64, in_use: bool) -> String {
        let id = match kind {
            ResourceKind::Volumes | ResourceKind::Networks => name.to_string(),
            _ => format!("{:012x}", self.next_id.fetch_add(1, Ordering::Relaxed)),
        };
        let resource = Resource {
            id: id.clone(),
            name: name.to_string(),
            labels: BTreeMap::new(),
            state: state.map(str::to_string),
        };
        lock(&self.state).resources.entry(kind).or_default().insert(
            id.clone(),
            FakeResource {
                resource,
                in_use,
                size,
            },
        );
        id
    }

    /// Add a container; returns its id.
    pub fn add_container(&self, name: &str, running: bool) -> String {
        let state = if running { "running" } else { "exited" };
        self.insert(ResourceKind::Containers, name, Some(state), 0, false)
    }

    /// Add an image tagged `tag`; returns its id.
    pub fn add_image(&self, tag: &str, size: u64, in_use: bool) -> String {
        self.insert(ResourceKind::Images, tag, None, size, in_use)
    }

    pub fn add_volume(&self, name: &str, size: u64, in_use: bool) -> String {
        self.insert(ResourceKind::Volumes, name, None, size, in_use)
    }

    pub fn add_network(&self, name: &str, in_use: bool) -> String {
        self.insert(ResourceKind::Networks, name, None, 0, in_use)
    }

    /// Make every call fail with `RuntimeUnavailable` while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` request/response calls with `RuntimeUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every request/response call.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// State of a container by id or name.
    pub fn container_state(&self, id: &str) -> Option<String> {
        let state = lock(&self.state);
        let key = state.find_key(ResourceKind::Containers, id)?;
        state.resources[&ResourceKind::Containers][&key]
            .resource
            .state
            .clone()
    }

    /// Record a line of container output and deliver it to live followers.
    pub fn push_log(&self, container: &str, line: LogLine) {
        let mut state = lock(&self.state);
        let id = state
            .find_key(ResourceKind::Containers, container)
            .unwrap_or_else(|| container.to_string());
        state.logs.entry(id.clone()).or_default().push(line.clone());
        let _ = self.logs.send(LogFeed::Line(id, line));
    }

    /// Publish a system event.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    async fn gate(&self) -> CoreResult<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoreError::RuntimeUnavailable("runtime is down".into()));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoreError::RuntimeUnavailable("connection reset".into()));
        }
        Ok(())
    }

    fn not_found(kind: ResourceKind, id: &str) -> CoreError {
        CoreError::NotFound(format!("no such {kind}: {id}"))
    }

    fn event_for(kind: ResourceKind, id: &str, action: &str) -> RuntimeEvent {
        let typ = kind.as_str().trim_end_matches('s').to_string();
        RuntimeEvent {
            typ,
            action: action.to_string(),
            actor_id: id.to_string(),
            attributes: BTreeMap::new(),
            time: chrono::Utc::now().timestamp(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn ping(&self) -> CoreResult<()> {
        self.gate().await
    }

    async fn system_info(&self) -> CoreResult<SystemInfo> {
        self.gate().await?;
        let state = lock(&self.state);
        let count = |kind| state.resources.get(&kind).map_or(0, |m| m.len() as i64);
        let running = state
            .resources
            .get(&ResourceKind::Containers)
            .map_or(0, |m| {
                m.values()
                    .filter(|r| r.resource.state.as_deref() == Some("running"))
                    .count() as i64
            });
        Ok(SystemInfo {
            name: "memory".to_string(),
            server_version: "0.0.0".to_string(),
            operating_system: "in-memory".to_string(),
            containers: count(ResourceKind::Containers),
            containers_running: running,
            images: count(ResourceKind::Images),
            ncpu: 1,
            mem_total: 0,
        })
    }

    async fn list(&self, kind: ResourceKind) -> CoreResult<Vec<Resource>> {
        self.gate().await?;
        let state = lock(&self.state);
        Ok(state
            .resources
            .get(&kind)
            .map(|m| m.values().map(|r| r.resource.clone()).collect())
            .unwrap_or_default())
    }

    async fn inspect(&self, kind: ResourceKind, id: &str) -> CoreResult<serde_json::Value> {
        self.gate().await?;
        let state = lock(&self.state);
        let key = state
            .find_key(kind, id)
            .ok_or_else(|| Self::not_found(kind, id))?;
        let item = &state.resources[&kind][&key];
        Ok(serde_json::json!({
            "Id": item.resource.id,
            "Name": item.resource.name,
            "State": item.resource.state,
            "Labels": item.resource.labels,
            "InUse": item.in_use,
            "Size": item.size,
        }))
    }

    async fn action(&self, kind: ResourceKind, id: &str, verb: Verb) -> CoreResult<()> {
        self.gate().await?;
        let mut state = lock(&self.state);
        let key = state
            .find_key(kind, id)
            .ok_or_else(|| Self::not_found(kind, id))?;
        let items = state.resources.entry(kind).or_default();
        let running = items[&key].resource.state.as_deref() == Some("running");

        match (kind, verb) {
            (ResourceKind::Containers, Verb::Start) if running => {
                return Err(CoreError::Conflict(format!("container {id} is already running")));
            }
            (ResourceKind::Containers, Verb::Stop) if !running => {
                return Err(CoreError::Conflict(format!("container {id} is not running")));
            }
            (ResourceKind::Containers, Verb::Remove) if running => {
                return Err(CoreError::Conflict(format!(
                    "cannot remove running container {id}"
                )));
            }
            (ResourceKind::Containers, Verb::Start | Verb::Restart) => {
                if let Some(item) = items.get_mut(&key) {
                    item.resource.state = Some("running".to_string());
                }
            }
            (ResourceKind::Containers, Verb::Stop) => {
                if let Some(item) = items.get_mut(&key) {
                    item.resource.state = Some("exited".to_string());
                }
                let _ = self.logs.send(LogFeed::Stopped(key.clone()));
            }
            (_, Verb::Remove) => {
                if items[&key].in_use {
                    return Err(CoreError::Conflict(format!("{kind} {id} is in use")));
                }
                items.remove(&key);
            }
            (_, verb) => {
                return Err(CoreError::InvalidRequest(format!(
                    "{verb} is not supported for {kind}"
                )));
            }
        }
        drop(state);
        self.emit(Self::event_for(kind, &key, verb.as_str()));
        Ok(())
    }

    async fn prune(&self, kind: ResourceKind) -> CoreResult<PruneReport> {
        self.gate().await?;
        let mut state = lock(&self.state);
        let items = state.resources.entry(kind).or_default();
        let unused: Vec<String> = items
            .iter()
            .filter(|(_, r)| !r.in_use)
            .map(|(k, _)| k.clone())
            .collect();
        let mut bytes = 0;
        for key in &unused {
            if let Some(item) = items.remove(key) {
                bytes += item.size;
            }
        }
        Ok(PruneReport {
            reclaimed_count: unused.len() as u64,
            reclaimed_bytes: (kind != ResourceKind::Networks).then_some(bytes),
        })
    }

    fn events(&self) -> BoxStream<'static, CoreResult<RuntimeEvent>> {
        if !self.available.load(Ordering::SeqCst) {
            return stream::once(async {
                Err(CoreError::RuntimeUnavailable("runtime is down".into()))
            })
            .boxed();
        }
        stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    fn container_logs(&self, id: &str, since: i64) -> BoxStream<'static, CoreResult<LogLine>> {
        let state = lock(&self.state);
        let Some(key) = state.find_key(ResourceKind::Containers, id) else {
            let err = Self::not_found(ResourceKind::Containers, id);
            return stream::once(async move { Err(err) }).boxed();
        };
        // Subscribe under the state lock so no pushed line is missed or doubled.
        let rx = self.logs.subscribe();
        let replay: Vec<CoreResult<LogLine>> = state
            .logs
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|l| l.timestamp.map_or(true, |t| t.timestamp() >= since))
            .cloned()
            .map(Ok)
            .collect();
        let running =
            state.resources[&ResourceKind::Containers][&key].resource.state.as_deref() == Some("running");
        drop(state);

        let replay = stream::iter(replay);
        if !running {
            return replay.boxed();
        }
        let live = stream::unfold((rx, key), |(mut rx, key)| async move {
            loop {
                match rx.recv().await {
                    Ok(LogFeed::Line(id, line)) if id == key => return Some((Ok(line), (rx, key))),
                    Ok(LogFeed::Stopped(id)) if id == key => return None,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        replay.chain(live).boxed()
    }
}

// ---------------------------------------------------------------------------
// ScriptedLauncher
// ---------------------------------------------------------------------------

/// What a scripted step writes and how it ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepScript {
    /// Chunks written to stdout; each arrives as its own read.
    pub stdout: Vec<Vec<u8>>,
    pub stderr: Vec<Vec<u8>>,
    pub exit_code: i32,
    /// Keep running after the output until killed.
    pub block_until_killed: bool,
}

impl StepScript {
    pub fn exiting(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// A step that never exits on its own.
    pub fn blocking() -> Self {
        Self {
            block_until_killed: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, chunk: &str) -> Self {
        self.stdout.push(chunk.as_bytes().to_vec());
        self
    }

    pub fn stderr(mut self, chunk: &str) -> Self {
        self.stderr.push(chunk.as_bytes().to_vec());
        self
    }
}

/// Reader yielding one queued chunk per read, EOF once the sender is gone.
struct ChunkReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.pending.len().min(buf.remaining());
        let head = self.pending.split_to(n);
        buf.put_slice(&head);
        Poll::Ready(Ok(()))
    }
}

fn scripted_pipe(chunks: &[Vec<u8>]) -> (ChunkReader, mpsc::UnboundedSender<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    for chunk in chunks {
        let _ = tx.send(Bytes::from(chunk.clone()));
    }
    (
        ChunkReader {
            rx,
            pending: Bytes::new(),
        },
        tx,
    )
}

struct ScriptedChild {
    exit_code: i32,
    block: bool,
    killed: bool,
    // Held while blocking so the pipes stay open.
    pipes: Option<(mpsc::UnboundedSender<Bytes>, mpsc::UnboundedSender<Bytes>)>,
}

#[async_trait]
impl StepChild for ScriptedChild {
    async fn wait(&mut self) -> CoreResult<i32> {
        if self.killed {
            return Ok(-1);
        }
        if self.block {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> CoreResult<()> {
        self.killed = true;
        self.pipes = None;
        Ok(())
    }
}

/// Launcher playing back [`StepScript`]s instead of running processes.
///
/// Scripts queued with [`push`](Self::push) are used in order; after that
/// the default script (a silent exit 0) is used.
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<VecDeque<StepScript>>,
    default: Mutex<StepScript>,
    launches: Mutex<Vec<StepPlan>>,
    fail_launches: AtomicU32,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: StepScript) {
        lock(&self.scripts).push_back(script);
    }

    pub fn set_default(&self, script: StepScript) {
        *lock(&self.default) = script;
    }

    /// Fail the next `n` launches with `RuntimeUnavailable`.
    pub fn fail_next_launches(&self, n: u32) {
        self.fail_launches.store(n, Ordering::SeqCst);
    }

    /// Every plan passed to `launch`, including failed attempts.
    pub fn launches(&self) -> Vec<StepPlan> {
        lock(&self.launches).clone()
    }
}

#[async_trait]
impl StepLauncher for ScriptedLauncher {
    async fn launch(&self, plan: &StepPlan) -> CoreResult<LaunchedStep> {
        lock(&self.launches).push(plan.clone());
        let failed = self
            .fail_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoreError::RuntimeUnavailable(format!(
                "cannot connect to runtime for {}",
                plan.program
            )));
        }

        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| lock(&self.default).clone());
        let (stdout, out_tx) = scripted_pipe(&script.stdout);
        let (stderr, err_tx) = scripted_pipe(&script.stderr);
        let pipes = script.block_until_killed.then_some((out_tx, err_tx));

        Ok(LaunchedStep {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            child: Box::new(ScriptedChild {
                exit_code: script.exit_code,
                block: script.block_until_killed,
                killed: false,
                pipes,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// LocalFetcher
// ---------------------------------------------------------------------------

/// Fetcher that only creates directories and records what was asked.
#[derive(Default)]
pub struct LocalFetcher {
    clones: Mutex<Vec<(String, String, PathBuf)>>,
    pulls: Mutex<Vec<PathBuf>>,
    clone_error: Mutex<Option<String>>,
    held: Mutex<HashMap<String, Arc<Notify>>>,
}

impl LocalFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every clone fail with `InvalidRequest(message)`.
    pub fn fail_clones_with(&self, message: &str) {
        *lock(&self.clone_error) = Some(message.to_string());
    }

    /// Park clones of `url` until the returned handle is notified.
    pub fn hold_clones_of(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.held).insert(url.to_string(), gate.clone());
        gate
    }

    /// `(url, branch, dest)` of every clone.
    pub fn clones(&self) -> Vec<(String, String, PathBuf)> {
        lock(&self.clones).clone()
    }

    pub fn pulls(&self) -> Vec<PathBuf> {
        lock(&self.pulls).clone()
    }
}

#[async_trait]
impl SourceFetcher for LocalFetcher {
    async fn clone_repo(&self, url: &str, branch: &str, dest: &Path) -> CoreResult<()> {
        lock(&self.clones).push((url.to_string(), branch.to_string(), dest.to_path_buf()));
        let gate = lock(&self.held).get(url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(message) = lock(&self.clone_error).clone() {
            return Err(CoreError::InvalidRequest(message));
        }
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| CoreError::RuntimeUnavailable(format!("cannot create checkout: {e}")))?;
        tokio::fs::write(dest.join("Dockerfile"), "FROM scratch\n")
            .await
            .map_err(|e| CoreError::RuntimeUnavailable(format!("cannot write checkout: {e}")))
    }

    async fn pull(&self, dir: &Path) -> CoreResult<()> {
        if !dir.is_dir() {
            return Err(CoreError::NotFound(format!(
                "checkout {} does not exist",
                dir.display()
            )));
        }
        lock(&self.pulls).push(dir.to_path_buf());
        Ok(())
    }
}
