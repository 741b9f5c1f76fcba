//! End-to-end job flows through the orchestrator, driven by fakes.

use std::sync::Arc;
use std::time::Duration;

use servcur_core::fakes::{LocalFetcher, MemoryRuntime, ScriptedLauncher, StepScript};
use servcur_core::{
    AutoStart, Channel, DockerFile, ErrorKind, GitAuth, HistoryPage, JobCommand, JobId,
    JobState, LogMux, LogRetention, NewProject, Orchestrator, OrchestratorConfig,
    OrchestratorParts, ProjectKey, ProjectKind, ProjectService, ResourceKind, ResourceProxy,
    RetryPolicy,
};
use servcur_state::{MemoryJobArchive, MemoryJobRegistry, MemoryProjectStore};

struct Harness {
    orch: Orchestrator,
    runtime: Arc<MemoryRuntime>,
    launcher: Arc<ScriptedLauncher>,
    _dir: tempfile::TempDir,
}

fn config(auto_start: AutoStart) -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 1,
            max_backoff_ms: 5,
        },
        stop_timeout: Duration::from_millis(100),
        auto_start,
    }
}

fn harness(config: OrchestratorConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MemoryRuntime::new());
    let launcher = Arc::new(ScriptedLauncher::new());
    let registry = Arc::new(MemoryJobRegistry::new());
    let projects = Arc::new(ProjectService::new(
        Arc::new(MemoryProjectStore::new()),
        registry.clone(),
        Arc::new(LocalFetcher::new()),
        dir.path(),
    ));
    let mux = Arc::new(LogMux::new(LogRetention {
        grace: Duration::from_millis(10),
        ..LogRetention::default()
    }));
    let orch = Orchestrator::new(
        OrchestratorParts {
            projects,
            registry,
            archive: Arc::new(MemoryJobArchive::new()),
            proxy: Arc::new(ResourceProxy::new(runtime.clone(), Duration::from_secs(5))),
            launcher: launcher.clone(),
            mux,
        },
        config,
    );
    Harness {
        orch,
        runtime,
        launcher,
        _dir: dir,
    }
}

async fn declare(h: &Harness, image_version: u64, run_after_build: bool) -> ProjectKey {
    let (project, _) = h
        .orch
        .projects()
        .create(NewProject {
            name: "web".into(),
            branch: "main".into(),
            https_url: None,
            auth: GitAuth::None,
            kind: ProjectKind::DockerFile(DockerFile {
                image_version,
                run_after_build,
            }),
        })
        .await
        .unwrap();
    project.key()
}

async fn wait_for_state(orch: &Orchestrator, io_id: &JobId, state: JobState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if orch.job(io_id).await.unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {io_id} never reached {state:?}"));
}

fn image_version(kind: &ProjectKind) -> u64 {
    match kind {
        ProjectKind::DockerFile(d) => d.image_version,
    }
}

#[tokio::test]
async fn build_streams_output_and_advances_version() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 0, false).await;
    h.launcher
        .push(StepScript::exiting(0).stdout("Compiling...\n").stdout("Done\n"));

    let dispatched = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    assert_eq!(dispatched.project, key);
    let record = h.orch.wait(&dispatched.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.exit_info.as_ref().and_then(|e| e.code), Some(0));
    assert!(record.ended_at.is_some());

    let read = h
        .orch
        .mux()
        .read(&dispatched.io_id, Channel::Stdout, 0)
        .unwrap();
    let offsets: Vec<u64> = read.chunks.iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![0, 13]);
    assert_eq!(read.next_offset, 18);
    assert!(!read.live);

    let launches = h.launcher.launches();
    assert_eq!(launches[0].args, vec!["build", ".", "-t", "web-main:1"]);

    let project = h.orch.projects().get(&key).await.unwrap();
    assert_eq!(image_version(&project.kind), 1);

    let archived = h.orch.archived(&dispatched.io_id).await.unwrap();
    assert_eq!(archived.stdout, "Compiling...\nDone\n");
    assert_eq!(archived.record.state, JobState::Succeeded);
}

#[tokio::test]
async fn failed_build_keeps_version_and_stderr() {
    let h = harness(config(AutoStart::Always));
    let key = declare(&h, 3, false).await;
    h.launcher
        .push(StepScript::exiting(2).stderr("step 2/5: no such file\n"));

    let dispatched = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    let record = h.orch.wait(&dispatched.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    let exit = record.exit_info.unwrap();
    assert_eq!(exit.code, Some(2));
    assert!(exit.follow_up.is_none());

    let err = h
        .orch
        .mux()
        .read(&dispatched.io_id, Channel::Stderr, 0)
        .unwrap();
    assert_eq!(err.next_offset, 23);
    let project = h.orch.projects().get(&key).await.unwrap();
    assert_eq!(image_version(&project.kind), 3);
}

#[tokio::test]
async fn concurrent_start_is_a_conflict() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 1, false).await;
    h.launcher.set_default(StepScript::blocking().stdout("listening\n"));

    let (a, b) = tokio::join!(
        h.orch.dispatch(&key, JobCommand::Start),
        h.orch.dispatch(&key, JobCommand::Start)
    );
    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected exactly one dispatch to succeed: {other:?}"),
    };
    assert_eq!(err.kind(), ErrorKind::Conflict);
    wait_for_state(&h.orch, &ok.io_id, JobState::Running).await;
    assert_eq!(h.orch.active().await.unwrap().len(), 1);

    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    assert_eq!(
        h.orch.wait(&stop.io_id).await.unwrap().state,
        JobState::Succeeded
    );
    let start = h.orch.wait(&ok.io_id).await.unwrap();
    assert_eq!(start.state, JobState::Cancelled);

    // the slot is free again
    let again = h.orch.dispatch(&key, JobCommand::Start).await.unwrap();
    wait_for_state(&h.orch, &again.io_id, JobState::Running).await;
    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    h.orch.wait(&stop.io_id).await.unwrap();
}

#[tokio::test]
async fn stop_without_start_job_stops_container() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 4, false).await;
    h.runtime.add_container("web-main-4", true);

    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    let record = h.orch.wait(&stop.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(
        h.runtime.container_state("web-main-4").as_deref(),
        Some("exited")
    );
    assert!(h.launcher.launches().is_empty());
}

#[tokio::test]
async fn start_step_that_ignores_stop_is_killed() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 1, false).await;
    h.runtime.add_container("web-main-1", true);
    // The container stops but the attached `docker run` never exits.
    h.launcher.set_default(StepScript::blocking().stdout("listening\n"));

    let start = h.orch.dispatch(&key, JobCommand::Start).await.unwrap();
    wait_for_state(&h.orch, &start.io_id, JobState::Running).await;

    let begun = std::time::Instant::now();
    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    let record = h.orch.wait(&start.io_id).await.unwrap();
    assert!(begun.elapsed() >= Duration::from_millis(100));

    assert_eq!(record.state, JobState::Cancelled);
    let exit = record.exit_info.unwrap();
    assert_eq!(exit.code, Some(-1));
    assert_eq!(exit.message.as_deref(), Some("stopped"));
    assert_eq!(
        h.runtime.container_state("web-main-1").as_deref(),
        Some("exited")
    );
    assert_eq!(
        h.orch.wait(&stop.io_id).await.unwrap().state,
        JobState::Succeeded
    );
    assert!(h.orch.active().await.unwrap().is_empty());
}

#[tokio::test]
async fn stop_of_missing_container_fails() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 1, false).await;

    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    let record = h.orch.wait(&stop.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
}

#[tokio::test]
async fn transient_launch_failures_are_retried() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 0, false).await;
    h.launcher.fail_next_launches(2);

    let dispatched = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    let record = h.orch.wait(&dispatched.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(h.launcher.launches().len(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_from_pending() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 0, false).await;
    h.runtime.set_available(false);

    let dispatched = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    let record = h.orch.wait(&dispatched.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record
        .exit_info
        .and_then(|e| e.message)
        .unwrap_or_default()
        .contains("runtime is down"));
    assert!(h.launcher.launches().is_empty());

    let stderr = h
        .orch
        .mux()
        .read(&dispatched.io_id, Channel::Stderr, 0)
        .unwrap();
    assert_eq!(stderr.chunks.len(), 1);
}

#[tokio::test]
async fn build_then_run_chains_a_start() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 0, true).await;
    h.launcher.push(StepScript::exiting(0).stdout("built\n"));
    h.launcher.set_default(StepScript::blocking());

    let build = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    let record = h.orch.wait(&build.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    let start_id = record
        .exit_info
        .and_then(|e| e.follow_up)
        .expect("follow-up start");

    wait_for_state(&h.orch, &start_id, JobState::Running).await;
    let start = h.orch.job(&start_id).await.unwrap();
    assert_eq!(start.command, JobCommand::Start);
    let launches = h.launcher.launches();
    assert_eq!(launches[1].args.last().map(String::as_str), Some("web-main:1"));
    assert_eq!(launches[1].container.as_deref(), Some("web-main-1"));

    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    h.orch.wait(&stop.io_id).await.unwrap();
    assert_eq!(
        h.orch.job(&start_id).await.unwrap().state,
        JobState::Cancelled
    );
}

#[tokio::test]
async fn never_policy_overrides_kind() {
    let h = harness(config(AutoStart::Never));
    let key = declare(&h, 0, true).await;

    let build = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    let record = h.orch.wait(&build.io_id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert!(record.exit_info.and_then(|e| e.follow_up).is_none());
    assert!(h.orch.active().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_dispatches_register_nothing() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 0, false).await;

    let err = h.orch.dispatch(&key, JobCommand::Start).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let err = h
        .orch
        .dispatch(&ProjectKey::new("api", "main"), JobCommand::Build)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.orch.history(HistoryPage::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_lists_newest_first() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 0, false).await;

    let first = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    h.orch.wait(&first.io_id).await.unwrap();
    let second = h.orch.dispatch(&key, JobCommand::Build).await.unwrap();
    h.orch.wait(&second.io_id).await.unwrap();

    let history = h.orch.history(HistoryPage::default()).await.unwrap();
    let ids: Vec<&JobId> = history.iter().map(|r| &r.io_id).collect();
    assert_eq!(ids, vec![&second.io_id, &first.io_id]);
    let project = h.orch.projects().get(&key).await.unwrap();
    assert_eq!(image_version(&project.kind), 2);
}

#[tokio::test]
async fn removing_a_project_waits_for_its_jobs() {
    let h = harness(config(AutoStart::Kind));
    let key = declare(&h, 1, false).await;
    h.launcher.set_default(StepScript::blocking());

    let start = h.orch.dispatch(&key, JobCommand::Start).await.unwrap();
    let err = h.orch.projects().remove(&key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let stop = h.orch.dispatch(&key, JobCommand::Stop).await.unwrap();
    h.orch.wait(&stop.io_id).await.unwrap();
    h.orch.wait(&start.io_id).await.unwrap();
    h.orch.projects().remove(&key).await.unwrap();
}

#[tokio::test]
async fn prune_volumes_reclaims_unreferenced() {
    let h = harness(config(AutoStart::Kind));
    h.runtime.add_volume("cache", 100, false);
    h.runtime.add_volume("tmp", 20, false);
    h.runtime.add_volume("pgdata", 500, true);
    let proxy = ResourceProxy::new(h.runtime.clone(), Duration::from_secs(5));

    let report = proxy.prune(ResourceKind::Volumes).await.unwrap();
    assert_eq!(report.reclaimed_count, 2);
    assert_eq!(report.reclaimed_bytes, Some(120));
    let names: Vec<String> = proxy
        .list(ResourceKind::Volumes)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["pgdata"]);
}
