//! Declared projects: registration, source refresh, removal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use servcur_state::{JobCommand, JobRegistry, Project, ProjectKey, ProjectStore};

use crate::domain::{validate_key, CoreError, CoreResult, NewProject};
use crate::source::SourceFetcher;

/// Checkout directory of a project: `<data_dir>/projects/<name>/<branch>`.
///
/// Fails unless the result lies strictly below `<data_dir>/projects`.
pub fn project_dir(data_dir: &Path, key: &ProjectKey) -> CoreResult<PathBuf> {
    validate_key(&key.name, &key.branch)?;
    let root = data_dir.join("projects");
    let dir = root.join(&key.name).join(&key.branch);
    if dir == root || !dir.starts_with(&root) {
        return Err(CoreError::InvalidRequest(format!(
            "project {key} resolves outside the projects directory"
        )));
    }
    Ok(dir)
}

/// Webhook path that refreshes a project's sources.
pub fn webhook_uri(key: &ProjectKey) -> String {
    format!("/projects/webhook/{}/{}", key.name, key.branch)
}

/// What a webhook delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Pulled,
    Ignored,
}

/// A push payload carries `before`, `after` and `compare`.
fn is_push(payload: &serde_json::Value) -> bool {
    ["before", "after", "compare"]
        .iter()
        .all(|k| payload.get(k).is_some())
}

pub struct ProjectService {
    store: Arc<dyn ProjectStore>,
    registry: Arc<dyn JobRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    data_dir: PathBuf,
    // One lock per key, held across the clone so a duplicate never clones
    // twice while other projects proceed.
    creating: Mutex<HashMap<ProjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectService {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        registry: Arc<dyn JobRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            fetcher,
            data_dir: data_dir.into(),
            creating: Mutex::new(HashMap::new()),
        }
    }

    fn create_slot(&self, key: &ProjectKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        creating.entry(key.clone()).or_default().clone()
    }

    fn release_slot(&self, key: &ProjectKey, slot: &Arc<tokio::sync::Mutex<()>>) {
        let mut creating = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and `slot` are the only holders: nobody is waiting.
        if Arc::strong_count(slot) <= 2 {
            creating.remove(key);
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Declare a project. Idempotent on `(name, branch)`: an existing project
    /// is returned unchanged with `false` and nothing is fetched.
    pub async fn create(&self, request: NewProject) -> CoreResult<(Project, bool)> {
        request.validate()?;
        let key = request.key();

        let slot = self.create_slot(&key);
        let result = {
            let _guard = slot.lock().await;
            self.create_locked(request, key.clone()).await
        };
        self.release_slot(&key, &slot);
        result
    }

    async fn create_locked(&self, request: NewProject, key: ProjectKey) -> CoreResult<(Project, bool)> {
        if let Some(existing) = self.store.get(&key).await? {
            tracing::debug!(project = %key, "project already declared");
            return Ok((existing, false));
        }

        let path = project_dir(&self.data_dir, &key)?;
        match &request.https_url {
            Some(url) => {
                let clone_url = request.auth.apply(url)?;
                self.fetcher
                    .clone_repo(&clone_url, &key.branch, &path)
                    .await
                    .map_err(|e| e.map_message(|m| request.auth.redact(&m)))?;
            }
            None => {
                tokio::fs::create_dir_all(&path).await.map_err(|e| {
                    CoreError::RuntimeUnavailable(format!(
                        "cannot create {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }

        let project = Project {
            name: key.name.clone(),
            branch: key.branch.clone(),
            path,
            uri: webhook_uri(&key),
            kind: request.kind,
        };
        let (project, created) = self.store.insert_if_absent(project).await?;
        tracing::info!(project = %key, kind = project.kind.name(), path = %project.path.display(), "project declared");
        Ok((project, created))
    }

    pub async fn get(&self, key: &ProjectKey) -> CoreResult<Project> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("project {key} does not exist")))
    }

    pub async fn list(&self) -> CoreResult<Vec<Project>> {
        Ok(self.store.list().await?)
    }

    /// Remove a project and its checkout. Refused while any of its jobs is
    /// active.
    pub async fn remove(&self, key: &ProjectKey) -> CoreResult<Project> {
        validate_key(&key.name, &key.branch)?;
        let project = self.get(key).await?;
        for command in [JobCommand::Build, JobCommand::Start, JobCommand::Stop] {
            if let Some(active) = self.registry.active_for(key, command).await? {
                return Err(CoreError::Conflict(format!(
                    "project {key} has an active {command} job ({})",
                    active.io_id
                )));
            }
        }

        self.store.remove(key).await?;
        // Never delete anything outside the projects directory, even for a
        // record written before keys were checked.
        let expected = project_dir(&self.data_dir, key)?;
        if project.path != expected {
            tracing::warn!(project = %key, path = %project.path.display(), "checkout outside projects directory left in place");
            return Ok(project);
        }
        if let Err(e) = tokio::fs::remove_dir_all(&project.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(project = %key, error = %e, "checkout could not be removed");
            }
        }
        tracing::info!(project = %key, "project removed");
        Ok(project)
    }

    /// Refresh a project's sources.
    pub async fn pull(&self, key: &ProjectKey) -> CoreResult<Project> {
        let project = self.get(key).await?;
        self.fetcher.pull(&project.path).await?;
        tracing::info!(project = %key, "sources pulled");
        Ok(project)
    }

    /// Handle a webhook delivery: pushes refresh the sources, anything else
    /// is acknowledged and ignored.
    pub async fn handle_webhook(
        &self,
        key: &ProjectKey,
        payload: &serde_json::Value,
    ) -> CoreResult<WebhookOutcome> {
        if !is_push(payload) {
            self.get(key).await?;
            tracing::debug!(project = %key, "webhook ignored");
            return Ok(WebhookOutcome::Ignored);
        }
        self.pull(key).await?;
        Ok(WebhookOutcome::Pulled)
    }

    /// Record a successfully built image version.
    pub async fn record_build(&self, key: &ProjectKey, version: u64) -> CoreResult<Project> {
        let mut project = self.get(key).await?;
        project.kind.advance_version(version);
        self.store.update(project.clone()).await?;
        tracing::debug!(project = %key, version, "image version advanced");
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorKind, GitAuth};
    use crate::fakes::LocalFetcher;
    use servcur_state::{DockerFile, MemoryJobRegistry, MemoryProjectStore, ProjectKind};

    struct Fixture {
        service: ProjectService,
        fetcher: Arc<LocalFetcher>,
        registry: Arc<MemoryJobRegistry>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(LocalFetcher::new());
        let registry = Arc::new(MemoryJobRegistry::new());
        let service = ProjectService::new(
            Arc::new(MemoryProjectStore::new()),
            registry.clone(),
            fetcher.clone(),
            dir.path(),
        );
        Fixture {
            service,
            fetcher,
            registry,
            _dir: dir,
        }
    }

    fn request(url: Option<&str>) -> NewProject {
        NewProject {
            name: "web".into(),
            branch: "main".into(),
            https_url: url.map(str::to_string),
            auth: GitAuth::None,
            kind: ProjectKind::default(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_and_clones_once() {
        let f = fixture();
        let (first, created) = f
            .service
            .create(request(Some("https://git.example.com/web.git")))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.uri, "/projects/webhook/web/main");
        assert!(first.path.ends_with("projects/web/main"));
        assert!(first.path.join("Dockerfile").exists());

        let (second, created) = f
            .service
            .create(request(Some("https://git.example.com/other.git")))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(f.fetcher.clones().len(), 1);
        assert_eq!(f.service.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn token_is_used_for_clone_but_redacted_from_errors() {
        let f = fixture();
        f.fetcher
            .fail_clones_with("could not read from https://s3cret@git.example.com/web.git");
        let mut req = request(Some("https://git.example.com/web.git"));
        req.auth = GitAuth::Token("s3cret".into());

        let err = f.service.create(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(!err.message().contains("s3cret"));
        assert_eq!(f.fetcher.clones()[0].0, "https://s3cret@git.example.com/web.git");
        assert!(f.service.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_refuses_while_job_active() {
        let f = fixture();
        let (project, _) = f.service.create(request(None)).await.unwrap();
        let key = project.key();
        let job = f.registry.create(&key, JobCommand::Build).await.unwrap();

        let err = f.service.remove(&key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        f.registry
            .finish(&job.io_id, servcur_state::JobState::Failed, Default::default())
            .await
            .unwrap();
        f.service.remove(&key).await.unwrap();
        assert!(!project.path.exists());
        assert_eq!(
            f.service.get(&key).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn webhook_pulls_only_on_push() {
        let f = fixture();
        let (project, _) = f.service.create(request(None)).await.unwrap();
        let key = project.key();

        let ping = serde_json::json!({"zen": "keep it simple"});
        assert_eq!(
            f.service.handle_webhook(&key, &ping).await.unwrap(),
            WebhookOutcome::Ignored
        );
        let push = serde_json::json!({"before": "a1", "after": "b2", "compare": "https://x"});
        assert_eq!(
            f.service.handle_webhook(&key, &push).await.unwrap(),
            WebhookOutcome::Pulled
        );
        assert_eq!(f.fetcher.pulls(), vec![project.path.clone()]);

        let unknown = ProjectKey::new("nope", "main");
        assert_eq!(
            f.service.handle_webhook(&unknown, &push).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn record_build_only_moves_forward() {
        let f = fixture();
        let (project, _) = f.service.create(request(None)).await.unwrap();
        let key = project.key();
        f.service.record_build(&key, 2).await.unwrap();
        let p = f.service.record_build(&key, 1).await.unwrap();
        assert_eq!(
            p.kind,
            ProjectKind::DockerFile(DockerFile {
                image_version: 2,
                run_after_build: false,
            })
        );
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let f = fixture();
        let mut req = request(None);
        req.name = "../etc".into();
        assert_eq!(
            f.service.create(req).await.unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );
    }

    #[tokio::test]
    async fn branches_cannot_escape_the_projects_directory() {
        let f = fixture();
        let outside = tempfile::tempdir().unwrap();
        let marker = outside.path().join("keep");
        std::fs::write(&marker, "x").unwrap();

        for branch in [outside.path().to_str().unwrap(), ".", "a/./b", "feature/"] {
            let mut req = request(None);
            req.branch = branch.to_string();
            assert_eq!(
                f.service.create(req).await.unwrap_err().kind(),
                ErrorKind::InvalidRequest,
                "{branch}"
            );
        }

        let key = ProjectKey::new("web", outside.path().to_str().unwrap());
        assert_eq!(
            f.service.remove(&key).await.unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );
        assert!(marker.exists());
        assert!(f.service.list().await.unwrap().is_empty());
    }

    #[test]
    fn project_dir_stays_under_projects() {
        let base = Path::new("/srv/servcur");
        let dir = project_dir(base, &ProjectKey::new("web", "feature/login")).unwrap();
        assert_eq!(dir, Path::new("/srv/servcur/projects/web/feature/login"));
        assert!(project_dir(base, &ProjectKey::new("web", "/etc")).is_err());
        assert!(project_dir(base, &ProjectKey::new("web", ".")).is_err());
    }

    #[tokio::test]
    async fn slow_clone_does_not_block_other_projects() {
        let f = fixture();
        let slow_url = "https://git.example.com/slow.git";
        let gate = f.fetcher.hold_clones_of(slow_url);
        let service = Arc::new(f.service);

        let slow = {
            let service = service.clone();
            tokio::spawn(async move {
                let mut req = request(Some(slow_url));
                req.name = "slow".into();
                service.create(req).await
            })
        };
        while f.fetcher.clones().is_empty() {
            tokio::task::yield_now().await;
        }

        let (fast, created) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            service.create(request(Some("https://git.example.com/web.git"))),
        )
        .await
        .expect("create waited on an unrelated clone")
        .unwrap();
        assert!(created);
        assert_eq!(fast.name, "web");

        gate.notify_one();
        let (slow, created) = slow.await.unwrap().unwrap();
        assert!(created);
        assert_eq!(slow.name, "slow");
        assert_eq!(service.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicates_clone_once() {
        let f = fixture();
        let url = "https://git.example.com/web.git";
        let gate = f.fetcher.hold_clones_of(url);
        let service = Arc::new(f.service);

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.create(request(Some(url))).await })
        };
        while f.fetcher.clones().is_empty() {
            tokio::task::yield_now().await;
        }
        let second = {
            let service = service.clone();
            tokio::spawn(async move { service.create(request(Some(url))).await })
        };
        tokio::task::yield_now().await;
        gate.notify_one();

        let (_, first_created) = first.await.unwrap().unwrap();
        let (_, second_created) = second.await.unwrap().unwrap();
        assert!(first_created);
        assert!(!second_created);
        assert_eq!(f.fetcher.clones().len(), 1);
    }
}
