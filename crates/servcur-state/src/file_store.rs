//! Project store persisted as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::archive::write_atomic;
use crate::error::StorageError;
use crate::schema::{Project, ProjectKey};
use crate::storage_traits::{ProjectStore, StorageResult};

/// Project store persisted as a single JSON array.
///
/// Layout: `<root>/store/projects.json`. Every mutation rewrites the whole
/// file through a temp file in the same directory, so readers never see a
/// partial write. Mutations hold the async lock across the write, so files
/// land in the order the changes were made.
pub struct JsonProjectStore {
    file: PathBuf,
    projects: Mutex<BTreeMap<ProjectKey, Project>>,
}

impl JsonProjectStore {
    /// Open (or create) the store under `root`, loading any existing file.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join("store");
        fs::create_dir_all(&dir)?;
        let file = dir.join("projects.json");

        let projects = match fs::read(&file) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<Project> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|p| (p.key(), p)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %file.display(), count = projects.len(), "project store loaded");

        Ok(Self {
            file,
            projects: Mutex::new(projects),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    async fn persist(&self, projects: &BTreeMap<ProjectKey, Project>) -> StorageResult<()> {
        let list: Vec<&Project> = projects.values().collect();
        let body = serde_json::to_vec_pretty(&list)?;

        let dir = self
            .file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        write_atomic(dir, self.file.clone(), body).await
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn insert_if_absent(&self, project: Project) -> StorageResult<(Project, bool)> {
        let mut projects = self.projects.lock().await;
        let key = project.key();
        if let Some(existing) = projects.get(&key) {
            return Ok((existing.clone(), false));
        }
        projects.insert(key.clone(), project.clone());
        if let Err(e) = self.persist(&projects).await {
            projects.remove(&key);
            return Err(e);
        }
        Ok((project, true))
    }

    async fn get(&self, key: &ProjectKey) -> StorageResult<Option<Project>> {
        Ok(self.projects.lock().await.get(key).cloned())
    }

    async fn list(&self) -> StorageResult<Vec<Project>> {
        Ok(self.projects.lock().await.values().cloned().collect())
    }

    async fn update(&self, project: Project) -> StorageResult<()> {
        let mut projects = self.projects.lock().await;
        let key = project.key();
        let Some(slot) = projects.get_mut(&key) else {
            return Err(StorageError::ProjectNotFound {
                project: key.to_string(),
            });
        };
        let previous = std::mem::replace(slot, project);
        if let Err(e) = self.persist(&projects).await {
            projects.insert(key, previous);
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &ProjectKey) -> StorageResult<Option<Project>> {
        let mut projects = self.projects.lock().await;
        let Some(removed) = projects.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&projects).await {
            projects.insert(key.clone(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DockerFile, ProjectKind};

    fn project(name: &str, branch: &str) -> Project {
        Project {
            name: name.to_string(),
            branch: branch.to_string(),
            path: PathBuf::from("/srv").join(name).join(branch),
            uri: format!("/projects/webhook/{name}/{branch}"),
            kind: ProjectKind::DockerFile(DockerFile {
                image_version: 0,
                run_after_build: false,
            }),
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonProjectStore::open(dir.path()).unwrap();
            store.insert_if_absent(project("web", "main")).await.unwrap();
            store.insert_if_absent(project("api", "dev")).await.unwrap();
        }

        let store = JsonProjectStore::open(dir.path()).unwrap();
        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[tokio::test]
    async fn update_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProjectStore::open(dir.path()).unwrap();
        let mut p = project("web", "main");
        store.insert_if_absent(p.clone()).await.unwrap();
        p.kind.advance_version(2);
        store.update(p.clone()).await.unwrap();

        let reopened = JsonProjectStore::open(dir.path()).unwrap();
        let got = reopened.get(&p.key()).await.unwrap().unwrap();
        assert_eq!(got.kind, p.kind);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_inserts_all_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonProjectStore::open(dir.path()).unwrap());
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_if_absent(project(&format!("svc{i}"), "main"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().1);
        }

        let reopened = JsonProjectStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn remove_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProjectStore::open(dir.path()).unwrap();
        let removed = store.remove(&ProjectKey::new("ghost", "main")).await.unwrap();
        assert!(removed.is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("store")).unwrap();
        fs::write(dir.path().join("store/projects.json"), b"{not json").unwrap();
        match JsonProjectStore::open(dir.path()) {
            Err(StorageError::Serialization(_)) => {}
            other => panic!("expected Serialization, got {:?}", other.map(|_| ())),
        }
    }
}
