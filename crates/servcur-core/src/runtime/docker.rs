//! Docker Engine backend over `bollard`.
//!
//! Responses are read through their Engine API JSON shape (`Id`, `Names`,
//! `Labels`, ...), which is the stable contract across client versions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{ListImagesOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::network::{InspectNetworkOptions, ListNetworksOptions, PruneNetworksOptions};
use bollard::system::EventsOptions;
use bollard::volume::{ListVolumesOptions, PruneVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use super::ContainerRuntime;
use crate::domain::{
    Channel, CoreError, CoreResult, LogLine, PruneReport, Resource, ResourceKind, RuntimeEvent,
    SystemInfo, Verb,
};

/// Classify a Docker client error by the HTTP status the daemon returned.
pub fn classify(err: bollard::errors::Error) -> CoreError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            let message = if message.trim().is_empty() {
                format!("docker returned status {status_code}")
            } else {
                message
            };
            match status_code {
                404 => CoreError::NotFound(message),
                304 | 409 => CoreError::Conflict(message),
                400 => CoreError::InvalidRequest(message),
                _ => CoreError::RuntimeUnavailable(message),
            }
        }
        other => CoreError::RuntimeUnavailable(other.to_string()),
    }
}

/// [`ContainerRuntime`] backed by a local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> CoreResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn to_json<T: Serialize>(value: &T) -> CoreResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| CoreError::RuntimeUnavailable(format!("unreadable runtime response: {e}")))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn labels(value: &Value) -> BTreeMap<String, String> {
    value
        .get("Labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Build a [`Resource`] from one entry of a Docker list response.
pub(crate) fn resource_from_json(kind: ResourceKind, value: &Value) -> Resource {
    let id = str_field(value, "Id")
        .or_else(|| str_field(value, "Name"))
        .unwrap_or_default();
    let name = match kind {
        ResourceKind::Containers => value
            .get("Names")
            .and_then(Value::as_array)
            .and_then(|names| names.first())
            .and_then(Value::as_str)
            .map(|n| n.trim_start_matches('/').to_string()),
        ResourceKind::Images => value
            .get("RepoTags")
            .and_then(Value::as_array)
            .and_then(|tags| tags.first())
            .and_then(Value::as_str)
            .map(str::to_string),
        ResourceKind::Volumes | ResourceKind::Networks => str_field(value, "Name"),
    }
    .unwrap_or_else(|| id.clone());
    let state = match kind {
        ResourceKind::Containers => str_field(value, "State"),
        _ => None,
    };
    Resource {
        id,
        name,
        labels: labels(value),
        state,
    }
}

fn deleted_count(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_array)
        .map_or(0, |items| items.len() as u64)
}

fn event_from_json(value: &Value) -> RuntimeEvent {
    let actor = value.get("Actor");
    RuntimeEvent {
        typ: str_field(value, "Type").unwrap_or_default(),
        action: str_field(value, "Action").unwrap_or_default(),
        actor_id: actor.and_then(|a| str_field(a, "ID")).unwrap_or_default(),
        attributes: actor
            .and_then(|a| a.get("Attributes"))
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
        time: value.get("time").and_then(Value::as_i64).unwrap_or_default(),
    }
}

fn log_line(output: LogOutput) -> LogLine {
    match output {
        LogOutput::StdErr { message } => {
            LogLine::from_timestamped(Channel::Stderr, &String::from_utf8_lossy(&message))
        }
        LogOutput::StdOut { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => {
            LogLine::from_timestamped(Channel::Stdout, &String::from_utf8_lossy(&message))
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> CoreResult<()> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }

    async fn system_info(&self) -> CoreResult<SystemInfo> {
        let info = to_json(&self.docker.info().await.map_err(classify)?)?;
        let int = |key: &str| info.get(key).and_then(Value::as_i64).unwrap_or_default();
        Ok(SystemInfo {
            name: str_field(&info, "Name").unwrap_or_default(),
            server_version: str_field(&info, "ServerVersion").unwrap_or_default(),
            operating_system: str_field(&info, "OperatingSystem").unwrap_or_default(),
            containers: int("Containers"),
            containers_running: int("ContainersRunning"),
            images: int("Images"),
            ncpu: int("NCPU"),
            mem_total: int("MemTotal"),
        })
    }

    async fn list(&self, kind: ResourceKind) -> CoreResult<Vec<Resource>> {
        let items: Vec<Value> = match kind {
            ResourceKind::Containers => {
                let list = self
                    .docker
                    .list_containers(Some(ListContainersOptions::<String> {
                        all: true,
                        ..Default::default()
                    }))
                    .await
                    .map_err(classify)?;
                list.iter().map(to_json).collect::<CoreResult<_>>()?
            }
            ResourceKind::Images => {
                let list = self
                    .docker
                    .list_images(Some(ListImagesOptions::<String> {
                        all: false,
                        ..Default::default()
                    }))
                    .await
                    .map_err(classify)?;
                list.iter().map(to_json).collect::<CoreResult<_>>()?
            }
            ResourceKind::Volumes => {
                let resp = self
                    .docker
                    .list_volumes(None::<ListVolumesOptions<String>>)
                    .await
                    .map_err(classify)?;
                let resp = to_json(&resp)?;
                resp.get("Volumes")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            }
            ResourceKind::Networks => {
                let list = self
                    .docker
                    .list_networks(None::<ListNetworksOptions<String>>)
                    .await
                    .map_err(classify)?;
                list.iter().map(to_json).collect::<CoreResult<_>>()?
            }
        };
        Ok(items.iter().map(|v| resource_from_json(kind, v)).collect())
    }

    async fn inspect(&self, kind: ResourceKind, id: &str) -> CoreResult<Value> {
        match kind {
            ResourceKind::Containers => to_json(
                &self
                    .docker
                    .inspect_container(id, None::<InspectContainerOptions>)
                    .await
                    .map_err(classify)?,
            ),
            ResourceKind::Images => {
                to_json(&self.docker.inspect_image(id).await.map_err(classify)?)
            }
            ResourceKind::Volumes => {
                to_json(&self.docker.inspect_volume(id).await.map_err(classify)?)
            }
            ResourceKind::Networks => to_json(
                &self
                    .docker
                    .inspect_network(id, None::<InspectNetworkOptions<String>>)
                    .await
                    .map_err(classify)?,
            ),
        }
    }

    async fn action(&self, kind: ResourceKind, id: &str, verb: Verb) -> CoreResult<()> {
        match (kind, verb) {
            (ResourceKind::Containers, Verb::Start) => self
                .docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
                .map_err(classify),
            (ResourceKind::Containers, Verb::Stop) => self
                .docker
                .stop_container(id, None::<StopContainerOptions>)
                .await
                .map_err(classify),
            (ResourceKind::Containers, Verb::Restart) => self
                .docker
                .restart_container(id, None::<RestartContainerOptions>)
                .await
                .map_err(classify),
            // Without force the daemon answers 409 for running containers.
            (ResourceKind::Containers, Verb::Remove) => self
                .docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: false,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(classify),
            (ResourceKind::Images, Verb::Remove) => self
                .docker
                .remove_image(id, None::<RemoveImageOptions>, None)
                .await
                .map(|_| ())
                .map_err(classify),
            (ResourceKind::Volumes, Verb::Remove) => self
                .docker
                .remove_volume(id, None::<RemoveVolumeOptions>)
                .await
                .map_err(classify),
            (ResourceKind::Networks, Verb::Remove) => {
                self.docker.remove_network(id).await.map_err(classify)
            }
            (kind, verb) => Err(CoreError::InvalidRequest(format!(
                "{verb} is not supported for {kind}"
            ))),
        }
    }

    async fn prune(&self, kind: ResourceKind) -> CoreResult<PruneReport> {
        match kind {
            ResourceKind::Images => {
                let resp = to_json(
                    &self
                        .docker
                        .prune_images(None::<PruneImagesOptions<String>>)
                        .await
                        .map_err(classify)?,
                )?;
                Ok(PruneReport {
                    reclaimed_count: deleted_count(&resp, "ImagesDeleted"),
                    reclaimed_bytes: resp.get("SpaceReclaimed").and_then(Value::as_u64),
                })
            }
            ResourceKind::Volumes => {
                let resp = to_json(
                    &self
                        .docker
                        .prune_volumes(None::<PruneVolumesOptions<String>>)
                        .await
                        .map_err(classify)?,
                )?;
                Ok(PruneReport {
                    reclaimed_count: deleted_count(&resp, "VolumesDeleted"),
                    reclaimed_bytes: resp.get("SpaceReclaimed").and_then(Value::as_u64),
                })
            }
            ResourceKind::Networks => {
                let resp = to_json(
                    &self
                        .docker
                        .prune_networks(None::<PruneNetworksOptions<String>>)
                        .await
                        .map_err(classify)?,
                )?;
                Ok(PruneReport {
                    reclaimed_count: deleted_count(&resp, "NetworksDeleted"),
                    reclaimed_bytes: None,
                })
            }
            ResourceKind::Containers => Err(CoreError::InvalidRequest(
                "prune is not supported for containers".to_string(),
            )),
        }
    }

    fn events(&self) -> BoxStream<'static, CoreResult<RuntimeEvent>> {
        self.docker
            .events(Some(EventsOptions::<String>::default()))
            .map(|item| {
                let message = item.map_err(classify)?;
                Ok(event_from_json(&to_json(&message)?))
            })
            .boxed()
    }

    fn container_logs(&self, id: &str, since: i64) -> BoxStream<'static, CoreResult<LogLine>> {
        self.docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    timestamps: true,
                    since,
                    ..Default::default()
                }),
            )
            .map(|item| item.map(log_line).map_err(classify))
            .boxed()
    }
}
