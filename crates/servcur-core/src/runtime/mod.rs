//! Container runtime seam.
//!
//! [`ContainerRuntime`] is what the resource proxy drives. The production
//! backend is [`docker::DockerRuntime`]; tests use `fakes::MemoryRuntime`.

pub mod docker;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::{
    CoreResult, LogLine, PruneReport, Resource, ResourceKind, RuntimeEvent, SystemInfo, Verb,
};

pub use docker::DockerRuntime;

/// Operations the core needs from a container runtime.
///
/// Implementations classify every failure into the domain taxonomy; callers
/// never see backend-specific errors.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> CoreResult<()>;

    async fn system_info(&self) -> CoreResult<SystemInfo>;

    /// Current resources of `kind`, never cached.
    async fn list(&self, kind: ResourceKind) -> CoreResult<Vec<Resource>>;

    /// Full runtime description of one resource.
    async fn inspect(&self, kind: ResourceKind, id: &str) -> CoreResult<serde_json::Value>;

    async fn action(&self, kind: ResourceKind, id: &str, verb: Verb) -> CoreResult<()>;

    async fn prune(&self, kind: ResourceKind) -> CoreResult<PruneReport>;

    /// Live resource-change notifications.
    fn events(&self) -> BoxStream<'static, CoreResult<RuntimeEvent>>;

    /// Container output at or after `since` (unix seconds), then live lines
    /// until the container stops.
    fn container_logs(&self, id: &str, since: i64) -> BoxStream<'static, CoreResult<LogLine>>;
}
