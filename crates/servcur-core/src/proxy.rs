//! Resource proxy: the only path from the core to the container runtime.
//!
//! Every request/response call is bounded by a timeout; an elapsed timeout
//! is reported as `RuntimeUnavailable`. Verbs are checked against the kind
//! before the runtime is touched. Nothing is cached.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;

use crate::domain::{
    CoreError, CoreResult, LogLine, PruneReport, Resource, ResourceKind, RuntimeEvent,
    SystemInfo, Verb,
};
use crate::runtime::ContainerRuntime;

pub struct ResourceProxy {
    runtime: Arc<dyn ContainerRuntime>,
    call_timeout: Duration,
}

impl ResourceProxy {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, call_timeout: Duration) -> Self {
        Self {
            runtime,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = CoreResult<T>>) -> CoreResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(call = what, timeout_ms = self.call_timeout.as_millis() as u64, "runtime call timed out");
                Err(CoreError::RuntimeUnavailable(format!(
                    "{what} timed out after {}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }

    fn check_id(id: &str) -> CoreResult<()> {
        if id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("resource id must not be empty".into()));
        }
        Ok(())
    }

    pub async fn ping(&self) -> CoreResult<()> {
        self.bounded("ping", self.runtime.ping()).await
    }

    pub async fn system_info(&self) -> CoreResult<SystemInfo> {
        self.bounded("system info", self.runtime.system_info()).await
    }

    pub async fn list(&self, kind: ResourceKind) -> CoreResult<Vec<Resource>> {
        self.bounded("list", self.runtime.list(kind)).await
    }

    pub async fn inspect(&self, kind: ResourceKind, id: &str) -> CoreResult<serde_json::Value> {
        Self::check_id(id)?;
        self.bounded("inspect", self.runtime.inspect(kind, id)).await
    }

    pub async fn action(&self, kind: ResourceKind, id: &str, verb: Verb) -> CoreResult<()> {
        Self::check_id(id)?;
        if !kind.supports(verb) {
            return Err(CoreError::InvalidRequest(format!(
                "{verb} is not supported for {kind}"
            )));
        }
        tracing::debug!(%kind, id, %verb, "resource action");
        self.bounded("action", self.runtime.action(kind, id, verb)).await
    }

    pub async fn prune(&self, kind: ResourceKind) -> CoreResult<PruneReport> {
        if !kind.supports_prune() {
            return Err(CoreError::InvalidRequest(format!(
                "prune is not supported for {kind}"
            )));
        }
        let report = self.bounded("prune", self.runtime.prune(kind)).await?;
        tracing::info!(%kind, reclaimed = report.reclaimed_count, bytes = ?report.reclaimed_bytes, "pruned");
        Ok(report)
    }

    /// System events. Long-lived; ends when the runtime closes it.
    pub fn events(&self) -> BoxStream<'static, CoreResult<RuntimeEvent>> {
        self.runtime.events()
    }

    /// Container output since `since` (unix seconds), then live.
    pub fn container_logs(
        &self,
        id: &str,
        since: i64,
    ) -> CoreResult<BoxStream<'static, CoreResult<LogLine>>> {
        Self::check_id(id)?;
        Ok(self.runtime.container_logs(id, since))
    }
}
