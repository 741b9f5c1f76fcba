//! Container-runtime resources as seen through the proxy.
//!
//! The runtime owns these; the core only ever holds transient query results.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Containers,
    Images,
    Volumes,
    Networks,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Containers,
        ResourceKind::Images,
        ResourceKind::Volumes,
        ResourceKind::Networks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Containers => "containers",
            ResourceKind::Images => "images",
            ResourceKind::Volumes => "volumes",
            ResourceKind::Networks => "networks",
        }
    }

    /// Containers take lifecycle verbs; everything else can only be removed.
    pub fn supports(&self, verb: Verb) -> bool {
        match self {
            ResourceKind::Containers => true,
            _ => verb == Verb::Remove,
        }
    }

    /// Bulk prune is offered for images, volumes and networks.
    pub fn supports_prune(&self) -> bool {
        !matches!(self, ResourceKind::Containers)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::InvalidRequest(format!("unknown resource kind: {s}")))
    }
}

/// Per-resource action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Start,
    Stop,
    Restart,
    Remove,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Restart => "restart",
            Verb::Remove => "remove",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Verb::Start),
            "stop" => Ok(Verb::Stop),
            "restart" => Ok(Verb::Restart),
            "remove" => Ok(Verb::Remove),
            other => Err(CoreError::InvalidRequest(format!("unknown verb: {other}"))),
        }
    }
}

/// A container, image, volume or network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Runtime-reported state (`running`, `exited`, ...); absent for kinds
    /// without a lifecycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Outcome of a prune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub reclaimed_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaimed_bytes: Option<u64>,
}

/// Resource-change notification pushed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Resource type reported by the runtime (`container`, `image`, ...).
    #[serde(rename = "type")]
    pub typ: String,
    pub action: String,
    pub actor_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Unix seconds.
    pub time: i64,
}

/// Summary of the runtime host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub name: String,
    pub server_version: String,
    pub operating_system: String,
    pub containers: i64,
    pub containers_running: i64,
    pub images: i64,
    pub ncpu: i64,
    pub mem_total: i64,
}
