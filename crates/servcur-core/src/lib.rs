//! servcur Core Library
//!
//! Orchestration and log streaming behind the servcur gateway: the resource
//! proxy in front of the container runtime, the log multiplexer, and the
//! orchestrator that runs project actions as jobs.

pub mod controls;
pub mod domain;
pub mod fakes;
pub mod kind;
pub mod launcher;
pub mod logmux;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod projects;
pub mod proxy;
pub mod runtime;
pub mod source;
pub mod telemetry;

pub use controls::{retry_transient, RetryPolicy};

pub use domain::{
    validate_key, Channel, CoreError, CoreResult, ErrorKind, GitAuth, LogLine, NewProject,
    PruneReport, Resource, ResourceKind, RuntimeEvent, SystemInfo, Verb,
};

pub use kind::{image_repository, strategy, BuildStrategy, Step, StepPlan};
pub use launcher::{LaunchedStep, OutputPipe, ProcessLauncher, StepChild, StepLauncher};
pub use logmux::{Chunk, LogMux, LogRetention, LogStream, ReadResult, TailRead};
pub use orchestrator::{AutoStart, Dispatched, Orchestrator, OrchestratorConfig, OrchestratorParts};
pub use projects::{project_dir, webhook_uri, ProjectService, WebhookOutcome};
pub use proxy::ResourceProxy;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use source::{GitFetcher, SourceFetcher};
pub use telemetry::init_tracing;

pub use servcur_state::{
    ArchivedJob, DockerFile, ExitInfo, HistoryPage, JobCommand, JobId, JobRecord, JobState,
    Project, ProjectKey, ProjectKind,
};
