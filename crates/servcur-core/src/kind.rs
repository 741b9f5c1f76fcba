//! Build strategies: what each project kind runs for a command.
//!
//! A new kind adds a `ProjectKind` variant and a `BuildStrategy` impl; the
//! orchestrator only ever sees [`Step`]s.

use std::path::PathBuf;

use servcur_state::{DockerFile, JobCommand, Project, ProjectKind};

use crate::domain::{CoreError, CoreResult};

/// A process to launch for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlan {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Container the process drives, stopped through the resource proxy on
    /// cancellation.
    pub container: Option<String>,
    /// Image version the step produces when it succeeds.
    pub produces_version: Option<u64>,
}

/// What a job does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run a process and stream its output.
    Launch(StepPlan),
    /// Stop the project's running container.
    StopContainer { container: String },
}

pub trait BuildStrategy {
    fn step(&self, project: &Project, command: JobCommand) -> CoreResult<Step>;
}

/// Strategy for a project's kind.
pub fn strategy(kind: &ProjectKind) -> &dyn BuildStrategy {
    match kind {
        ProjectKind::DockerFile(d) => d,
    }
}

/// `<name>-<branch>` reduced to characters valid in an image repository.
pub fn image_repository(project: &Project) -> String {
    format!("{}-{}", project.name, project.branch)
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}

impl BuildStrategy for DockerFile {
    fn step(&self, project: &Project, command: JobCommand) -> CoreResult<Step> {
        let repo = image_repository(project);
        let current = self.image_version;
        match command {
            JobCommand::Build => {
                let next = current + 1;
                Ok(Step::Launch(StepPlan {
                    program: "docker".to_string(),
                    args: vec![
                        "build".to_string(),
                        ".".to_string(),
                        "-t".to_string(),
                        format!("{repo}:{next}"),
                    ],
                    workdir: project.path.clone(),
                    container: None,
                    produces_version: Some(next),
                }))
            }
            JobCommand::Start => {
                if current == 0 {
                    return Err(CoreError::InvalidRequest(format!(
                        "{} has no built image yet",
                        project.key()
                    )));
                }
                let container = format!("{repo}-{current}");
                Ok(Step::Launch(StepPlan {
                    program: "docker".to_string(),
                    args: vec![
                        "run".to_string(),
                        "--rm".to_string(),
                        "--name".to_string(),
                        container.clone(),
                        format!("{repo}:{current}"),
                    ],
                    workdir: project.path.clone(),
                    container: Some(container),
                    produces_version: None,
                }))
            }
            JobCommand::Stop => {
                if current == 0 {
                    return Err(CoreError::InvalidRequest(format!(
                        "{} has no built image yet",
                        project.key()
                    )));
                }
                Ok(Step::StopContainer {
                    container: format!("{repo}-{current}"),
                })
            }
        }
    }
}
