//! Step launcher: starts the process behind a job and hands back its pipes.

use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use crate::domain::{CoreError, CoreResult};
use crate::kind::StepPlan;

pub type OutputPipe = Pin<Box<dyn AsyncRead + Send>>;

/// Handle on a launched step.
#[async_trait]
pub trait StepChild: Send {
    /// Wait for exit and return the exit code (-1 when killed by a signal).
    /// Cancel-safe.
    async fn wait(&mut self) -> CoreResult<i32>;

    /// Force termination and reap.
    async fn kill(&mut self) -> CoreResult<()>;
}

/// A running step: its output pipes and its process handle.
pub struct LaunchedStep {
    pub stdout: OutputPipe,
    pub stderr: OutputPipe,
    pub child: Box<dyn StepChild>,
}

#[async_trait]
pub trait StepLauncher: Send + Sync {
    async fn launch(&self, plan: &StepPlan) -> CoreResult<LaunchedStep>;
}

/// Launches steps as local processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

struct ProcessChild {
    program: String,
    child: Child,
}

#[async_trait]
impl StepChild for ProcessChild {
    async fn wait(&mut self) -> CoreResult<i32> {
        let status = self.child.wait().await.map_err(|e| {
            CoreError::RuntimeUnavailable(format!("waiting for {} failed: {e}", self.program))
        })?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> CoreResult<()> {
        self.child.kill().await.map_err(|e| {
            CoreError::RuntimeUnavailable(format!("killing {} failed: {e}", self.program))
        })
    }
}

#[async_trait]
impl StepLauncher for ProcessLauncher {
    async fn launch(&self, plan: &StepPlan) -> CoreResult<LaunchedStep> {
        if !plan.workdir.is_dir() {
            return Err(CoreError::NotFound(format!(
                "working directory {} does not exist",
                plan.workdir.display()
            )));
        }

        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .current_dir(&plan.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CoreError::RuntimeUnavailable(format!("failed to run {}: {e}", plan.program))
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(CoreError::RuntimeUnavailable(format!(
                "{} started without output pipes",
                plan.program
            )));
        };
        tracing::debug!(program = %plan.program, args = ?plan.args, pid = ?child.id(), "step launched");

        Ok(LaunchedStep {
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            child: Box::new(ProcessChild {
                program: plan.program.clone(),
                child,
            }),
        })
    }
}
