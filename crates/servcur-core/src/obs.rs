//! Structured observability hooks for the job lifecycle.
//!
//! - Job-scoped spans via [`JobSpan`]
//! - Emitters for dispatch, state transitions, completion, runtime retries
//!   and stream closure
//!
//! Events are emitted at `info!` (retries at `warn!`), filtered through
//! `SERVCUR_LOG`.

use std::future::Future;
use std::time::Duration;

use servcur_state::{JobCommand, JobId, JobState, ProjectKey};
use tracing::instrument::Instrumented;
use tracing::{info, Instrument};

/// Span tagging everything a job does with its `io_id`.
///
/// Spans cannot stay entered across awaits on a multi-threaded runtime, so
/// the job future is instrumented instead:
///
/// ```ignore
/// let span = JobSpan::new(&io_id, &project, JobCommand::Build);
/// tokio::spawn(span.in_span(run_job(...)));
/// ```
#[derive(Debug, Clone)]
pub struct JobSpan {
    span: tracing::Span,
}

impl JobSpan {
    pub fn new(io_id: &JobId, project: &ProjectKey, command: JobCommand) -> Self {
        let span = tracing::info_span!(
            "servcur.job",
            io_id = %io_id,
            project = %project,
            command = %command,
        );
        Self { span }
    }

    pub fn in_span<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

pub fn emit_job_dispatched(io_id: &JobId, project: &ProjectKey, command: JobCommand) {
    info!(event = "job.dispatched", io_id = %io_id, project = %project, command = %command);
}

pub fn emit_job_transition(io_id: &JobId, from: JobState, to: JobState) {
    info!(event = "job.transition", io_id = %io_id, from = ?from, to = ?to);
}

/// Emit event: job reached a terminal state.
pub fn emit_job_finished(
    io_id: &JobId,
    state: JobState,
    duration_ms: u64,
    exit_code: Option<i32>,
) {
    info!(
        event = "job.finished",
        io_id = %io_id,
        state = ?state,
        duration_ms = duration_ms,
        exit_code = ?exit_code,
    );
}

/// Emit event: a transient runtime failure is being retried.
pub fn emit_runtime_retry(what: &str, attempt: u32, delay: Duration, error: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "runtime.retry",
        call = what,
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
    );
}

pub fn emit_stream_closed(io_id: &str, channel: &str, next_offset: u64) {
    info!(event = "stream.closed", io_id = %io_id, channel = channel, next_offset = next_offset);
}
