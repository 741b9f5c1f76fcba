//! WebSocket streams: runtime events, container logs, job output.
//!
//! Each stream is first built as a sequence of [`Outbound`] frames, then
//! [`forward`]ed to the socket. Frames are JSON text. A stream that ends
//! closes with 1000 `"end of stream"`; one that fails closes with 1011 and
//! the error kind as reason.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use servcur_core::{Channel, CoreError, CoreResult, JobId, LogStream, TailRead};

use super::projects::{ChunkView, SinceQuery};
use crate::api::AppState;
use crate::error::ApiResult;

pub const END_OF_STREAM: &str = "end of stream";

/// A frame on its way to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

impl Outbound {
    pub fn end() -> Self {
        Outbound::Close {
            code: close_code::NORMAL,
            reason: END_OF_STREAM.to_string(),
        }
    }

    pub fn failed(err: &CoreError) -> Self {
        Outbound::Close {
            code: close_code::ERROR,
            reason: err.kind().as_str().to_string(),
        }
    }

    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(text) => Outbound::Text(text),
            Err(e) => Outbound::failed(&CoreError::InvalidRequest(e.to_string())),
        }
    }

    fn is_close(&self) -> bool {
        matches!(self, Outbound::Close { .. })
    }
}

/// Job output frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputFrame {
    Chunk(ChunkView),
    /// Part of the requested backlog was already evicted.
    Truncated { lowest_offset: u64 },
}

/// One text frame per item; the first error closes the stream.
pub fn json_frames<T>(items: BoxStream<'static, CoreResult<T>>) -> BoxStream<'static, Outbound>
where
    T: Serialize + Send + 'static,
{
    stream::unfold(Some(items), |items| async move {
        let mut items = items?;
        match items.next().await {
            Some(Ok(item)) => {
                let frame = Outbound::json(&item);
                let rest = if frame.is_close() { None } else { Some(items) };
                Some((frame, rest))
            }
            Some(Err(err)) => Some((Outbound::failed(&err), None)),
            None => Some((Outbound::end(), None)),
        }
    })
    .boxed()
}

struct TailState {
    stream: Arc<LogStream>,
    since: u64,
    pending: VecDeque<Outbound>,
    finished: bool,
}

/// Backlog from `since`, then live output until the stream ends.
pub fn job_output_frames(stream: Arc<LogStream>, since: u64) -> BoxStream<'static, Outbound> {
    let state = TailState {
        stream,
        since,
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((frame, state));
            }
            if state.finished {
                return None;
            }
            match state.stream.tail(state.since).await {
                TailRead::Data(read) => {
                    if read.truncated {
                        state.pending.push_back(Outbound::json(&OutputFrame::Truncated {
                            lowest_offset: read.lowest_offset,
                        }));
                    }
                    for chunk in &read.chunks {
                        state
                            .pending
                            .push_back(Outbound::json(&OutputFrame::Chunk(ChunkView::from(chunk))));
                    }
                    state.since = read.next_offset;
                }
                TailRead::End { .. } => {
                    state.pending.push_back(Outbound::end());
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

/// Pump frames into the socket until the frames end, a close is sent, or
/// the client goes away.
pub async fn forward(mut socket: WebSocket, mut frames: BoxStream<'static, Outbound>, what: &'static str) {
    let mut sent: u64 = 0;
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Outbound::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    sent += 1;
                }
                Some(Outbound::Close { code, reason }) => {
                    let close = CloseFrame { code, reason: reason.into() };
                    let _ = socket.send(Message::Close(Some(close))).await;
                    break;
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(stream = what, frames = sent, "websocket closed");
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    /// Unix seconds.
    #[serde(default)]
    pub since: Option<i64>,
}

/// `GET /events`.
pub async fn events(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let frames = json_frames(state.proxy.events());
    ws.on_upgrade(move |socket| forward(socket, frames, "events"))
}

/// `GET /containers/{id}/logs?since=`.
pub async fn container_logs(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<LogsQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let Path(id) = path?;
    let Query(query) = query?;
    let lines = state.proxy.container_logs(&id, query.since.unwrap_or(0))?;
    let frames = json_frames(lines);
    Ok(ws.on_upgrade(move |socket| forward(socket, frames, "container_logs")))
}

/// `GET /projects/builds/{io_id}/{channel}/stream?since=`.
pub async fn stream_output(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    query: Result<Query<SinceQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let Path((io_id, channel)) = path?;
    let Query(query) = query?;
    let channel: Channel = channel.parse()?;
    let io_id = JobId::from(io_id);
    let stream = state
        .orchestrator
        .mux()
        .stream(&io_id, channel)
        .ok_or_else(|| CoreError::NotFound(format!("no {channel} output for job {io_id}")))?;
    let frames = job_output_frames(stream, query.since.unwrap_or(0));
    Ok(ws.on_upgrade(move |socket| forward(socket, frames, "job_output")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_frames_are_tagged() {
        let frame = OutputFrame::Truncated { lowest_offset: 8 };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json, serde_json::json!({"type": "truncated", "lowest_offset": 8}));
    }

    #[test]
    fn failure_reason_is_the_error_kind() {
        let frame = Outbound::failed(&CoreError::RuntimeUnavailable("socket gone".into()));
        assert_eq!(
            frame,
            Outbound::Close {
                code: 1011,
                reason: "runtime_unavailable".into()
            }
        );
    }
}
