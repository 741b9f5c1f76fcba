//! Log multiplexer: per-job, per-channel append-only byte logs.
//!
//! Each `(io_id, channel)` stream is a shared log addressed by byte offset.
//! A chunk appended at offset N keeps N until it is evicted; chunk `n+1`
//! starts at `offset(n) + len(n)`. Readers never hold a cursor on the
//! server: resuming is `read(since)` / `tail(since)` with the last offset
//! they saw.
//!
//! Concurrency: one writer (the job's output pump) and any number of
//! readers per stream. A chunk becomes visible to readers only once it is
//! fully in the backlog; locks are never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servcur_state::JobId;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::domain::{Channel, CoreError, CoreResult};
use crate::metrics::METRICS;
use crate::obs;

/// Retention budget applied to every stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRetention {
    /// Retained bytes per stream before the oldest chunks are evicted.
    pub max_bytes: usize,
    /// Age after which chunks are evicted.
    pub max_age: Duration,
    /// How long tailing readers wait after close before end-of-stream.
    pub grace: Duration,
    /// How long a closed stream is kept before `purge` drops it.
    pub purge_after: Duration,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_age: Duration::from_secs(3600),
            grace: Duration::from_secs(2),
            purge_after: Duration::from_secs(900),
        }
    }
}

/// A retained piece of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Result of a backlog read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Chunks at or after the requested offset, oldest first.
    pub chunks: Vec<Chunk>,
    /// Offset the next appended byte will get; resume from here.
    pub next_offset: u64,
    /// Lowest offset still retained.
    pub lowest_offset: u64,
    /// The requested offset had already been evicted.
    pub truncated: bool,
    /// The stream still accepts appends, so tailing may yield more.
    pub live: bool,
}

/// Result of a tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailRead {
    Data(ReadResult),
    /// Stream closed and the grace period elapsed with nothing new.
    End { next_offset: u64 },
}

struct Entry {
    chunk: Chunk,
    at: Instant,
}

#[derive(Default)]
struct StreamState {
    entries: VecDeque<Entry>,
    next_offset: u64,
    retained: usize,
    closed_at: Option<Instant>,
}

impl StreamState {
    fn lowest_offset(&self) -> u64 {
        self.entries
            .front()
            .map_or(self.next_offset, |e| e.chunk.offset)
    }
}

/// One `(io_id, channel)` log.
pub struct LogStream {
    io_id: JobId,
    channel: Channel,
    retention: LogRetention,
    state: RwLock<StreamState>,
    version: watch::Sender<u64>,
}

impl LogStream {
    pub fn new(io_id: JobId, channel: Channel, retention: LogRetention) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            io_id,
            channel,
            retention,
            state: RwLock::new(StreamState::default()),
            version,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StreamState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StreamState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn io_id(&self) -> &JobId {
        &self.io_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Append `data`, returning the offset it was assigned.
    ///
    /// Empty appends are no-ops and return the current end offset.
    pub fn append(&self, data: Bytes) -> CoreResult<u64> {
        let (offset, evicted) = {
            let mut state = self.write_state();
            if state.closed_at.is_some() {
                return Err(CoreError::Conflict(format!(
                    "{} stream of job {} is closed",
                    self.channel, self.io_id
                )));
            }
            let offset = state.next_offset;
            if data.is_empty() {
                return Ok(offset);
            }
            let len = data.len();
            state.next_offset += len as u64;
            state.retained += len;
            state.entries.push_back(Entry {
                chunk: Chunk {
                    offset,
                    data,
                    timestamp: Utc::now(),
                },
                at: Instant::now(),
            });
            METRICS.add_log_bytes(len as u64);
            (offset, self.evict(&mut state))
        };
        if evicted > 0 {
            METRICS.add_chunks_evicted(evicted);
            tracing::trace!(io_id = %self.io_id, channel = %self.channel, evicted, "log chunks evicted");
        }
        self.bump();
        Ok(offset)
    }

    /// Drop the oldest chunks over budget. The newest chunk always stays.
    fn evict(&self, state: &mut StreamState) -> u64 {
        let now = Instant::now();
        let mut evicted = 0;
        while state.entries.len() > 1 {
            let Some(front) = state.entries.front() else {
                break;
            };
            let over_bytes = state.retained > self.retention.max_bytes;
            let too_old = now.saturating_duration_since(front.at) > self.retention.max_age;
            if !over_bytes && !too_old {
                break;
            }
            if let Some(old) = state.entries.pop_front() {
                state.retained -= old.chunk.data.len();
                evicted += 1;
            }
        }
        evicted
    }

    /// Retained chunks at or after `since`.
    ///
    /// A `since` inside a chunk yields that chunk sliced to start at
    /// `since`. A `since` below the retained backlog yields the whole
    /// backlog with `truncated` set.
    pub fn read(&self, since: u64) -> ReadResult {
        let state = self.read_state();
        let lowest_offset = state.lowest_offset();
        let truncated = since < lowest_offset;
        let chunks = state
            .entries
            .iter()
            .filter(|e| e.chunk.end() > since)
            .map(|e| {
                if e.chunk.offset >= since {
                    e.chunk.clone()
                } else {
                    let skip = (since - e.chunk.offset) as usize;
                    Chunk {
                        offset: since,
                        data: e.chunk.data.slice(skip..),
                        timestamp: e.chunk.timestamp,
                    }
                }
            })
            .collect();
        ReadResult {
            chunks,
            next_offset: state.next_offset,
            lowest_offset,
            truncated,
            live: state.closed_at.is_none(),
        }
    }

    /// Wait for data at or after `since`.
    ///
    /// Returns as soon as something is readable. On a closed stream with
    /// nothing left to read, returns `End` once the grace period after
    /// close has elapsed.
    pub async fn tail(&self, since: u64) -> TailRead {
        // Subscribe before reading so an append between the read and the
        // wait is not missed.
        let mut changes = self.version.subscribe();
        loop {
            let result = self.read(since);
            if !result.chunks.is_empty() || result.truncated {
                return TailRead::Data(result);
            }
            let closed_at = self.read_state().closed_at;
            match closed_at {
                Some(closed_at) => {
                    let deadline = closed_at + self.retention.grace;
                    tokio::time::sleep_until(deadline).await;
                    return TailRead::End {
                        next_offset: result.next_offset,
                    };
                }
                None => {
                    if changes.changed().await.is_err() {
                        return TailRead::End {
                            next_offset: result.next_offset,
                        };
                    }
                }
            }
        }
    }

    /// Stop accepting appends and wake waiting readers. Idempotent.
    pub fn close(&self) {
        let closed = {
            let mut state = self.write_state();
            if state.closed_at.is_some() {
                false
            } else {
                state.closed_at = Some(Instant::now());
                true
            }
        };
        if closed {
            let next_offset = self.read_state().next_offset;
            obs::emit_stream_closed(self.io_id.as_str(), self.channel.as_str(), next_offset);
            self.bump();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.read_state().closed_at.is_some()
    }

    fn closed_longer_than(&self, age: Duration, now: Instant) -> bool {
        self.read_state()
            .closed_at
            .is_some_and(|at| now.saturating_duration_since(at) >= age)
    }

    /// Whole retained backlog as text, invalid UTF-8 replaced.
    pub fn snapshot_text(&self) -> String {
        let state = self.read_state();
        let mut bytes = Vec::with_capacity(state.retained);
        for e in &state.entries {
            bytes.extend_from_slice(&e.chunk.data);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Registry of job output streams.
pub struct LogMux {
    retention: LogRetention,
    streams: RwLock<HashMap<(JobId, Channel), Arc<LogStream>>>,
}

impl LogMux {
    pub fn new(retention: LogRetention) -> Self {
        Self {
            retention,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn retention(&self) -> &LogRetention {
        &self.retention
    }

    /// Create both channel streams for a job. Existing streams are kept.
    pub fn open(&self, io_id: &JobId) {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        for channel in Channel::BOTH {
            streams
                .entry((io_id.clone(), channel))
                .or_insert_with(|| {
                    Arc::new(LogStream::new(io_id.clone(), channel, self.retention.clone()))
                });
        }
    }

    pub fn stream(&self, io_id: &JobId, channel: Channel) -> Option<Arc<LogStream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(io_id.clone(), channel))
            .cloned()
    }

    fn require(&self, io_id: &JobId, channel: Channel) -> CoreResult<Arc<LogStream>> {
        self.stream(io_id, channel).ok_or_else(|| {
            CoreError::NotFound(format!("no retained {channel} for job {io_id}"))
        })
    }

    pub fn append(&self, io_id: &JobId, channel: Channel, data: Bytes) -> CoreResult<u64> {
        self.require(io_id, channel)?.append(data)
    }

    pub fn read(&self, io_id: &JobId, channel: Channel, since: u64) -> CoreResult<ReadResult> {
        Ok(self.require(io_id, channel)?.read(since))
    }

    pub async fn tail(&self, io_id: &JobId, channel: Channel, since: u64) -> CoreResult<TailRead> {
        let stream = self.require(io_id, channel)?;
        Ok(stream.tail(since).await)
    }

    /// Close both streams of a job.
    pub fn close(&self, io_id: &JobId) {
        for channel in Channel::BOTH {
            if let Some(stream) = self.stream(io_id, channel) {
                stream.close();
            }
        }
    }

    /// Drop streams closed for longer than `purge_after`. Returns how many
    /// streams were dropped.
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        let before = streams.len();
        streams.retain(|_, s| !s.closed_longer_than(self.retention.purge_after, now));
        before - streams.len()
    }

    pub fn len(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
