//! Per-connection state
//!
//! One WebSocket transport owns one [`ConnectionState`]: the active-task
//! index keyed by stream id, the bounded pending-query queue, and the
//! connection-scoped cancellation token every task token derives from.
//! Outbound frames go through a [`FrameWriter`], whose lock is held for
//! exactly one frame serialization + write, never across driver I/O.

use crate::protocol::{ServerFrame, StreamStatus};
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Time allowed to write one frame to the peer
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// One admitted query execution request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub stream_id: String,
    pub query_id: String,
    pub template_data: serde_json::Value,
}

/// A query execution task tracked in the active index.
#[derive(Debug)]
pub struct QueryTask {
    pub request: QueryRequest,
    /// Cancel handle; a child of the connection token
    pub cancel: CancellationToken,
    status: Mutex<StreamStatus>,
    executed_at: Mutex<Option<DateTime<Utc>>>,
}

impl QueryTask {
    fn new(request: QueryRequest, cancel: CancellationToken) -> Self {
        Self {
            request,
            cancel,
            status: Mutex::new(StreamStatus::Queued),
            executed_at: Mutex::new(None),
        }
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: StreamStatus) {
        *self.status.lock() = status;
    }

    /// Transition queued → running, stamping the execution time.
    pub fn mark_running(&self) {
        *self.status.lock() = StreamStatus::Running;
        *self.executed_at.lock() = Some(Utc::now());
    }

    pub fn executed_at(&self) -> Option<DateTime<Utc>> {
        *self.executed_at.lock()
    }
}

/// Admission failures. Surfaced as an `error` frame; the transport stays
/// open.
#[derive(Error, Debug)]
pub enum AdmitError {
    #[error("streamId and queryId are required")]
    InvalidRequest,

    #[error("stream {0} already exists")]
    DuplicateStream(String),

    #[error("query queue is full")]
    QueueFull,
}

impl AdmitError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::DuplicateStream(_) => "DuplicateStream",
            Self::QueueFull => "QueueFull",
        }
    }
}

/// Cancellation failures.
#[derive(Error, Debug)]
pub enum CancelError {
    #[error("streamId is required")]
    InvalidRequest,

    #[error("stream {0} not found")]
    StreamNotFound(String),
}

impl CancelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::StreamNotFound(_) => "StreamNotFound",
        }
    }
}

/// State for a single transport.
pub struct ConnectionState {
    /// Connection-scoped token; cancelling it cancels every task
    pub token: CancellationToken,
    active: RwLock<HashMap<String, Arc<QueryTask>>>,
    queue_tx: mpsc::Sender<Arc<QueryTask>>,
}

impl ConnectionState {
    /// Create the state plus the queue receiver its workers will drain.
    pub fn new(
        token: CancellationToken,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<QueryTask>>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        (
            Arc::new(Self {
                token,
                active: RwLock::new(HashMap::new()),
                queue_tx,
            }),
            queue_rx,
        )
    }

    /// Admit a query request: validate, reserve a queue slot, insert into
    /// the active index.
    ///
    /// Returns the task plus the reserved slot. The caller emits the
    /// `status:queued` frame first and only then sends the task through the
    /// permit, which guarantees `queued` precedes `running` on the wire.
    pub fn admit(
        &self,
        request: QueryRequest,
    ) -> Result<(Arc<QueryTask>, mpsc::Permit<'_, Arc<QueryTask>>), AdmitError> {
        if request.stream_id.is_empty() || request.query_id.is_empty() {
            return Err(AdmitError::InvalidRequest);
        }

        let stream_id = request.stream_id.clone();
        let task = Arc::new(QueryTask::new(request, self.token.child_token()));

        let mut active = self.active.write();
        if active.contains_key(&stream_id) {
            task.cancel.cancel();
            return Err(AdmitError::DuplicateStream(stream_id));
        }

        let permit = match self.queue_tx.try_reserve() {
            Ok(permit) => permit,
            Err(_) => {
                task.cancel.cancel();
                return Err(AdmitError::QueueFull);
            }
        };

        active.insert(stream_id, task.clone());
        Ok((task, permit))
    }

    /// Cancel a stream: remove it from the index and fire its cancel
    /// handle. The caller emits the `status:cancelled` frame afterwards.
    ///
    /// A task whose failure has already been recorded is left in place and
    /// reported as not found: the worker owns its terminal frames, and
    /// `status:failed` wins over `status:cancelled`.
    pub fn cancel_stream(&self, stream_id: &str) -> Result<Arc<QueryTask>, CancelError> {
        if stream_id.is_empty() {
            return Err(CancelError::InvalidRequest);
        }

        let mut active = self.active.write();
        let task = active
            .remove(stream_id)
            .ok_or_else(|| CancelError::StreamNotFound(stream_id.to_string()))?;

        if task.status() == StreamStatus::Failed {
            active.insert(stream_id.to_string(), task);
            return Err(CancelError::StreamNotFound(stream_id.to_string()));
        }

        task.cancel.cancel();
        task.set_status(StreamStatus::Cancelled);
        Ok(task)
    }

    /// Claim a task for its terminal transition. Whoever removes the entry
    /// owns the terminal frames; a `None` here means a cancel beat us to it.
    pub fn take_task(&self, stream_id: &str) -> Option<Arc<QueryTask>> {
        self.active.write().remove(stream_id)
    }

    /// Number of live entries in the active index.
    pub fn active_len(&self) -> usize {
        self.active.read().len()
    }

    /// Cancel every active task. Used at transport teardown.
    pub fn cancel_all(&self) {
        let mut active = self.active.write();
        for task in active.values() {
            task.cancel.cancel();
        }
        active.clear();
    }
}

/// Write-serialization errors.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("write timed out")]
    Timeout,

    #[error("transport write failed: {0}")]
    Transport(String),
}

/// Serializes all outbound frames on one transport.
///
/// The lock is exclusive and held only for the duration of a single
/// outbound frame, which is what makes concurrent workers produce a totally
/// ordered byte stream.
pub struct FrameWriter<S> {
    sink: tokio::sync::Mutex<S>,
}

impl<S> FrameWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
        }
    }

    /// Write one frame under the write lock with the write deadline applied.
    pub async fn send_frame(&self, frame: &ServerFrame) -> Result<(), WriteError> {
        let text = serde_json::to_string(frame).map_err(|e| WriteError::Encode(e.to_string()))?;
        self.send_message(Message::Text(text)).await
    }

    /// Write a liveness ping under the write lock.
    pub async fn send_ping(&self) -> Result<(), WriteError> {
        self.send_message(Message::Ping(Vec::new())).await
    }

    async fn send_message(&self, message: Message) -> Result<(), WriteError> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, sink.send(message))
            .await
            .map_err(|_| WriteError::Timeout)?
            .map_err(|e| WriteError::Transport(e.to_string()))
    }
}
