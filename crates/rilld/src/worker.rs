//! Connection worker pool
//!
//! N workers per connection drain one bounded queue. Each worker owns one
//! task at a time: it marks the task running, resolves it to a live stream,
//! frames every row, and emits the terminal frames. Row framing is
//! synchronous with the write path, so a slow client transitively slows the
//! worker — that is the backpressure signal.
//!
//! Terminal commit point: whoever removes the task from the active index
//! owns the terminal frames. A worker that finds its entry already gone
//! knows a cancel won the race and emits nothing further for that stream.
//! Failures are recorded on the task before the entry is claimed, and the
//! cancel path refuses to override a recorded failure, so a cancel racing a
//! pre-existing failure loses: `status:failed` wins over `status:cancelled`.

use crate::connection::{ConnectionState, FrameWriter, QueryTask};
use crate::protocol::{ServerFrame, StreamStatus};
use axum::extract::ws::Message;
use futures::Sink;
use rill_driver::StreamFrame;
use rill_resolver::{QueryHandle, Resolver};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Everything a worker needs, shared per connection.
pub struct WorkerContext<S> {
    pub state: Arc<ConnectionState>,
    pub writer: Arc<FrameWriter<S>>,
    pub resolver: Arc<Resolver>,
}

/// How one task ended.
enum Outcome {
    Completed(u64),
    Failed(rill_resolver::Error),
    Cancelled,
}

/// Worker loop: drain the queue until the connection token fires or the
/// queue closes.
pub async fn run_worker<S>(
    ctx: Arc<WorkerContext<S>>,
    queue: Arc<Mutex<mpsc::Receiver<Arc<QueryTask>>>>,
) where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    loop {
        let task = tokio::select! {
            _ = ctx.state.token.cancelled() => break,
            task = async { queue.lock().await.recv().await } => match task {
                Some(task) => task,
                None => break,
            },
        };

        run_task(&ctx, task).await;
    }
}

async fn run_task<S>(ctx: &WorkerContext<S>, task: Arc<QueryTask>)
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let stream_id = task.request.stream_id.clone();

    // Cancelled while still queued: the cancel path already removed the
    // entry and emitted its status frame.
    if task.cancel.is_cancelled() {
        return;
    }

    task.mark_running();
    if let Err(e) = ctx
        .writer
        .send_frame(&ServerFrame::status(&stream_id, StreamStatus::Running))
        .await
    {
        debug!(stream_id = %stream_id, "failed to report running status: {}", e);
    }

    let outcome = execute(ctx, &task).await;

    // Record a failure before claiming the entry, so a cancel frame racing
    // in cannot override the already-determined terminal state.
    if matches!(outcome, Outcome::Failed(_)) {
        task.set_status(StreamStatus::Failed);
    }

    // Claim the terminal transition. None means a cancel beat us: nothing
    // further may be emitted for this stream.
    let Some(owned) = ctx.state.take_task(&stream_id) else {
        task.cancel.cancel();
        return;
    };

    match outcome {
        Outcome::Completed(total_rows) => {
            owned.set_status(StreamStatus::Completed);
            send_or_log(ctx, ServerFrame::complete(&stream_id, total_rows)).await;
            send_or_log(ctx, ServerFrame::status(&stream_id, StreamStatus::Completed)).await;
        }
        Outcome::Failed(error) => {
            warn!(stream_id = %stream_id, "query failed: {}", error);
            send_or_log(
                ctx,
                ServerFrame::error(&stream_id, error.to_string(), Some(error.code())),
            )
            .await;
            send_or_log(ctx, ServerFrame::status(&stream_id, StreamStatus::Failed)).await;
        }
        Outcome::Cancelled => {
            // The connection is tearing down (task token fired without a
            // cancel frame); no frames are owed to anyone.
            owned.set_status(StreamStatus::Cancelled);
        }
    }

    task.cancel.cancel();
}

/// Resolve and drive one task, honoring its cancellation token at every
/// suspension point. The stream and driver are fully closed before this
/// returns.
async fn execute<S>(ctx: &WorkerContext<S>, task: &QueryTask) -> Outcome
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let request = &task.request;

    let resolved = tokio::select! {
        _ = task.cancel.cancelled() => return Outcome::Cancelled,
        resolved = ctx.resolver.resolve(&request.query_id, &request.template_data) => resolved,
    };

    let mut handle = match resolved {
        Ok(handle) => handle,
        Err(error) => return Outcome::Failed(error),
    };

    let outcome = tokio::select! {
        _ = task.cancel.cancelled() => Outcome::Cancelled,
        outcome = drive_stream(ctx, &request.stream_id, &mut handle) => outcome,
    };

    handle.close().await;
    outcome
}

/// Pull frames from the stream and write them out one at a time. Each frame
/// write completes before the next row is pulled from the driver.
async fn drive_stream<S>(
    ctx: &WorkerContext<S>,
    stream_id: &str,
    handle: &mut QueryHandle,
) -> Outcome
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let mut total_rows = 0u64;

    loop {
        let frame = match handle.stream().next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Outcome::Completed(total_rows),
            Err(error) => return Outcome::Failed(error.into()),
        };

        let outbound = match frame {
            StreamFrame::Header(columns) => ServerFrame::metadata(stream_id, columns),
            StreamFrame::Row(values) => {
                total_rows += 1;
                ServerFrame::row(stream_id, values)
            }
        };

        if let Err(e) = ctx.writer.send_frame(&outbound).await {
            return Outcome::Failed(rill_resolver::Error::Driver(rill_driver::Error::stream(
                format!("failed to write frame: {e}"),
            )));
        }
    }
}

async fn send_or_log<S>(ctx: &WorkerContext<S>, frame: ServerFrame)
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    if let Err(e) = ctx.writer.send_frame(&frame).await {
        debug!("failed to write frame: {}", e);
    }
}
