//! Row-stream contract shared by every driver
//!
//! A [`RowStream`] is a lazy, finite, single-shot sequence of frames: exactly
//! one [`StreamFrame::Header`] first, then zero or more [`StreamFrame::Row`]s,
//! then `None`. Streams close their backend cursor on every exit path —
//! normal exhaustion, early [`close`](RowStream::close), error, or drop.

use crate::error::Result;
use crate::types::Value;
use async_trait::async_trait;

/// One frame yielded by a row stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Column names, yielded exactly once before any row
    Header(Vec<String>),
    /// One row of portable values, in backend-native order
    Row(Vec<Value>),
}

impl StreamFrame {
    /// Whether this is the header frame
    #[inline]
    pub const fn is_header(&self) -> bool {
        matches!(self, Self::Header(_))
    }
}

/// Streaming result of one query execution.
///
/// Not restartable: after `next_frame` returns `Ok(None)` or an error, no
/// further frames are yielded.
#[async_trait]
pub trait RowStream: Send + std::fmt::Debug {
    /// Pull the next frame, or `None` once the stream is exhausted.
    async fn next_frame(&mut self) -> Result<Option<StreamFrame>>;

    /// Release the backend cursor. Idempotent; also safe mid-stream.
    async fn close(&mut self) -> Result<()>;
}

/// Collect a whole stream into `(columns, rows)`.
///
/// Materializes the result set in memory, so this is for small results and
/// tests; the gateway itself never calls it.
pub async fn collect_frames(
    stream: &mut dyn RowStream,
) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut columns = Vec::new();
    let mut rows = Vec::new();

    while let Some(frame) = stream.next_frame().await? {
        match frame {
            StreamFrame::Header(cols) => columns = cols,
            StreamFrame::Row(row) => rows.push(row),
        }
    }
    stream.close().await?;

    Ok((columns, rows))
}
