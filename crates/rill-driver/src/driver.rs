//! The driver contract
//!
//! A driver owns one backend session. Lifecycle: build (pure, from a config
//! blob) → `connect` → `query`* → `close`. The owning worker is the sole
//! caller for the lifetime of one task, so methods take `&mut self` and the
//! trait stays object-safe behind `Box<dyn Driver>`.
//!
//! Cancellation is cooperative: every method suspends only at `.await`
//! points, and callers drive them under `tokio::select!` against their
//! cancellation token. Polling drivers bound their poll interval at one
//! second to keep cancellation latency small.

use crate::error::Result;
use crate::stream::RowStream;
use async_trait::async_trait;

/// Uniform adapter to one backend family.
#[async_trait]
pub trait Driver: Send + std::fmt::Debug {
    /// Establish and validate a live backend session.
    async fn connect(&mut self) -> Result<()>;

    /// Begin streaming execution of `sql`.
    ///
    /// The returned stream has not materialized any rows yet; rows are
    /// pulled one frame at a time.
    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>>;

    /// Release the backend session. Idempotent; safe after a partial
    /// `connect`.
    async fn close(&mut self) -> Result<()>;
}
