//! # rilld
//!
//! The rill gateway daemon: a streaming query-execution service multiplexing
//! many analytic query streams over persistent WebSocket transports.
//!
//! Each connection gets a bounded pending-query queue drained by a small
//! worker pool; each admitted stream runs `status:queued → status:running →
//! metadata → row* → terminal` with cooperative mid-flight cancellation.
//! Query definitions and connector configurations come from the metadata
//! store (see `rill-resolver`); backends are reached through the driver
//! registry (see `rill-driver`).

pub mod cli;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod worker;

pub use cli::Cli;
pub use config::GatewayConfig;
pub use server::Gateway;
