//! # rill-driver
//!
//! Uniform streaming driver interface over heterogeneous query backends.
//!
//! This crate owns the contract between the gateway and the engines it
//! queries: a [`Driver`] exposes `connect` / `query` / `close` over one
//! backend session, a [`RowStream`] yields one header frame followed by rows
//! of portable [`Value`]s, and the process-wide [`registry`] maps backend
//! type tags to config-validating factories.
//!
//! ## Backends
//!
//! - **postgres** — relational, wire-protocol driver via tokio-postgres with
//!   optional TLS (PEM-encoded root/client pair) and a prepared-statement
//!   cache
//! - **bigquery** — warehouse, job-based driver (submit → poll → page) via
//!   gcp-bigquery-client
//! - **athena** — lakehouse, poll-and-paginate driver via the AWS SDK
//!
//! Each backend sits behind a cargo feature of the same name; all three are
//! on by default.
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres
//! - `bigquery` - Google BigQuery support via gcp-bigquery-client
//! - `athena` - Amazon Athena support via aws-sdk-athena

pub mod driver;
pub mod error;
pub mod registry;
pub mod stream;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "bigquery")]
pub mod bigquery;

#[cfg(feature = "athena")]
pub mod athena;

pub use driver::Driver;
pub use error::{Error, Result};
pub use stream::{collect_frames, RowStream, StreamFrame};
pub use types::Value;
