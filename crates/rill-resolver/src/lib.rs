//! # rill-resolver
//!
//! Stored-query resolution for the rill gateway.
//!
//! The resolver is the pure composition that turns a query id plus a
//! caller-supplied parameter map into a live row stream: metadata lookup →
//! template render → driver build → connect → query. It keeps no state of
//! its own and may be invoked concurrently from every worker.

pub mod error;
pub mod resolver;
pub mod store;
pub mod template;

pub use error::{Error, Result};
pub use resolver::{QueryHandle, Resolver};
pub use store::{ConnectorRecord, MetadataStore, QueryDefinition};
