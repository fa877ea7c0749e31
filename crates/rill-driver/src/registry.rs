//! Process-wide driver registry
//!
//! Maps a backend type tag (the `type` column of a connector record) to a
//! factory that builds a driver from the connector's opaque config blob.
//! Factories validate config and perform no I/O.
//!
//! Registration is thread-safe but intended for startup code paths only;
//! after startup the mapping is effectively read-only and lookups take the
//! read side of the lock.

use crate::driver::Driver;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Backend type tag of the relational driver
pub const POSTGRES: &str = "postgres";
/// Backend type tag of the warehouse driver
pub const BIGQUERY: &str = "bigquery";
/// Backend type tag of the lakehouse driver
pub const ATHENA: &str = "athena";

/// Factory building a driver from a connector config blob.
pub type DriverFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Driver>> + Send + Sync>;

static REGISTRY: Lazy<RwLock<HashMap<String, DriverFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a driver factory under a backend type tag.
///
/// Later registrations for the same tag replace earlier ones.
pub fn register(driver_type: &str, factory: DriverFactory) {
    REGISTRY.write().insert(driver_type.to_string(), factory);
}

/// Check whether a backend type tag has a registered factory.
pub fn contains(driver_type: &str) -> bool {
    REGISTRY.read().contains_key(driver_type)
}

/// Build a driver for the given backend type from its config blob.
///
/// Fails with [`Error::UnsupportedType`] for unknown tags; config validation
/// failures come back from the factory itself.
pub fn build(driver_type: &str, config: &serde_json::Value) -> Result<Box<dyn Driver>> {
    let factory = REGISTRY
        .read()
        .get(driver_type)
        .cloned()
        .ok_or_else(|| Error::UnsupportedType(driver_type.to_string()))?;
    factory(config)
}

/// Register every driver compiled into this build.
///
/// Called once from server startup, before any connection is accepted.
pub fn register_builtin() {
    #[cfg(feature = "postgres")]
    register(
        POSTGRES,
        Arc::new(|config| crate::postgres::PostgresDriver::from_config(config)),
    );
    #[cfg(feature = "bigquery")]
    register(
        BIGQUERY,
        Arc::new(|config| crate::bigquery::BigQueryDriver::from_config(config)),
    );
    #[cfg(feature = "athena")]
    register(
        ATHENA,
        Arc::new(|config| crate::athena::AthenaDriver::from_config(config)),
    );
}
