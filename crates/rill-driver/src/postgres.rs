//! PostgreSQL driver
//!
//! Single-session relational driver over tokio-postgres:
//! - optional TLS with a PEM-encoded root certificate and client pair
//! - prepared-statement cache keyed by SQL text
//! - per-OID value coercion with a text fallback for unknown types
//! - retryable classification of transient SQLSTATEs (serialization
//!   failure, deadlock, lock timeouts, server shutdown states)

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::stream::{RowStream, StreamFrame};
use crate::types::Value;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, warn};
use validator::Validate;

/// Statement-level timeout applied to every session (ms)
const STATEMENT_TIMEOUT_MS: u32 = 30_000;

/// Lock acquisition timeout applied to every session (ms)
const LOCK_TIMEOUT_MS: u32 = 10_000;

/// Overall budget for connect + ping
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// SSL negotiation mode, mirroring libpq's sslmode values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

/// PostgreSQL connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PostgresConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[validate(length(min = 1))]
    pub database: String,

    #[validate(length(min = 1))]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub ssl_mode: SslMode,

    /// PEM-encoded client certificate
    #[serde(default)]
    pub ssl_cert: Option<String>,

    /// PEM-encoded client private key
    #[serde(default)]
    pub ssl_key: Option<String>,

    /// PEM-encoded root certificate; TLS is negotiated only when present
    #[serde(default)]
    pub ssl_root_cert: Option<String>,

    #[serde(default)]
    pub search_path: Option<String>,

    #[serde(default)]
    pub application_name: Option<String>,

    #[serde(default = "default_max_open_conns")]
    #[validate(range(min = 1, max = 100))]
    pub max_open_conns: u32,

    #[serde(default = "default_max_idle_conns")]
    #[validate(range(max = 100))]
    pub max_idle_conns: u32,

    #[serde(default = "default_conn_max_lifetime_secs")]
    pub conn_max_lifetime_secs: u64,
}

fn default_port() -> u16 {
    5432
}

fn default_max_open_conns() -> u32 {
    10
}

fn default_max_idle_conns() -> u32 {
    2
}

fn default_conn_max_lifetime_secs() -> u64 {
    300
}

impl PostgresConfig {
    /// Cross-field invariants that `validator` derives cannot express.
    fn check(&self) -> Result<()> {
        if self.ssl_cert.is_some() != self.ssl_key.is_some() {
            return Err(Error::config(
                "both ssl_cert and ssl_key must be provided if one is specified",
            ));
        }
        if self.max_idle_conns > self.max_open_conns {
            return Err(Error::config(
                "max_idle_conns cannot be greater than max_open_conns",
            ));
        }
        Ok(())
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .password(&self.password)
            .dbname(&self.database)
            .connect_timeout(Duration::from_secs(10));

        let mut options = format!(
            "-c statement_timeout={} -c lock_timeout={}",
            STATEMENT_TIMEOUT_MS, LOCK_TIMEOUT_MS
        );
        if let Some(search_path) = &self.search_path {
            options.push_str(&format!(" -c search_path={}", search_path));
        }
        config.options(&options);

        if let Some(app_name) = &self.application_name {
            config.application_name(app_name);
        }

        config
    }

    /// Build the rustls client config from the PEM material, or `None` when
    /// no root certificate is configured (plaintext session).
    fn tls_config(&self) -> Result<Option<rustls::ClientConfig>> {
        let Some(root_pem) = self.ssl_root_cert.as_deref() else {
            return Ok(None);
        };

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
            let cert = cert.map_err(|e| Error::config(format!("invalid root certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::config(format!("failed to add root certificate: {e}")))?;
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let config = match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::config(format!("invalid client certificate: {e}")))?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
                    .map_err(|e| Error::config(format!("invalid client key: {e}")))?
                    .ok_or_else(|| Error::config("no private key found in ssl_key"))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::config(format!("bad client certificate pair: {e}")))?
            }
            _ => builder.with_no_client_auth(),
        };

        Ok(Some(config))
    }
}

/// PostgreSQL driver owning one connection.
pub struct PostgresDriver {
    config: PostgresConfig,
    client: Option<Arc<Client>>,
    statements: Mutex<HashMap<String, Statement>>,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("config", &self.config)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl PostgresDriver {
    /// Build from a connector config blob. Pure: validates but opens nothing.
    pub fn from_config(config: &serde_json::Value) -> Result<Box<dyn Driver>> {
        let config: PostgresConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid postgres config: {e}")))?;
        config
            .validate()
            .map_err(|e| Error::config(format!("invalid postgres config: {e}")))?;
        config.check()?;
        Ok(Box::new(Self {
            config,
            client: None,
            statements: Mutex::new(HashMap::new()),
        }))
    }

    fn client(&self) -> Result<&Arc<Client>> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::connect("postgres driver is not connected"))
    }

    /// Prepare `sql`, reusing a previously prepared statement when the same
    /// text was seen on this session.
    async fn prepare_cached(&self, sql: &str) -> Result<Statement> {
        if let Some(stmt) = self.statements.lock().get(sql) {
            return Ok(stmt.clone());
        }

        let stmt = self
            .client()?
            .prepare(sql)
            .await
            .map_err(classify_query_error)?;
        self.statements.lock().insert(sql.to_string(), stmt.clone());
        Ok(stmt)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn connect(&mut self) -> Result<()> {
        let pg_config = self.config.pg_config();
        let tls = self.config.tls_config()?;

        let client = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let client = match tls {
                None => {
                    let (client, connection) = pg_config
                        .connect(NoTls)
                        .await
                        .map_err(|e| Error::connect(format!("failed to connect: {e}")))?;
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            warn!("postgres connection task ended: {}", e);
                        }
                    });
                    client
                }
                Some(tls_config) => {
                    let connector = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
                    let (client, connection) = pg_config
                        .connect(connector)
                        .await
                        .map_err(|e| Error::connect(format!("failed to connect: {e}")))?;
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            warn!("postgres connection task ended: {}", e);
                        }
                    });
                    client
                }
            };

            // Validate the session before handing it out
            client
                .simple_query("SELECT 1")
                .await
                .map_err(|e| Error::connect(format!("failed to ping postgres: {e}")))?;

            Ok::<_, Error>(client)
        })
        .await
        .map_err(|_| Error::connect("timed out connecting to postgres"))??;

        debug!(host = %self.config.host, database = %self.config.database, "postgres session established");
        self.client = Some(Arc::new(client));
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>> {
        let stmt = self.prepare_cached(sql).await?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let rows = self
            .client()?
            .query_raw(&stmt, Vec::<String>::new())
            .await
            .map_err(classify_query_error)?;

        Ok(Box::new(PgRowStream {
            columns,
            header_sent: false,
            rows: Some(rows.map(|r| r.map_err(|e| Error::stream(e.to_string()))).boxed()),
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.statements.lock().clear();
        // Dropping the client tears the session down; the connection task
        // exits once the socket drains.
        self.client = None;
        Ok(())
    }
}

/// Streaming cursor over a tokio-postgres row stream.
struct PgRowStream {
    columns: Vec<String>,
    header_sent: bool,
    rows: Option<BoxStream<'static, Result<tokio_postgres::Row>>>,
}

impl std::fmt::Debug for PgRowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRowStream")
            .field("columns", &self.columns)
            .field("header_sent", &self.header_sent)
            .field("exhausted", &self.rows.is_none())
            .finish()
    }
}

#[async_trait]
impl RowStream for PgRowStream {
    async fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        if !self.header_sent {
            self.header_sent = true;
            return Ok(Some(StreamFrame::Header(self.columns.clone())));
        }

        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };

        match rows.next().await {
            Some(Ok(row)) => Ok(Some(StreamFrame::Row(decode_row(&row)))),
            Some(Err(e)) => {
                self.rows = None;
                Err(e)
            }
            None => {
                self.rows = None;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the stream releases the portal
        self.rows = None;
        Ok(())
    }
}

/// Decode one backend row into portable values.
fn decode_row(row: &tokio_postgres::Row) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| decode_value(row, idx, col.type_()))
        .collect()
}

/// Per-OID coercion with a text fallback for anything unmapped.
fn decode_value(row: &tokio_postgres::Row, idx: usize, pg_type: &tokio_postgres::types::Type) -> Value {
    use tokio_postgres::types::Type;

    match *pg_type {
        Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx)),
        Type::INT2 => opt(row.try_get::<_, Option<i16>>(idx)),
        Type::INT4 => opt(row.try_get::<_, Option<i32>>(idx)),
        Type::INT8 => opt(row.try_get::<_, Option<i64>>(idx)),
        Type::FLOAT4 => opt(row.try_get::<_, Option<f32>>(idx)),
        Type::FLOAT8 => opt(row.try_get::<_, Option<f64>>(idx)),
        Type::NUMERIC => opt(row.try_get::<_, Option<rust_decimal::Decimal>>(idx)),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            opt(row.try_get::<_, Option<String>>(idx))
        }
        Type::BYTEA => opt(row.try_get::<_, Option<Vec<u8>>>(idx)),
        Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|ndt| Value::Timestamp(ndt.and_utc()))
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => opt(row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)),
        Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx)),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(|j| Value::Text(j.to_string()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

fn opt<T: Into<Value>>(res: std::result::Result<Option<T>, tokio_postgres::Error>) -> Value {
    res.ok().flatten().map(Into::into).unwrap_or(Value::Null)
}

/// Classify a backend error, flagging transient SQLSTATEs as retryable.
fn classify_query_error(err: tokio_postgres::Error) -> Error {
    let retryable = err.code().is_some_and(is_retryable_state);
    if retryable {
        Error::query_retryable(err.to_string())
    } else {
        Error::query(err.to_string())
    }
}

fn is_retryable_state(code: &SqlState) -> bool {
    *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::LOCK_NOT_AVAILABLE
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> serde_json::Value {
        serde_json::json!({
            "host": "db.internal",
            "database": "analytics",
            "username": "reporter",
            "password": "secret"
        })
    }

    #[test]
    fn test_config_defaults() {
        let config: PostgresConfig = serde_json::from_value(base_config()).unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.ssl_mode, SslMode::Disable);
        assert_eq!(config.max_open_conns, 10);
        assert_eq!(config.max_idle_conns, 2);
        assert_eq!(config.conn_max_lifetime_secs, 300);
    }

    #[test]
    fn test_config_requires_host() {
        let err = PostgresDriver::from_config(&serde_json::json!({
            "host": "",
            "database": "d",
            "username": "u"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_ssl_pair_must_be_complete() {
        let mut config = base_config();
        config["ssl_cert"] = "-----BEGIN CERTIFICATE-----".into();
        let err = PostgresDriver::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("ssl_cert and ssl_key"));
    }

    #[test]
    fn test_idle_bounded_by_open() {
        let mut config = base_config();
        config["max_open_conns"] = 2.into();
        config["max_idle_conns"] = 5.into();
        let err = PostgresDriver::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_idle_conns"));
    }

    #[test]
    fn test_ssl_mode_parsing() {
        let config: PostgresConfig = serde_json::from_value(serde_json::json!({
            "host": "h", "database": "d", "username": "u", "ssl_mode": "verify-full"
        }))
        .unwrap();
        assert_eq!(config.ssl_mode, SslMode::VerifyFull);
    }

    #[test]
    fn test_session_options_include_timeouts() {
        let config: PostgresConfig = serde_json::from_value(base_config()).unwrap();
        let pg = config.pg_config();
        let options = pg.get_options().unwrap_or_default();
        assert!(options.contains("statement_timeout=30000"));
        assert!(options.contains("lock_timeout=10000"));
    }

    #[test]
    fn test_search_path_option() {
        let mut raw = base_config();
        raw["search_path"] = "reporting".into();
        let config: PostgresConfig = serde_json::from_value(raw).unwrap();
        let pg = config.pg_config();
        assert!(pg.get_options().unwrap_or_default().contains("search_path=reporting"));
    }

    #[test]
    fn test_no_tls_without_root_cert() {
        let config: PostgresConfig = serde_json::from_value(base_config()).unwrap();
        assert!(config.tls_config().unwrap().is_none());
    }

    #[test]
    fn test_retryable_states() {
        assert!(is_retryable_state(&SqlState::T_R_SERIALIZATION_FAILURE));
        assert!(is_retryable_state(&SqlState::T_R_DEADLOCK_DETECTED));
        assert!(is_retryable_state(&SqlState::LOCK_NOT_AVAILABLE));
        assert!(!is_retryable_state(&SqlState::SYNTAX_ERROR));
        assert!(!is_retryable_state(&SqlState::UNDEFINED_TABLE));
    }

    #[tokio::test]
    async fn test_query_before_connect_fails() {
        let mut driver = PostgresDriver::from_config(&base_config()).unwrap();
        let err = driver.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn test_close_before_connect_is_safe() {
        let mut driver = PostgresDriver::from_config(&base_config()).unwrap();
        driver.close().await.unwrap();
        driver.close().await.unwrap();
    }
}
