//! Amazon Athena driver
//!
//! Lakehouse driver over the AWS SDK: a query execution is started, its
//! state is polled until {Succeeded, Failed, Cancelled}, and result pages
//! are then walked via pagination tokens. Terminal failures surface the
//! backend's state-change reason.
//!
//! Credentials: explicit static keys when configured, otherwise the default
//! AWS credential chain (environment, profile, instance role).

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::stream::{RowStream, StreamFrame};
use crate::types::Value;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_athena::config::{Credentials, Region};
use aws_sdk_athena::types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration, Row};
use aws_sdk_athena::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use validator::Validate;

/// Interval between execution-state polls; bounded to keep cancellation
/// latency under a second.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Athena connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AthenaConfig {
    #[validate(length(min = 1))]
    pub region: String,

    #[validate(length(min = 1))]
    pub database: String,

    /// S3 location receiving query result artifacts
    #[validate(length(min = 1))]
    pub output_location: String,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub session_token: Option<String>,

    #[serde(default = "default_workgroup")]
    pub workgroup: String,

    #[serde(default = "default_catalog")]
    pub catalog: String,
}

fn default_workgroup() -> String {
    "primary".to_string()
}

fn default_catalog() -> String {
    "AwsDataCatalog".to_string()
}

/// Athena driver owning one API client.
#[derive(Debug)]
pub struct AthenaDriver {
    config: AthenaConfig,
    client: Option<Client>,
}

impl AthenaDriver {
    /// Build from a connector config blob. Pure: validates but opens nothing.
    pub fn from_config(config: &serde_json::Value) -> Result<Box<dyn Driver>> {
        let config: AthenaConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid athena config: {e}")))?;
        config
            .validate()
            .map_err(|e| Error::config(format!("invalid athena config: {e}")))?;
        Ok(Box::new(Self {
            config,
            client: None,
        }))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::connect("athena driver is not connected"))
    }

    /// Start the execution and poll until it reaches a terminal state.
    async fn run_execution(&self, sql: &str) -> Result<String> {
        let client = self.client()?;

        let started = client
            .start_query_execution()
            .query_string(sql)
            .query_execution_context(
                QueryExecutionContext::builder()
                    .database(&self.config.database)
                    .catalog(&self.config.catalog)
                    .build(),
            )
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(&self.config.output_location)
                    .build(),
            )
            .work_group(&self.config.workgroup)
            .send()
            .await
            .map_err(|e| Error::query(format!("failed to start query execution: {e}")))?;

        let execution_id = started
            .query_execution_id()
            .ok_or_else(|| Error::query("query execution started without an id"))?
            .to_string();

        loop {
            let status = client
                .get_query_execution()
                .query_execution_id(&execution_id)
                .send()
                .await
                .map_err(|e| Error::query(format!("failed to poll query execution: {e}")))?;

            let execution = status
                .query_execution()
                .ok_or_else(|| Error::query("query execution vanished while polling"))?;
            let state = execution.status().and_then(|s| s.state());

            match state {
                Some(QueryExecutionState::Succeeded) => {
                    debug!(execution_id = %execution_id, "athena execution finished");
                    return Ok(execution_id);
                }
                Some(QueryExecutionState::Failed) | Some(QueryExecutionState::Cancelled) => {
                    let reason = execution
                        .status()
                        .and_then(|s| s.state_change_reason())
                        .unwrap_or("no reason given");
                    return Err(Error::query(format!("query failed: {reason}")));
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }
}

#[async_trait]
impl Driver for AthenaDriver {
    async fn connect(&mut self) -> Result<()> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (
            self.config.access_key_id.clone(),
            self.config.secret_access_key.clone(),
        ) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                self.config.session_token.clone(),
                None,
                "connector-config",
            ));
        }

        let sdk_config = loader.load().await;
        self.client = Some(Client::new(&sdk_config));
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>> {
        let execution_id = self.run_execution(sql).await?;

        Ok(Box::new(AthenaRowStream {
            client: Some(self.client()?.clone()),
            execution_id,
            columns: Vec::new(),
            column_types: Vec::new(),
            header_sent: false,
            first_page: true,
            buffered: VecDeque::new(),
            next_token: None,
            exhausted: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

/// Streams result pages of a finished query execution.
#[derive(Debug)]
struct AthenaRowStream {
    client: Option<Client>,
    execution_id: String,
    columns: Vec<String>,
    column_types: Vec<String>,
    header_sent: bool,
    first_page: bool,
    buffered: VecDeque<Row>,
    next_token: Option<String>,
    exhausted: bool,
}

impl AthenaRowStream {
    async fn fetch_page(&mut self) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::stream("result stream is closed"))?;

        let mut request = client
            .get_query_results()
            .query_execution_id(&self.execution_id);
        if let Some(token) = self.next_token.take() {
            request = request.next_token(token);
        }

        let page = request
            .send()
            .await
            .map_err(|e| Error::stream(format!("failed to fetch query results: {e}")))?;

        let mut rows: Vec<Row> = page
            .result_set()
            .map(|rs| rs.rows().to_vec())
            .unwrap_or_default();

        if self.first_page {
            if let Some(metadata) = page.result_set().and_then(|rs| rs.result_set_metadata()) {
                for info in metadata.column_info() {
                    self.columns.push(info.name().to_string());
                    self.column_types.push(info.r#type().to_string());
                }
            }
            // The first page repeats the column names as its first row
            if !rows.is_empty() {
                rows.remove(0);
            }
            self.first_page = false;
        }

        self.buffered.extend(rows);
        self.next_token = page.next_token().map(str::to_string);
        if self.next_token.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl RowStream for AthenaRowStream {
    async fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        if !self.header_sent {
            // Column metadata arrives with the first page
            self.fetch_page().await?;
            self.header_sent = true;
            return Ok(Some(StreamFrame::Header(self.columns.clone())));
        }

        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(StreamFrame::Row(self.decode_row(row))));
            }
            if self.exhausted || self.client.is_none() {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        self.buffered.clear();
        self.exhausted = true;
        Ok(())
    }
}

impl AthenaRowStream {
    fn decode_row(&self, row: Row) -> Vec<Value> {
        row.data()
            .iter()
            .enumerate()
            .map(|(idx, datum)| {
                let column_type = self.column_types.get(idx).map(String::as_str).unwrap_or("");
                decode_datum(datum.var_char_value(), column_type)
            })
            .collect()
    }
}

/// Athena hands every cell over as a VarChar; decode it by the declared
/// column type, falling back to the text form when parsing is unsafe.
fn decode_datum(value: Option<&str>, column_type: &str) -> Value {
    let Some(raw) = value else {
        return Value::Null;
    };

    match column_type {
        "tinyint" | "smallint" | "int" | "integer" | "bigint" => raw
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        "float" | "real" | "double" => raw
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        "decimal" => raw
            .parse::<rust_decimal::Decimal>()
            .map(Value::Decimal)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        "boolean" => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Text(raw.to_string()),
        },
        "timestamp" => chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .map(|ndt| Value::Timestamp(ndt.and_utc()))
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        "date" => chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        _ => Value::Text(raw.to_string()),
    }
}
