//! Google BigQuery driver
//!
//! Job-based warehouse driver: a query is submitted as a job, the job state
//! is polled until it reaches a terminal state, and result pages are then
//! streamed one page token at a time. The poll interval is bounded so
//! cooperative cancellation stays responsive.
//!
//! # Authentication
//!
//! Three methods, tried in order of configuration:
//! 1. **Service account JSON** - via the `credentials` config blob
//! 2. **Service account key file** - via `key_file`
//! 3. **Application Default Credentials (ADC)** - automatic fallback

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::stream::{RowStream, StreamFrame};
use crate::types::Value;
use async_trait::async_trait;
use gcp_bigquery_client::model::dataset_reference::DatasetReference;
use gcp_bigquery_client::model::get_query_results_parameters::GetQueryResultsParameters;
use gcp_bigquery_client::model::job::Job;
use gcp_bigquery_client::model::job_configuration::JobConfiguration;
use gcp_bigquery_client::model::job_configuration_query::JobConfigurationQuery;
use gcp_bigquery_client::model::table_row::TableRow;
use gcp_bigquery_client::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use validator::Validate;

/// Interval between job-state polls; bounded to keep cancellation latency
/// under a second.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// BigQuery connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BigQueryConfig {
    #[validate(length(min = 1, max = 255))]
    pub project_id: String,

    #[validate(length(min = 1, max = 1024))]
    pub dataset: String,

    /// Service account credentials as a JSON string
    #[serde(default)]
    pub credentials: Option<String>,

    /// Path to a service account key file
    #[serde(default)]
    pub key_file: Option<String>,

    /// Job location, e.g. "US", "EU"
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub max_billing_tier: Option<i32>,
}

impl BigQueryConfig {
    fn check(&self) -> Result<()> {
        if self.credentials.is_none() && self.key_file.is_none() {
            return Err(Error::config(
                "either credentials or key_file must be provided",
            ));
        }
        Ok(())
    }
}

/// BigQuery driver owning one API client.
pub struct BigQueryDriver {
    config: BigQueryConfig,
    client: Option<Client>,
}

impl std::fmt::Debug for BigQueryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryDriver")
            .field("config", &self.config)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl BigQueryDriver {
    /// Build from a connector config blob. Pure: validates but opens nothing.
    pub fn from_config(config: &serde_json::Value) -> Result<Box<dyn Driver>> {
        let config: BigQueryConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("invalid bigquery config: {e}")))?;
        config
            .validate()
            .map_err(|e| Error::config(format!("invalid bigquery config: {e}")))?;
        config.check()?;
        Ok(Box::new(Self {
            config,
            client: None,
        }))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::connect("bigquery driver is not connected"))
    }

    /// Submit the query as a job and wait for a terminal state.
    async fn run_job(&self, sql: &str) -> Result<(String, Option<String>)> {
        let client = self.client()?;

        let job = Job {
            configuration: Some(JobConfiguration {
                query: Some(JobConfigurationQuery {
                    query: sql.to_string(),
                    use_legacy_sql: Some(false),
                    default_dataset: Some(DatasetReference {
                        dataset_id: self.config.dataset.clone(),
                        project_id: self.config.project_id.clone(),
                    }),
                    maximum_billing_tier: self.config.max_billing_tier,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let submitted = client
            .job()
            .insert(&self.config.project_id, job)
            .await
            .map_err(|e| Error::query(format!("failed to submit query job: {e}")))?;

        let job_ref = serde_json::to_value(&submitted.job_reference).unwrap_or_default();
        let job_id = job_ref
            .get("jobId")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::query("job was accepted without a job reference"))?;
        let location = job_ref
            .get("location")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or_else(|| self.config.location.clone());

        loop {
            let job = client
                .job()
                .get_job(&self.config.project_id, &job_id, location.as_deref())
                .await
                .map_err(|e| Error::query(format!("failed to poll query job: {e}")))?;

            // Inspect the status through its wire form; the terminal error
            // carries the backend's own reason
            let status = serde_json::to_value(&job.status).unwrap_or_default();
            if let Some(reason) = status.get("errorResult").filter(|v| !v.is_null()) {
                return Err(Error::query(format!("query job failed: {reason}")));
            }
            if status.get("state").and_then(|v| v.as_str()) == Some("DONE") {
                debug!(job_id = %job_id, "bigquery job finished");
                return Ok((job_id, location));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Driver for BigQueryDriver {
    async fn connect(&mut self) -> Result<()> {
        let client = if let Some(json) = &self.config.credentials {
            let sa_key = serde_json::from_str(json)
                .map_err(|e| Error::config(format!("invalid credentials JSON: {e}")))?;
            Client::from_service_account_key(sa_key, false)
                .await
                .map_err(|e| {
                    Error::connect(format!("failed to create bigquery client from credentials: {e}"))
                })?
        } else if let Some(path) = &self.config.key_file {
            let sa_key = gcp_bigquery_client::yup_oauth2::read_service_account_key(path)
                .await
                .map_err(|e| {
                    Error::config(format!("failed to read credentials from '{path}': {e}"))
                })?;
            Client::from_service_account_key(sa_key, false)
                .await
                .map_err(|e| {
                    Error::connect(format!("failed to create bigquery client from file: {e}"))
                })?
        } else {
            Client::from_application_default_credentials()
                .await
                .map_err(|e| {
                    Error::connect(format!("failed to create bigquery client with ADC: {e}"))
                })?
        };

        self.client = Some(client);
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Box<dyn RowStream>> {
        let (job_id, location) = self.run_job(sql).await?;

        Ok(Box::new(BigQueryRowStream {
            client: Some(self.client()?.clone()),
            project_id: self.config.project_id.clone(),
            job_id,
            location,
            columns: Vec::new(),
            field_types: Vec::new(),
            header_sent: false,
            buffered: VecDeque::new(),
            page_token: None,
            exhausted: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

/// Streams result pages of a finished query job.
struct BigQueryRowStream {
    client: Option<Client>,
    project_id: String,
    job_id: String,
    location: Option<String>,
    columns: Vec<String>,
    field_types: Vec<String>,
    header_sent: bool,
    buffered: VecDeque<TableRow>,
    page_token: Option<String>,
    exhausted: bool,
}

impl std::fmt::Debug for BigQueryRowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryRowStream")
            .field("project_id", &self.project_id)
            .field("job_id", &self.job_id)
            .field("location", &self.location)
            .field("columns", &self.columns)
            .field("field_types", &self.field_types)
            .field("header_sent", &self.header_sent)
            .field("buffered_len", &self.buffered.len())
            .field("page_token", &self.page_token)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl BigQueryRowStream {
    /// Fetch the next result page into the buffer. On the first page this
    /// also captures the schema.
    async fn fetch_page(&mut self) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::stream("result stream is closed"))?;

        let params = GetQueryResultsParameters {
            location: self.location.clone(),
            page_token: self.page_token.take(),
            ..Default::default()
        };

        let page = client
            .job()
            .get_query_results(&self.project_id, &self.job_id, params)
            .await
            .map_err(|e| Error::stream(format!("failed to fetch query results: {e}")))?;

        if self.columns.is_empty() {
            if let Some(schema) = &page.schema {
                if let Some(fields) = &schema.fields {
                    self.columns = fields.iter().map(|f| f.name.clone()).collect();
                    self.field_types = fields.iter().map(field_type_name).collect();
                }
            }
        }

        self.buffered.extend(page.rows.unwrap_or_default());
        self.page_token = page.page_token;
        if self.page_token.is_none() {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl RowStream for BigQueryRowStream {
    async fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        if !self.header_sent {
            // Schema arrives with the first page
            self.fetch_page().await?;
            self.header_sent = true;
            return Ok(Some(StreamFrame::Header(self.columns.clone())));
        }

        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(StreamFrame::Row(decode_row(row, &self.field_types))));
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

/// Uppercase type name of a schema field, resilient to SDK enum changes.
fn field_type_name(field: &gcp_bigquery_client::model::table_field_schema::TableFieldSchema) -> String {
    serde_json::to_value(&field.r#type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_uppercase))
        .unwrap_or_default()
}

fn decode_row(row: TableRow, field_types: &[String]) -> Vec<Value> {
    row.columns
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(idx, cell)| {
            let field_type = field_types.get(idx).map(String::as_str).unwrap_or("");
            decode_cell(cell.value, field_type)
        })
        .collect()
}

/// Decode one JSON cell by its declared field type.
///
/// BigQuery serializes every scalar as a JSON string (timestamps as epoch
/// seconds, sometimes in scientific notation); unsafe decodes fall back to
/// the text form.
fn decode_cell(cell: Option<serde_json::Value>, field_type: &str) -> Value {
    let raw = match cell {
        None | Some(serde_json::Value::Null) => return Value::Null,
        Some(serde_json::Value::String(s)) => s,
        // Nested records and repeated fields stay as their JSON text form
        Some(other) => return Value::Text(other.to_string()),
    };

    match field_type {
        "INTEGER" | "INT64" => raw
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or(Value::Text(raw)),
        "FLOAT" | "FLOAT64" => raw
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Text(raw)),
        "NUMERIC" | "BIGNUMERIC" => raw
            .parse::<rust_decimal::Decimal>()
            .map(Value::Decimal)
            .unwrap_or(Value::Text(raw)),
        "BOOLEAN" | "BOOL" => match raw.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Text(raw),
        },
        "TIMESTAMP" => raw
            .parse::<f64>()
            .ok()
            .and_then(|secs| {
                let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                chrono::DateTime::from_timestamp(secs.trunc() as i64, nanos)
            })
            .map(Value::Timestamp)
            .unwrap_or(Value::Text(raw)),
        "DATE" => chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or(Value::Text(raw)),
        "BYTES" => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(raw.as_bytes())
                .map(Value::Bytes)
                .unwrap_or(Value::Text(raw))
        }
        _ => Value::Text(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_requires_credentials() {
        let err = BigQueryDriver::from_config(&serde_json::json!({
            "project_id": "proj",
            "dataset": "ds"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("credentials or key_file"));
    }

    #[test]
    fn test_config_requires_project() {
        let err = BigQueryDriver::from_config(&serde_json::json!({
            "project_id": "",
            "dataset": "ds",
            "key_file": "/etc/bq.json"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_accepts_key_file() {
        let driver = BigQueryDriver::from_config(&serde_json::json!({
            "project_id": "proj",
            "dataset": "ds",
            "key_file": "/etc/bq.json",
            "location": "EU",
            "max_billing_tier": 2
        }));
        assert!(driver.is_ok());
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(
            decode_cell(Some(serde_json::json!("42")), "INT64"),
            Value::Int(42)
        );
        assert_eq!(
            decode_cell(Some(serde_json::json!("2.5")), "FLOAT64"),
            Value::Float(2.5)
        );
        assert_eq!(
            decode_cell(Some(serde_json::json!("true")), "BOOL"),
            Value::Bool(true)
        );
        assert_eq!(
            decode_cell(Some(serde_json::json!("hello")), "STRING"),
            Value::Text("hello".into())
        );
        assert_eq!(decode_cell(None, "INT64"), Value::Null);
    }

    #[test]
    fn test_decode_timestamp_from_epoch() {
        let decoded = decode_cell(Some(serde_json::json!("1717243200.0")), "TIMESTAMP");
        match decoded {
            Value::Timestamp(ts) => assert_eq!(ts.timestamp(), 1_717_243_200),
            other => panic!("expected timestamp, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_scientific_notation_timestamp() {
        let decoded = decode_cell(Some(serde_json::json!("1.7172432E9")), "TIMESTAMP");
        assert!(matches!(decoded, Value::Timestamp(_)));
    }

    #[test]
    fn test_unsafe_decode_falls_back_to_text() {
        assert_eq!(
            decode_cell(Some(serde_json::json!("not-a-number")), "INT64"),
            Value::Text("not-a-number".into())
        );
    }

    #[test]
    fn test_decode_numeric() {
        assert_eq!(
            decode_cell(Some(serde_json::json!("99.9900")), "NUMERIC"),
            Value::Decimal("99.9900".parse().unwrap())
        );
    }
}
