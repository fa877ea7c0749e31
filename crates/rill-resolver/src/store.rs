//! Metadata store client
//!
//! Read-only client for the Supabase (PostgREST) tables holding stored query
//! definitions and connector configurations. Two point lookups, both
//! returning zero or one row:
//!
//! - `queries(id)` → stored query text plus its connector reference
//! - `connectors(id)` → backend type tag plus the opaque config blob

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// User-Agent string identifying gateway requests
const USER_AGENT: &str = concat!("rilld/", env!("CARGO_PKG_VERSION"));

/// A stored query definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub id: String,
    pub connector_id: String,
    /// Template text with named placeholders
    pub content: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A stored connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: String,
    /// Backend type tag selecting the driver factory
    #[serde(rename = "type")]
    pub connector_type: String,
    /// Opaque blob interpreted only by the matching factory
    pub config: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Client for the metadata store REST endpoint.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MetadataStore {
    /// Create a store client for the given endpoint and service key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Store(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Fetch one stored query by id.
    pub async fn fetch_query(&self, query_id: &str) -> Result<QueryDefinition> {
        let rows: Vec<QueryDefinition> = self.select("queries", query_id).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::QueryNotFound(query_id.to_string()))
    }

    /// Fetch one connector configuration by id.
    pub async fn fetch_connector(&self, connector_id: &str) -> Result<ConnectorRecord> {
        let rows: Vec<ConnectorRecord> = self.select("connectors", connector_id).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::ConnectorNotFound(connector_id.to_string()))
    }

    async fn select<T: serde::de::DeserializeOwned>(&self, table: &str, id: &str) -> Result<Vec<T>> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let response = self
            .client
            .get(&url)
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())])
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| Error::Store(format!("{table} lookup failed: {e}")))?;

        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| Error::Store(format!("{table} response malformed: {e}"))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Store(format!(
                    "{table} lookup returned {status}: {body}"
                )))
            }
        }
    }
}
