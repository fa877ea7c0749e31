//! Query resolution
//!
//! Turns `(queryId, templateData)` into a live streaming handle: fetch the
//! stored query, render its template, fetch the connector it references,
//! build the matching driver, connect, execute. Stateless and safe to invoke
//! concurrently; its only side effects are two metadata reads and the
//! backend session it opens.

use crate::error::Result;
use crate::store::MetadataStore;
use crate::template;
use rill_driver::{registry, Driver, RowStream};
use tracing::debug;

/// A live query stream together with the driver that owns its backend
/// session. The caller owns the handle and must close it on every path.
pub struct QueryHandle {
    stream: Option<Box<dyn RowStream>>,
    driver: Option<Box<dyn Driver>>,
}

impl QueryHandle {
    /// The row stream. Panics if called after `close`.
    pub fn stream(&mut self) -> &mut dyn RowStream {
        self.stream
            .as_mut()
            .expect("query handle used after close")
            .as_mut()
    }

    /// Close the stream first, then the driver. Idempotent; errors during
    /// teardown are logged, not propagated.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close().await {
                debug!("stream close failed: {}", e);
            }
        }
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                debug!("driver close failed: {}", e);
            }
        }
    }
}

/// Stateless resolver over one metadata store.
#[derive(Debug, Clone)]
pub struct Resolver {
    store: MetadataStore,
}

impl Resolver {
    /// Create a resolver backed by the given metadata store.
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// Resolve and start one query execution.
    pub async fn resolve(
        &self,
        query_id: &str,
        template_data: &serde_json::Value,
    ) -> Result<QueryHandle> {
        let query = self.store.fetch_query(query_id).await?;
        let rendered = template::render(&query.content, template_data)?;
        let connector = self.store.fetch_connector(&query.connector_id).await?;

        debug!(
            query_id = %query_id,
            connector_type = %connector.connector_type,
            "resolved query"
        );

        let mut driver = registry::build(&connector.connector_type, &connector.config)?;

        if let Err(e) = driver.connect().await {
            let _ = driver.close().await;
            return Err(e.into());
        }

        let stream = match driver.query(&rendered).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = driver.close().await;
                return Err(e.into());
            }
        };

        Ok(QueryHandle {
            stream: Some(stream),
            driver: Some(driver),
        })
    }
}
