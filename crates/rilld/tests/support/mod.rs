//! Shared fixtures for gateway end-to-end tests
//!
//! Provides an in-memory driver registered as the `mock` backend type, a
//! minimal metadata-store server speaking just enough PostgREST, and a thin
//! WebSocket client for driving the gateway's wire protocol.

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rill_driver::{Driver, Error as DriverError, RowStream, StreamFrame, Value};
use rilld::{Gateway, GatewayConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock driver
// ============================================================================

/// What a mock driver instance observed, keyed by the config's `label`.
#[derive(Debug, Default, Clone)]
pub struct MockCapture {
    pub connects: usize,
    pub closes: usize,
    pub stream_closes: usize,
    pub last_sql: Option<String>,
}

static CAPTURES: Lazy<Mutex<HashMap<String, MockCapture>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Read back what the driver with this label observed.
pub fn capture(label: &str) -> MockCapture {
    CAPTURES.lock().get(label).cloned().unwrap_or_default()
}

fn record<F: FnOnce(&mut MockCapture)>(label: &str, update: F) {
    update(CAPTURES.lock().entry(label.to_string()).or_default());
}

#[derive(Debug, Clone, Deserialize)]
struct MockConfig {
    /// Key into the capture map for post-hoc assertions
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
    /// Delay before each row, for cancellation and backpressure tests
    #[serde(default)]
    row_delay_ms: u64,
    #[serde(default)]
    fail_connect: bool,
    #[serde(default)]
    fail_query: Option<String>,
}

struct MockDriver {
    config: MockConfig,
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&mut self) -> rill_driver::Result<()> {
        if let Some(label) = &self.config.label {
            record(label, |c| c.connects += 1);
        }
        if self.config.fail_connect {
            return Err(DriverError::connect("mock connect failure"));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> rill_driver::Result<Box<dyn RowStream>> {
        if let Some(label) = &self.config.label {
            record(label, |c| c.last_sql = Some(sql.to_string()));
        }
        if let Some(message) = &self.config.fail_query {
            return Err(DriverError::query(message.clone()));
        }

        let rows = self
            .config
            .rows
            .iter()
            .map(|row| row.iter().map(json_to_value).collect())
            .collect();

        Ok(Box::new(MockStream {
            label: self.config.label.clone(),
            columns: self.config.columns.clone(),
            rows,
            row_delay: Duration::from_millis(self.config.row_delay_ms),
            header_sent: false,
            next_row: 0,
            closed: false,
        }))
    }

    async fn close(&mut self) -> rill_driver::Result<()> {
        if let Some(label) = &self.config.label {
            record(label, |c| c.closes += 1);
        }
        Ok(())
    }
}

struct MockStream {
    label: Option<String>,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    row_delay: Duration,
    header_sent: bool,
    next_row: usize,
    closed: bool,
}

#[async_trait]
impl RowStream for MockStream {
    async fn next_frame(&mut self) -> rill_driver::Result<Option<StreamFrame>> {
        if self.closed {
            return Ok(None);
        }
        if !self.header_sent {
            self.header_sent = true;
            return Ok(Some(StreamFrame::Header(self.columns.clone())));
        }
        if self.next_row >= self.rows.len() {
            return Ok(None);
        }
        if !self.row_delay.is_zero() {
            tokio::time::sleep(self.row_delay).await;
        }
        let row = self.rows[self.next_row].clone();
        self.next_row += 1;
        Ok(Some(StreamFrame::Row(row)))
    }

    async fn close(&mut self) -> rill_driver::Result<()> {
        if !self.closed {
            if let Some(label) = &self.label {
                record(label, |c| c.stream_closes += 1);
            }
        }
        self.closed = true;
        Ok(())
    }
}

fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or(0.0))),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

/// Register the mock backend type exactly once per process.
pub fn register_mock_driver() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        rill_driver::registry::register(
            "mock",
            Arc::new(|config| {
                let config: MockConfig = serde_json::from_value(config.clone())
                    .map_err(|e| DriverError::config(e.to_string()))?;
                Ok(Box::new(MockDriver { config }) as Box<dyn Driver>)
            }),
        );
    });
}

// ============================================================================
// Mock metadata store (PostgREST shape)
// ============================================================================

type StoreRows = Arc<(Vec<serde_json::Value>, Vec<serde_json::Value>)>;

async fn table_lookup(
    rows: &[serde_json::Value],
    params: &HashMap<String, String>,
) -> Json<Vec<serde_json::Value>> {
    let id = params
        .get("id")
        .and_then(|v| v.strip_prefix("eq."))
        .unwrap_or("");
    Json(
        rows.iter()
            .filter(|row| row["id"] == id)
            .cloned()
            .collect(),
    )
}

async fn queries_handler(
    State(state): State<StoreRows>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<serde_json::Value>> {
    table_lookup(&state.0, &params).await
}

async fn connectors_handler(
    State(state): State<StoreRows>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<serde_json::Value>> {
    table_lookup(&state.1, &params).await
}

/// Spawn a metadata store serving the given query and connector rows.
/// Returns its base URL.
pub async fn spawn_meta_store(
    queries: Vec<serde_json::Value>,
    connectors: Vec<serde_json::Value>,
) -> String {
    let state: StoreRows = Arc::new((queries, connectors));
    let app = Router::new()
        .route("/rest/v1/queries", get(queries_handler))
        .route("/rest/v1/connectors", get(connectors_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

// ============================================================================
// Gateway fixture
// ============================================================================

pub struct TestGateway {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestGateway {
    /// Bind and serve a gateway against the given metadata store.
    pub async fn start(meta_url: &str, max_workers: usize, queue_capacity: usize) -> Self {
        register_mock_driver();

        let config = GatewayConfig {
            supabase_url: meta_url.to_string(),
            supabase_key: "test-key".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            max_workers,
            queue_capacity,
            ..Default::default()
        };

        let gateway = Gateway::bind(config).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        let shutdown = gateway.shutdown_token();
        tokio::spawn(gateway.serve());

        Self { addr, shutdown }
    }

    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// WebSocket client
// ============================================================================

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket connect failed");
        Self { stream }
    }

    pub async fn send_json(&mut self, frame: serde_json::Value) {
        self.stream
            .send(Message::Text(frame.to_string()))
            .await
            .expect("websocket send failed");
    }

    pub async fn submit(&mut self, stream_id: &str, query_id: &str, template_data: serde_json::Value) {
        self.send_json(serde_json::json!({
            "type": "query",
            "streamId": stream_id,
            "queryId": query_id,
            "templateData": template_data,
        }))
        .await;
    }

    pub async fn cancel(&mut self, stream_id: &str) {
        self.send_json(serde_json::json!({"type": "cancel", "streamId": stream_id}))
            .await;
    }

    /// Next JSON frame, skipping transport-level ping/pong.
    pub async fn recv_frame(&mut self) -> serde_json::Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed while waiting for frame")
                .expect("websocket read failed");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    /// Wait until the server closes the transport, draining any frames
    /// still in flight.
    pub async fn expect_close(&mut self) {
        let deadline = Duration::from_secs(5);
        loop {
            match tokio::time::timeout(deadline, self.stream.next())
                .await
                .expect("timed out waiting for transport close")
            {
                None | Some(Err(_)) => return,
                Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Collect frames for one stream until its terminal frame, collecting
    /// (and returning) any interleaved frames for other streams too.
    pub async fn collect_stream(&mut self, stream_id: &str) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv_frame().await;
            let done = frame["streamId"] == stream_id && is_terminal(&frame);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

/// Whether this frame ends its stream: `complete`, terminal `status`, or an
/// admission error.
pub fn is_terminal(frame: &serde_json::Value) -> bool {
    match frame["type"].as_str() {
        Some("status") => matches!(
            frame["payload"]["status"].as_str(),
            Some("completed") | Some("failed") | Some("cancelled")
        ),
        _ => false,
    }
}

/// Frames belonging to one stream, in arrival order.
pub fn frames_for<'a>(
    frames: &'a [serde_json::Value],
    stream_id: &str,
) -> Vec<&'a serde_json::Value> {
    frames
        .iter()
        .filter(|f| f["streamId"] == stream_id)
        .collect()
}

/// Compact shape of a frame for order assertions: `status:running`,
/// `metadata`, `row`, `complete`, `error`.
pub fn shape(frame: &serde_json::Value) -> String {
    match frame["type"].as_str().unwrap() {
        "status" => format!("status:{}", frame["payload"]["status"].as_str().unwrap()),
        other => other.to_string(),
    }
}

/// Assert one stream's frame sequence matches
/// `status:queued · status:running · metadata? · row* · terminal`.
pub fn assert_stream_order(frames: &[&serde_json::Value]) {
    let shapes: Vec<String> = frames.iter().map(|f| shape(f)).collect();
    assert!(
        shapes.len() >= 3,
        "stream ended before reaching a terminal state: {shapes:?}"
    );
    assert_eq!(shapes[0], "status:queued", "sequence: {shapes:?}");
    assert_eq!(shapes[1], "status:running", "sequence: {shapes:?}");

    let mut idx = 2;
    if shapes[idx] == "metadata" {
        idx += 1;
    }
    while idx < shapes.len() && shapes[idx] == "row" {
        idx += 1;
    }

    let tail: Vec<&str> = shapes[idx..].iter().map(String::as_str).collect();
    assert!(
        matches!(
            tail.as_slice(),
            ["complete", "status:completed"] | ["error", "status:failed"] | ["status:cancelled"]
        ),
        "unexpected terminal sequence {tail:?} in {shapes:?}"
    );
}
