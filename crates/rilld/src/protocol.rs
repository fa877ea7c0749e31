//! Wire protocol
//!
//! UTF-8 JSON, one object per transport message. The inbound schema is
//! closed: `query` admits a new stream, `cancel` targets a running one.
//! Outbound frames carry `{type, streamId, payload?}` with the closed set
//! `status | metadata | row | complete | error`.

use rill_driver::Value;
use serde::{Deserialize, Serialize};

/// Inbound frame from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Admit a new stream
    #[serde(rename_all = "camelCase")]
    Query {
        stream_id: String,
        query_id: String,
        #[serde(default = "empty_object")]
        template_data: serde_json::Value,
    },
    /// Cancel a stream by id
    #[serde(rename_all = "camelCase")]
    Cancel { stream_id: String },
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A frame that could not be decoded.
///
/// When the raw JSON still carried a usable `streamId` the violation is
/// recoverable: the peer gets an error frame and the transport stays open.
/// Without one the transport closes.
#[derive(Debug)]
pub struct ProtocolViolation {
    pub stream_id: Option<String>,
    pub message: String,
}

/// Decode one inbound text frame, salvaging the stream id on failure.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolViolation> {
    let raw: serde_json::Value = serde_json::from_str(text).map_err(|e| ProtocolViolation {
        stream_id: None,
        message: format!("malformed frame: {e}"),
    })?;

    let stream_id = raw
        .get("streamId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned);

    serde_json::from_value(raw).map_err(|e| ProtocolViolation {
        stream_id,
        message: format!("invalid frame: {e}"),
    })
}

/// Lifecycle state of one stream, reported via `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Outbound frame kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Status,
    Metadata,
    Row,
    Complete,
    Error,
}

/// Result-set metadata, sent exactly once before any row.
///
/// `total_rows` is not known at header time and is always reported as 0
/// here; the count on the `complete` frame is authoritative.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetadata {
    pub columns: Vec<String>,
    #[serde(rename = "totalRows")]
    pub total_rows: u64,
}

/// Outbound frame payload, shaped per frame kind.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FramePayload {
    Status {
        status: StreamStatus,
    },
    Metadata {
        metadata: QueryMetadata,
    },
    Row {
        data: Vec<Value>,
    },
    Complete {
        #[serde(rename = "totalRows")]
        total_rows: u64,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

/// One outbound frame.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<FramePayload>,
}

impl ServerFrame {
    pub fn status(stream_id: impl Into<String>, status: StreamStatus) -> Self {
        Self {
            kind: FrameKind::Status,
            stream_id: stream_id.into(),
            payload: Some(FramePayload::Status { status }),
        }
    }

    pub fn metadata(stream_id: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            kind: FrameKind::Metadata,
            stream_id: stream_id.into(),
            payload: Some(FramePayload::Metadata {
                metadata: QueryMetadata {
                    columns,
                    total_rows: 0,
                },
            }),
        }
    }

    pub fn row(stream_id: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            kind: FrameKind::Row,
            stream_id: stream_id.into(),
            payload: Some(FramePayload::Row { data }),
        }
    }

    pub fn complete(stream_id: impl Into<String>, total_rows: u64) -> Self {
        Self {
            kind: FrameKind::Complete,
            stream_id: stream_id.into(),
            payload: Some(FramePayload::Complete { total_rows }),
        }
    }

    pub fn error(
        stream_id: impl Into<String>,
        error: impl Into<String>,
        code: Option<&str>,
    ) -> Self {
        Self {
            kind: FrameKind::Error,
            stream_id: stream_id.into(),
            payload: Some(FramePayload::Error {
                error: error.into(),
                code: code.map(str::to_owned),
            }),
        }
    }
}
