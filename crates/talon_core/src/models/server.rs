//! Generic response shapes parsed by the client layer.
//!
//! Only what the transport needs to understand lives here; domain objects such as
//! clients, hunts and flows are returned to callers as raw JSON values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::row::{RowDecoder, StreamingRow};
use super::timestamp::flexible_option;

/// Server version and build information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server version string
    pub version: String,
    /// Product or deployment name
    #[serde(default)]
    pub name: Option<String>,
    /// Build timestamp, in any supported encoding
    #[serde(default, with = "flexible_option")]
    pub build_time: Option<DateTime<Utc>>,
    /// Server-side time at the moment of the call
    #[serde(default, with = "flexible_option")]
    pub server_time: Option<DateTime<Utc>>,
}

/// Body of a server-side query request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Query text
    pub query: String,
    /// Row limit applied by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u64>,
    /// Per-query timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl QueryRequest {
    /// Create a request with server defaults.
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), max_rows: None, timeout_secs: None }
    }

    /// Limit the number of returned rows.
    pub fn with_max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// Server-side query result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Column names as reported by the server; may be empty
    #[serde(default)]
    pub columns: Vec<String>,
    /// One JSON object per row
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
    /// Total row count if the server truncated the result
    #[serde(default)]
    pub total_rows: Option<u64>,
}

impl QueryResponse {
    /// Decode the rows with the same column-fixing rules the subprocess bridge uses.
    ///
    /// The final element is always the end-of-stream marker.
    pub fn into_rows(self) -> Vec<StreamingRow> {
        let mut decoder = RowDecoder::new();
        let mut rows: Vec<StreamingRow> =
            self.rows.into_iter().filter_map(|row| decoder.decode_value(row)).collect();
        rows.push(decoder.finish());
        rows
    }
}
