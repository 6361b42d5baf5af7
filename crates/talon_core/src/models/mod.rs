//! Data models for the Talon client layer.
//!
//! - `auth` - AuthMethod, Credentials, CertificateBundle
//! - `connection` - ConnectionState, StreamState
//! - `endpoint` - the remote operation catalog
//! - `event` - event stream envelopes and typed events
//! - `query` - QueryHandle for cancellable queries
//! - `row` - dynamically typed query rows
//! - `server` - generic server response shapes
//! - `timestamp` - lenient timestamp decoding

pub mod auth;
pub mod connection;
pub mod endpoint;
pub mod event;
pub mod query;
pub mod row;
pub mod server;
pub mod timestamp;

pub use auth::{AuthMethod, CertificateBundle, Credentials};
pub use connection::{ConnectionState, StreamState};
pub use endpoint::Endpoint;
pub use event::{
    ActivityRecord, ClientPresence, DecodedEvent, EventEnvelope, FlowCompleted, FlowProgress,
    HuntCompleted, HuntProgress, Notification, ServerEvent, StreamError,
};
pub use query::QueryHandle;
pub use row::{RowDecoder, StreamingRow, Value};
pub use server::{QueryRequest, QueryResponse, ServerInfo};
