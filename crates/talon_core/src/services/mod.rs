//! Backend services for the Talon client layer.
//!
//! - `credentials` - active auth method, persisted through the OS keychain or a file
//! - `identity` - client certificate identity for mutual TLS
//! - `dispatcher` - authenticated HTTP requests with retry and backoff
//! - `events` - push-event stream with heartbeat and reconnection
//! - `bridge` - queries through the command-line client subprocess
//! - `api_config` - certificate extraction from server-generated config files

pub mod api_config;
pub mod bridge;
pub mod credentials;
pub mod dispatcher;
pub mod events;
pub mod identity;

pub use api_config::{extract_certificates, ApiClientConfig};
pub use bridge::{LineBuffer, RowStream, SubprocessBridge};
pub use credentials::{CredentialStore, CredentialsProvider};
pub use dispatcher::RequestDispatcher;
pub use events::EventStreamClient;
pub use identity::ClientIdentity;
