//! Core client layer for the Talon forensics console.
//!
//! This crate talks to a remote forensics server on behalf of the console UI:
//!
//! - **error**: Error taxonomy shared by every component
//! - **config**: File and environment configuration
//! - **models**: Auth methods, endpoints, events, rows, and connection states
//! - **services**: Credential store, request dispatcher, event stream, query bridge
//! - **state**: Session object wiring the services together
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

mod verification_tests;

pub use config::TalonConfig;
pub use error::{CredentialError, TalonError};
pub use models::{
    ActivityRecord, AuthMethod, CertificateBundle, ConnectionState, Credentials, Endpoint,
    QueryHandle, ServerEvent, ServerInfo, StreamState, StreamingRow, Value,
};
pub use services::{
    ClientIdentity, CredentialStore, EventStreamClient, RequestDispatcher, RowStream,
    SubprocessBridge,
};
pub use state::TalonState;
