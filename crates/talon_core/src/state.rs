//! Session state.
//!
//! Owns one instance of each service and the shared credential store they read from.
//! Thread-safe via `parking_lot::RwLock`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::select;
use uuid::Uuid;

use crate::config::TalonConfig;
use crate::error::Result;
use crate::models::{AuthMethod, ConnectionState, Credentials, QueryHandle, ServerInfo};
use crate::services::{
    CredentialStore, EventStreamClient, RequestDispatcher, RowStream, SubprocessBridge,
};

/// Central session state.
///
/// All services share one [`CredentialStore`]; reconfiguring it affects the next request,
/// handshake, or subprocess launch of every service.
pub struct TalonState {
    config: TalonConfig,
    credentials: Arc<CredentialStore>,
    dispatcher: RequestDispatcher,
    events: EventStreamClient,
    bridge: SubprocessBridge,
    /// Overall session state
    connection: RwLock<ConnectionState>,
    /// Result of the last successful probe
    server_info: RwLock<Option<ServerInfo>>,
    /// Running bridge queries with cancellation support
    active_queries: Arc<RwLock<HashMap<Uuid, QueryHandle>>>,
}

impl TalonState {
    /// Create session state backed by the platform credential provider.
    pub fn new(config: TalonConfig) -> Self {
        Self::with_credentials(config, Arc::new(CredentialStore::new()))
    }

    /// Create session state around an existing credential store (for testing).
    pub fn with_credentials(config: TalonConfig, credentials: Arc<CredentialStore>) -> Self {
        let dispatcher =
            RequestDispatcher::new(Arc::clone(&credentials), config.dispatcher.clone());
        let events = EventStreamClient::new(Arc::clone(&credentials), config.stream.clone());
        let bridge = SubprocessBridge::new(config.bridge.clone());

        tracing::info!(
            provider = credentials.provider_name(),
            configured = credentials.is_configured(),
            "TalonState initialized"
        );

        Self {
            config,
            credentials,
            dispatcher,
            events,
            bridge,
            connection: RwLock::new(ConnectionState::Disconnected),
            server_info: RwLock::new(None),
            active_queries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ========== Connection Management ==========

    /// Current session state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.read().clone()
    }

    /// Server information from the last successful connect.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    fn set_connection_state(&self, next: ConnectionState) {
        let mut state = self.connection.write();
        tracing::debug!(from = ?*state, to = ?next, "Connection state change");
        *state = next;
    }

    /// Store a new auth method. Takes effect on the next request of every service.
    pub fn configure(&self, server_url: &str, method: AuthMethod) -> Result<Credentials> {
        self.credentials.configure(server_url, method)
    }

    /// Probe the server with the active credentials.
    ///
    /// Lands in `Connected` on success and `Error` otherwise.
    pub async fn connect(&self) -> Result<ServerInfo> {
        self.set_connection_state(ConnectionState::Connecting);

        match self.dispatcher.server_info().await {
            Ok(info) => {
                tracing::info!(version = %info.version, "Connected to server");
                *self.server_info.write() = Some(info.clone());
                self.set_connection_state(ConnectionState::Connected);
                Ok(info)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connection probe failed");
                self.set_connection_state(ConnectionState::error(e.to_string()));
                Err(e)
            }
        }
    }

    /// End the session: close the event stream and cancel running queries.
    pub async fn disconnect(&self) {
        self.events.disconnect().await;
        for handle in self.active_queries.read().values() {
            handle.cancel();
        }
        *self.server_info.write() = None;
        self.set_connection_state(ConnectionState::Disconnected);
    }

    // ========== Query Tracking ==========

    /// Start a streaming bridge query and track it until its subprocess exits or the
    /// query is cancelled.
    pub fn stream_query(&self, query: &str) -> Result<(QueryHandle, RowStream)> {
        let stream = self.bridge.execute_streaming(query)?;
        let handle = self.register_query(QueryHandle::new(query));

        let watcher = handle.clone();
        let stream_token = stream.cancel_token();
        let completed = stream.completion_token();
        let queries = Arc::clone(&self.active_queries);
        tokio::spawn(async move {
            select! {
                _ = watcher.cancelled() => stream_token.cancel(),
                _ = completed.cancelled() => {}
            }
            if queries.write().remove(&watcher.id()).is_some() {
                tracing::trace!(query_id = %watcher.id(), "Query unregistered");
            }
        });

        Ok((handle, stream))
    }

    /// Register a query for tracking.
    pub fn register_query(&self, handle: QueryHandle) -> QueryHandle {
        let id = handle.id();
        self.active_queries.write().insert(id, handle.clone());
        tracing::trace!(query_id = %id, "Query registered");
        handle
    }

    /// Get a query handle by ID.
    pub fn get_query(&self, id: &Uuid) -> Option<QueryHandle> {
        self.active_queries.read().get(id).cloned()
    }

    /// Cancel a running query.
    ///
    /// Returns true if the query was found and cancellation was requested.
    pub fn cancel_query(&self, id: &Uuid) -> bool {
        if let Some(handle) = self.active_queries.read().get(id) {
            handle.cancel();
            true
        } else {
            false
        }
    }

    /// Get all active query IDs.
    pub fn active_query_ids(&self) -> Vec<Uuid> {
        self.active_queries.read().keys().copied().collect()
    }

    // ========== Service Accessors ==========

    pub fn config(&self) -> &TalonConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &EventStreamClient {
        &self.events
    }

    pub fn bridge(&self) -> &SubprocessBridge {
        &self.bridge
    }
}

impl std::fmt::Debug for TalonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TalonState")
            .field("connection", &self.connection_state())
            .field("events", &self.events)
            .field("active_queries", &self.active_query_ids().len())
            .finish()
    }
}
