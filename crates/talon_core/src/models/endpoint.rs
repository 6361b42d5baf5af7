//! The closed catalog of remote operations the dispatcher can call.

use reqwest::Method;

/// One remote operation: logical name, path template and HTTP verb.
///
/// Path parameters travel inside the variant, so every endpoint is fully described
/// at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Server version and build information.
    ServerInfo,
    /// Search or list enrolled clients.
    ListClients,
    /// A single client's metadata.
    GetClient {
        /// Client identifier (e.g. `C.1234abcd`).
        client_id: String,
    },
    /// Collection flows for one client.
    ListFlows {
        /// Client identifier.
        client_id: String,
    },
    /// One flow's details.
    GetFlow {
        /// Client identifier.
        client_id: String,
        /// Flow identifier (e.g. `F.ABC123`).
        flow_id: String,
    },
    /// Cancel a running flow.
    CancelFlow {
        /// Client identifier.
        client_id: String,
        /// Flow identifier.
        flow_id: String,
    },
    /// Schedule an artifact collection on a client.
    CollectArtifact {
        /// Client identifier.
        client_id: String,
    },
    /// List hunts.
    ListHunts,
    /// One hunt's details.
    GetHunt {
        /// Hunt identifier (e.g. `H.1`).
        hunt_id: String,
    },
    /// Create a hunt.
    CreateHunt,
    /// Start, pause or stop a hunt.
    ModifyHunt {
        /// Hunt identifier.
        hunt_id: String,
    },
    /// List artifact definitions.
    ListArtifacts,
    /// Run a server-side query.
    Query,
}

impl Endpoint {
    /// Logical name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServerInfo => "server_info",
            Self::ListClients => "list_clients",
            Self::GetClient { .. } => "get_client",
            Self::ListFlows { .. } => "list_flows",
            Self::GetFlow { .. } => "get_flow",
            Self::CancelFlow { .. } => "cancel_flow",
            Self::CollectArtifact { .. } => "collect_artifact",
            Self::ListHunts => "list_hunts",
            Self::GetHunt { .. } => "get_hunt",
            Self::CreateHunt => "create_hunt",
            Self::ModifyHunt { .. } => "modify_hunt",
            Self::ListArtifacts => "list_artifacts",
            Self::Query => "query",
        }
    }

    /// Path template with `{param}` placeholders.
    pub fn template(&self) -> &'static str {
        match self {
            Self::ServerInfo => "/api/v1/GetServerInfo",
            Self::ListClients => "/api/v1/SearchClients",
            Self::GetClient { .. } => "/api/v1/GetClient/{client_id}",
            Self::ListFlows { .. } => "/api/v1/GetClientFlows/{client_id}",
            Self::GetFlow { .. } => "/api/v1/GetFlowDetails/{client_id}/{flow_id}",
            Self::CancelFlow { .. } => "/api/v1/CancelFlow/{client_id}/{flow_id}",
            Self::CollectArtifact { .. } => "/api/v1/CollectArtifact/{client_id}",
            Self::ListHunts => "/api/v1/ListHunts",
            Self::GetHunt { .. } => "/api/v1/GetHunt/{hunt_id}",
            Self::CreateHunt => "/api/v1/CreateHunt",
            Self::ModifyHunt { .. } => "/api/v1/ModifyHunt/{hunt_id}",
            Self::ListArtifacts => "/api/v1/GetArtifacts",
            Self::Query => "/api/v1/Query",
        }
    }

    /// HTTP verb.
    pub fn method(&self) -> Method {
        match self {
            Self::CancelFlow { .. }
            | Self::CollectArtifact { .. }
            | Self::CreateHunt
            | Self::ModifyHunt { .. }
            | Self::Query => Method::POST,
            _ => Method::GET,
        }
    }

    /// Resolved request path with percent-encoded parameters substituted.
    pub fn path(&self) -> String {
        let mut path = self.template().to_string();
        for (name, value) in self.path_params() {
            path = path.replace(&format!("{{{name}}}"), &urlencoding::encode(value));
        }
        path
    }

    fn path_params(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::GetClient { client_id }
            | Self::ListFlows { client_id }
            | Self::CollectArtifact { client_id } => vec![("client_id", client_id.as_str())],
            Self::GetFlow { client_id, flow_id } | Self::CancelFlow { client_id, flow_id } => {
                vec![("client_id", client_id.as_str()), ("flow_id", flow_id.as_str())]
            }
            Self::GetHunt { hunt_id } | Self::ModifyHunt { hunt_id } => {
                vec![("hunt_id", hunt_id.as_str())]
            }
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}
