//! Authentication models: auth methods, credentials and certificate bundles.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How outbound requests and the event-stream handshake authenticate.
///
/// Exactly one method is active per configured session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Bearer token sent as `Authorization: Bearer <token>`.
    ApiKey {
        /// The API token.
        token: String,
    },
    /// HTTP basic credentials.
    BasicAuth {
        /// Login username.
        username: String,
        /// Login password.
        password: String,
    },
    /// Mutual TLS using a client certificate and private key on disk.
    MutualTls {
        /// PEM or DER client certificate.
        certificate_path: PathBuf,
        /// PEM or DER private key.
        key_path: PathBuf,
        /// Optional CA certificate used to verify a self-signed server.
        ca_path: Option<PathBuf>,
    },
}

impl AuthMethod {
    /// Create an API key method.
    pub fn api_key(token: impl Into<String>) -> Self {
        Self::ApiKey { token: token.into() }
    }

    /// Create a basic-auth method.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicAuth { username: username.into(), password: password.into() }
    }

    /// Create an mTLS method without a custom CA.
    pub fn mutual_tls(certificate_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self::MutualTls {
            certificate_path: certificate_path.into(),
            key_path: key_path.into(),
            ca_path: None,
        }
    }

    /// Attach a CA certificate to an mTLS method. No-op for other methods.
    pub fn with_ca(mut self, path: impl Into<PathBuf>) -> Self {
        if let Self::MutualTls { ca_path, .. } = &mut self {
            *ca_path = Some(path.into());
        }
        self
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "api_key",
            Self::BasicAuth { .. } => "basic_auth",
            Self::MutualTls { .. } => "mtls",
        }
    }

    /// Whether this method authenticates at the transport layer.
    pub fn is_mutual_tls(&self) -> bool {
        matches!(self, Self::MutualTls { .. })
    }

    /// Value for the `Authorization` header, or `None` for mTLS.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Self::ApiKey { token } => Some(format!("Bearer {token}")),
            Self::BasicAuth { username, password } => {
                Some(format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))))
            }
            Self::MutualTls { .. } => None,
        }
    }
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { .. } => f.debug_struct("ApiKey").field("token", &"<redacted>").finish(),
            Self::BasicAuth { username, .. } => f
                .debug_struct("BasicAuth")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::MutualTls { certificate_path, key_path, ca_path } => f
                .debug_struct("MutualTls")
                .field("certificate_path", certificate_path)
                .field("key_path", key_path)
                .field("ca_path", ca_path)
                .finish(),
        }
    }
}

/// The active auth method plus the server it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Base URL of the server, e.g. `https://dfir.example.com:8889`.
    pub server_url: String,
    /// The active auth method.
    pub method: AuthMethod,
}

impl Credentials {
    /// Create a credential set.
    pub fn new(server_url: impl Into<String>, method: AuthMethod) -> Self {
        Self { server_url: server_url.into(), method }
    }
}

/// Client certificate material recovered from a server-generated config file.
///
/// Bundles are immutable; renewal replaces the whole bundle.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    client_certificate: String,
    private_key: String,
    ca_certificate: String,
    common_name: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CertificateBundle {
    /// Create a bundle from PEM texts and a subject common name.
    pub fn new(
        client_certificate: impl Into<String>,
        private_key: impl Into<String>,
        ca_certificate: impl Into<String>,
        common_name: impl Into<String>,
    ) -> Self {
        Self {
            client_certificate: client_certificate.into(),
            private_key: private_key.into(),
            ca_certificate: ca_certificate.into(),
            common_name: common_name.into(),
            expires_at: None,
        }
    }

    /// Return a copy carrying an expiry time.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Client certificate PEM.
    pub fn client_certificate(&self) -> &str {
        &self.client_certificate
    }

    /// Client private key PEM.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// CA certificate PEM.
    pub fn ca_certificate(&self) -> &str {
        &self.ca_certificate
    }

    /// Subject common name of the client certificate.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Expiry time, if known.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// True when no expiry is set or the expiry is in the future.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Validity relative to an explicit instant.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("common_name", &self.common_name)
            .field("expires_at", &self.expires_at)
            .field("private_key", &"<redacted>")
            .finish()
    }
}
