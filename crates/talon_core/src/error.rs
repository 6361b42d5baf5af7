//! Error types for the Talon client layer.
//!
//! Every component surfaces failures as a [`TalonError`]. The variants follow the
//! taxonomy the UI layer relies on to decide between retrying, re-prompting for
//! credentials, or showing a diagnostic.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = TalonError> = std::result::Result<T, E>;

/// Problems with locally configured credential material.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// A certificate or key path referenced by the auth method does not exist.
    #[error("credential file not found: {}", path.display())]
    FileNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// Persisted credentials are missing fields required by their method.
    #[error("stored credentials are incomplete: missing {missing}")]
    Incomplete {
        /// Name of the first missing account.
        missing: &'static str,
    },

    /// The server URL could not be parsed or uses an unsupported scheme.
    #[error("invalid server URL: {url}")]
    InvalidServerUrl {
        /// The rejected URL text.
        url: String,
    },
}

/// Main error type for Talon.
#[derive(Debug, Error)]
pub enum TalonError {
    /// An operation needed credentials before any were configured.
    #[error("Not configured: {message}")]
    NotConfigured {
        /// Human-readable error message.
        message: String,
    },

    /// The server rejected the credential (HTTP 401).
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Human-readable error message.
        message: String,
    },

    /// The credential was recognized but not permitted (HTTP 403).
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        /// Human-readable error message.
        message: String,
    },

    /// The requested resource does not exist (HTTP 404).
    #[error("Not found: {path}")]
    NotFound {
        /// Request path that produced the 404.
        path: String,
    },

    /// The server is throttling this client (HTTP 429).
    #[error("Rate limited")]
    RateLimited {
        /// Seconds from a `Retry-After` header, if present.
        retry_after_secs: Option<u64>,
    },

    /// Non-success response not covered by a more specific variant.
    #[error("Server error {code}: {body}")]
    Server {
        /// HTTP status code.
        code: u16,
        /// Response body text (possibly empty).
        body: String,
    },

    /// Transport-level failure (DNS, connect, reset, TLS handshake).
    #[error("Network error: {message}")]
    Network {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection setup or response body exceeded its deadline.
    #[error("Timeout: {message}")]
    Timeout {
        /// Human-readable error message.
        message: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// A response or frame could not be decoded into the expected shape.
    #[error("Decoding error: {message}")]
    Decoding {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local credential configuration problem.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Certificate or key material could not be turned into a client identity.
    #[error("Identity error: {message}")]
    Identity {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The subprocess exited unsuccessfully or could not be launched.
    #[error("Process error (exit code {}): {stderr}", exit_code_label(.exit_code))]
    Process {
        /// Exit code, `None` when killed by a signal or never started.
        exit_code: Option<i32>,
        /// Captured diagnostic output.
        stderr: String,
    },

    /// A server-generated configuration file lacked required certificate fields.
    #[error("Certificate extraction failed: {message}")]
    CertificateExtractionFailed {
        /// Human-readable error message.
        message: String,
    },

    /// A frame was sent on the event stream while it was not connected.
    #[error("Event stream is not connected")]
    NotConnected,

    /// OS keychain error.
    #[error("Keyring error: {message}")]
    Keyring {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Local file storage error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

impl TalonError {
    // ========== Constructors ==========

    /// Create a not-configured error.
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::NotConfigured { message: message.into() }
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// Create an authentication-failed error.
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: message.into() }
    }

    /// Create a server error from a status code and body.
    pub fn server(code: u16, body: impl Into<String>) -> Self {
        Self::Server { code, body: body.into() }
    }

    /// Create a new network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into(), source: None }
    }

    /// Create a new network error with source.
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into() }
    }

    /// Create a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding { message: message.into(), source: None }
    }

    /// Create a decoding error with source.
    pub fn decoding_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Decoding { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create an identity error.
    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity { message: message.into(), source: None }
    }

    /// Create an identity error with source.
    pub fn identity_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Identity { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a process error.
    pub fn process(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::Process { exit_code, stderr: stderr.into() }
    }

    /// Create a certificate extraction error.
    pub fn certificate_extraction(message: impl Into<String>) -> Self {
        Self::CertificateExtractionFailed { message: message.into() }
    }

    /// Create a new keyring error.
    pub fn keyring(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Keyring { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Whether the request dispatcher may retry after this error.
    ///
    /// Only transient transport failures and 5xx responses qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Server { code, .. } => (500..=599).contains(code),
            _ => false,
        }
    }

    /// Check if this error represents a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if the server rejected the credential.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::AuthenticationFailed { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotConfigured { .. } => "Configuration",
            Self::Unauthorized { .. } | Self::AuthenticationFailed { .. } => "Authentication",
            Self::NotFound { .. } => "Not Found",
            Self::RateLimited { .. } => "Rate Limit",
            Self::Server { .. } => "Server",
            Self::Network { .. } | Self::Timeout { .. } | Self::NotConnected => "Network",
            Self::Cancelled => "Cancelled",
            Self::Decoding { .. } => "Protocol",
            Self::Credential(_) | Self::Identity { .. } => "Credential",
            Self::Process { .. } => "Process",
            Self::CertificateExtractionFailed { .. } => "Certificate",
            Self::Keyring { .. } => "Keyring",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::NotConfigured { .. } => Some("Configure a server URL and credentials first"),
            Self::Unauthorized { .. } => Some("Check the API key or username and password"),
            Self::AuthenticationFailed { .. } => {
                Some("The account lacks permission for this operation")
            }
            Self::NotFound { .. } => None,
            Self::RateLimited { .. } => Some("Wait a moment before trying again"),
            Self::Server { .. } => Some("Check the server logs"),
            Self::Network { .. } | Self::NotConnected => {
                Some("Check that the server is reachable")
            }
            Self::Timeout { .. } => Some("The server is slow to respond; try again"),
            Self::Cancelled => None,
            Self::Decoding { .. } => Some("The server version may be incompatible"),
            Self::Credential(CredentialError::FileNotFound { .. }) => {
                Some("Select an existing certificate and key file")
            }
            Self::Credential(_) => Some("Re-enter the connection settings"),
            Self::Identity { .. } => Some("Verify the certificate and private key match"),
            Self::Process { .. } => Some("Check the query text and the client executable"),
            Self::CertificateExtractionFailed { .. } => {
                Some("Regenerate the API client configuration on the server")
            }
            Self::Keyring { hint, .. } | Self::Storage { hint, .. } => hint.as_deref(),
            Self::Config { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Server { code, body } if !body.is_empty() => {
                Some(format!("Status: {code}\nBody: {body}"))
            }
            Self::Process { exit_code, stderr } => {
                let mut parts = Vec::new();
                if let Some(code) = exit_code {
                    parts.push(format!("Exit code: {code}"));
                }
                if !stderr.is_empty() {
                    parts.push(format!("Stderr: {stderr}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::RateLimited { retry_after_secs: Some(secs) } => {
                Some(format!("Retry after {secs} seconds"))
            }
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Network Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from reqwest::Error to TalonError.
impl From<reqwest::Error> for TalonError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return TalonError::timeout(err.to_string());
        }
        if err.is_decode() {
            return TalonError::decoding_with_source("Failed to decode response body", err);
        }
        TalonError::network_with_source(err.to_string(), err)
    }
}

/// Convert from tungstenite::Error to TalonError.
impl From<tokio_tungstenite::tungstenite::Error> for TalonError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        if let WsError::Http(response) = &err {
            match response.status().as_u16() {
                401 => return TalonError::unauthorized("Event stream handshake rejected"),
                403 => {
                    return TalonError::authentication_failed("Event stream handshake forbidden")
                }
                _ => {}
            }
        }
        TalonError::network_with_source(err.to_string(), err)
    }
}

/// Convert from native_tls::Error to TalonError.
impl From<native_tls::Error> for TalonError {
    fn from(err: native_tls::Error) -> Self {
        TalonError::identity_with_source(err.to_string(), err)
    }
}

/// Convert from std::io::Error to TalonError.
impl From<std::io::Error> for TalonError {
    fn from(err: std::io::Error) -> Self {
        TalonError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to TalonError.
impl From<serde_json::Error> for TalonError {
    fn from(err: serde_json::Error) -> Self {
        TalonError::decoding_with_source(format!("JSON error: {err}"), err)
    }
}

/// Convert from keyring::Error to TalonError.
impl From<keyring::Error> for TalonError {
    fn from(err: keyring::Error) -> Self {
        TalonError::Keyring {
            message: err.to_string(),
            hint: Some("Grant Talon access in system preferences".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TalonError::timeout("slow").is_retryable());
        assert!(TalonError::network("reset").is_retryable());
        assert!(TalonError::server(500, "").is_retryable());
        assert!(TalonError::server(503, "").is_retryable());

        assert!(!TalonError::server(418, "").is_retryable());
        assert!(!TalonError::unauthorized("no").is_retryable());
        assert!(!TalonError::authentication_failed("no").is_retryable());
        assert!(!TalonError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(!TalonError::Cancelled.is_retryable());
        assert!(!TalonError::decoding("bad").is_retryable());
        assert!(!TalonError::process(Some(1), "boom").is_retryable());
    }

    #[test]
    fn test_error_info_for_process_error() {
        let info = TalonError::process(Some(2), "syntax error near SELECT").to_error_info();
        assert_eq!(info.error_type, "Process Error");
        let detail = info.technical_detail.unwrap();
        assert!(detail.contains("Exit code: 2"));
        assert!(detail.contains("syntax error"));
    }

    #[test]
    fn test_credential_error_display() {
        let err: TalonError =
            CredentialError::FileNotFound { path: PathBuf::from("/tmp/missing.pem") }.into();
        assert_eq!(err.category(), "Credential");
        assert!(err.to_string().contains("/tmp/missing.pem"));
        assert_eq!(err.hint(), Some("Select an existing certificate and key file"));
    }
}
