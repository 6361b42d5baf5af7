//! Connection lifecycle states for the client and the event stream.

/// Overall client connection state.
///
/// `Disconnected → Connecting → Connected`, or `Connecting → Error`. An error can be
/// retried back to `Connecting`; only an explicit disconnect returns to `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No active session
    #[default]
    Disconnected,
    /// Probing the server
    Connecting,
    /// Server reachable and credentials accepted
    Connected,
    /// Last connection attempt failed
    Error {
        /// Human-readable failure reason
        reason: String,
    },
}

impl ConnectionState {
    /// Create an error state.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error { reason: reason.into() }
    }

    /// Check if the connection is active.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Get the error reason if in error state.
    pub fn error_reason(&self) -> Option<&str> {
        match self {
            Self::Error { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Event stream state.
///
/// `Connected` never moves straight to `Failed`; transport loss always passes through
/// `Reconnecting` with a strictly increasing attempt number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Not connected and not trying to be
    #[default]
    Disconnected,
    /// Initial handshake in progress
    Connecting,
    /// Stream open, loops running
    Connected,
    /// Transport lost; waiting for or performing reconnect attempt `attempt`
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Reconnect budget exhausted; needs an explicit reconnect
    Failed {
        /// Last failure reason
        reason: String,
    },
}

impl StreamState {
    /// Check if the stream is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the stream gave up reconnecting.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Current reconnect attempt, zero outside `Reconnecting`.
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Reconnecting { attempt } => *attempt,
            _ => 0,
        }
    }
}
