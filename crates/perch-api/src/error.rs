use thiserror::Error;

/// Why an outstanding request was cancelled in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The connection carrying the request was lost.
    ConnectionLost,
    /// The owning session was stopped.
    SessionStopped,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::SessionStopped => f.write_str("session stopped"),
        }
    }
}

/// Top-level error type for the `perch-api` crate.
///
/// Covers every failure mode across the plumbing layers: authentication,
/// HTTP transport, WebSocket transport, and the wire codec.
/// `perch-core` maps these into consumer-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login or access-token rejection (wrong credentials, bad MFA code).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The refresh token itself was rejected. Terminal: the host
    /// application must re-authenticate the user.
    #[error("Refresh token rejected -- re-authentication required")]
    AuthExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout).
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// WebSocket connect or I/O failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// `send()` was called while the transport had no open socket.
    /// Nothing is queued -- the caller decides whether to retry.
    #[error("Not connected")]
    NotConnected,

    // ── Wire ────────────────────────────────────────────────────────
    /// A frame that could not be decoded (bad header, malformed payload).
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// An outstanding request was cancelled before a response arrived.
    #[error("Request cancelled: {0}")]
    Cancelled(CancelReason),

    // ── REST ────────────────────────────────────────────────────────
    /// Unexpected response from the cloud REST API.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
}

impl Error {
    /// Returns `true` if this error means the stored credentials are no
    /// longer usable and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Authentication { .. } | Self::AuthExpired)
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::WebSocket(_) | Self::NotConnected => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
