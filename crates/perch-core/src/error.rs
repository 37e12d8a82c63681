// ── Core error types ──
//
// Consumer-facing errors. These are NOT plumbing-specific -- callers
// never see raw HTTP statuses or tungstenite strings directly. The
// `From<perch_api::Error>` impl translates transport-layer failures
// into domain-appropriate variants.

use std::time::Duration;

use perch_api::CancelReason;
use perch_api::wire::CommandKind;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Authentication ──────────────────────────────────────────────
    #[error("Not authenticated -- log in or restore credentials first")]
    NotAuthenticated,

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// The refresh token was rejected. Only the host application can
    /// recover by re-authenticating the user.
    #[error("Credentials expired -- re-authentication required")]
    AuthExpired,

    // ── Connectivity ────────────────────────────────────────────────
    /// Neither the local nor the cloud path could be established.
    #[error("Device {device_id} unreachable: {reason}")]
    DeviceUnavailable { device_id: String, reason: String },

    #[error("Not connected")]
    NotConnected,

    /// The connection dropped while the request was in flight.
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Session is stopped")]
    SessionStopped,

    // ── Commands ────────────────────────────────────────────────────
    /// No response arrived within the per-call deadline. Other in-flight
    /// commands and the connection itself are unaffected.
    #[error("Request {op} (id {id}) timed out after {}s", .timeout.as_secs_f64())]
    RequestTimeout {
        op: CommandKind,
        id: u64,
        timeout: Duration,
    },

    /// Rejected before anything was sent.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Wire / cloud ────────────────────────────────────────────────
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ── Conversion from plumbing-layer errors ────────────────────────────

impl From<perch_api::Error> for CoreError {
    fn from(err: perch_api::Error) -> Self {
        match err {
            perch_api::Error::Authentication { message } => CoreError::Auth { message },
            perch_api::Error::AuthExpired => CoreError::AuthExpired,
            perch_api::Error::NotConnected => CoreError::NotConnected,
            perch_api::Error::Cancelled(CancelReason::ConnectionLost) => CoreError::ConnectionLost,
            perch_api::Error::Cancelled(CancelReason::SessionStopped) => CoreError::SessionStopped,
            perch_api::Error::Protocol { message } => CoreError::Protocol { message },
            perch_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid URL: {e}"),
            },
            perch_api::Error::Tls(message) => CoreError::Api {
                message: format!("TLS error: {message}"),
            },
            perch_api::Error::WebSocket(message) => CoreError::Api {
                message: format!("WebSocket error: {message}"),
            },
            perch_api::Error::Transport(e) => CoreError::Api {
                message: e.to_string(),
            },
            perch_api::Error::Api { status, message } => CoreError::Api {
                message: format!("HTTP {status}: {message}"),
            },
        }
    }
}
