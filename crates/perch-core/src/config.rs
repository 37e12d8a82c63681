// ── Runtime connection configuration ──
//
// These types describe *how* to reach the service and a device. They
// carry endpoints, credentials, and tuning, but never touch disk -- the
// host application loads whatever it persists and hands these in.

use std::net::IpAddr;
use std::time::Duration;

use perch_api::{BackoffConfig, TransportTimings};
use secrecy::SecretString;
use url::Url;

/// Default port the device listens on for direct LAN connections.
pub const DEFAULT_LOCAL_PORT: u16 = 4443;

/// Default per-command response deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cadence of the local-promotion probe while on the cloud path.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(300);

/// Default number of local reconnect attempts before failing over to
/// the cloud path.
pub const DEFAULT_LOCAL_RETRY_LIMIT: u32 = 3;

/// Account-level endpoints shared by every session under one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base, e.g. `https://api.perchcam.io`.
    pub api_base: Url,
    /// WebSocket relay base; sessions append `devices/{id}/connect`.
    pub ws_base: Url,
    /// Media base used to format stream URLs.
    pub media_base: Url,
    /// REST request timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.perchcam.io"
                .parse()
                .expect("default api_base is a valid URL"),
            ws_base: "wss://api.perchcam.io"
                .parse()
                .expect("default ws_base is a valid URL"),
            media_base: "rtmps://media.perchcam.io"
                .parse()
                .expect("default media_base is a valid URL"),
            timeout: Duration::from_secs(30),
        }
    }
}

/// How one device's LAN endpoint is reached.
///
/// The device-issued token is obtained out of band and is distinct from
/// the cloud bearer token. `use_tls` exists for firmware that exposes a
/// plaintext port; the default is the self-signed TLS listener.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub token: SecretString,
    pub use_tls: bool,
}

impl LocalEndpoint {
    pub fn new(ip: IpAddr, token: SecretString) -> Self {
        Self {
            ip,
            port: DEFAULT_LOCAL_PORT,
            token,
            use_tls: true,
        }
    }
}

/// Per-device session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Try the LAN path first when a local endpoint is configured.
    pub prefer_local: bool,
    /// Direct LAN endpoint, if known.
    pub local: Option<LocalEndpoint>,
    /// Per-command response deadline.
    pub request_timeout: Duration,
    /// Cadence of the background local-promotion probe.
    pub probe_interval: Duration,
    /// Local reconnect attempts before failing over to the cloud path.
    pub local_retry_limit: u32,
    /// Whether the device needs an explicit streaming command before its
    /// media URL becomes servable. Devices that push automatically on
    /// first connection set this to `false`.
    pub requires_stream_start: bool,
    /// Transport timing knobs (keepalive, watchdogs, handshake).
    pub timings: TransportTimings,
    /// Reconnect backoff for the cloud path. The local path uses the
    /// same shape bounded by `local_retry_limit`.
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefer_local: true,
            local: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            local_retry_limit: DEFAULT_LOCAL_RETRY_LIMIT,
            requires_stream_start: true,
            timings: TransportTimings::default(),
            backoff: BackoffConfig::default(),
        }
    }
}
