// ── WebSocket transport with supervised reconnect and keepalive ──
//
// Owns one physical connection to a camera, either direct on the LAN
// (self-signed TLS, device-issued local token) or through the cloud
// relay (bearer token). Three named activities run per connection:
//
//   receive   -- reads binary frames and forwards them, in order, to the
//                owner; a close, read error, or read-idle timeout hands
//                control to the reconnect loop
//   keepalive -- sends a protocol keepalive on a fixed interval and
//                enforces the hard stale-connection bound
//   reconnect -- only while reconnecting; multiplicative backoff with
//                jitter on the first attempt, serialized so overlapping
//                triggers never open two sockets
//
// All three are spawned under one CancellationToken and joined in
// `close()`. State transitions and frames reach the owner through a
// single mpsc channel, each tagged with the transport's generation so
// a session that swaps transports can tell stale events apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;
use crate::wire;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;
type WsSource = SplitStream<WsStream>;

// ── Observable state ─────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Local,
    Cloud,
    #[default]
    None,
}

/// What a transport reports upward to its owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// A raw inbound frame, in arrival order.
    Frame { generation: u64, payload: Bytes },
    /// A connection-state transition.
    State {
        generation: u64,
        state: ConnectionState,
        kind: TransportKind,
        error: Option<String>,
    },
}

// ── Targets ──────────────────────────────────────────────────────────

/// Where to connect. Local and cloud carry different authorization
/// schemes: the device accepts its own out-of-band token, the relay a
/// bearer token.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    Local { url: Url, token: SecretString },
    Cloud { url: Url, token: SecretString },
}

impl ConnectTarget {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Local { .. } => TransportKind::Local,
            Self::Cloud { .. } => TransportKind::Cloud,
        }
    }

    fn request(&self) -> Result<ClientRequestBuilder, Error> {
        let (url, authorization) = match self {
            Self::Local { url, token } => {
                (url, format!("token {}", token.expose_secret()))
            }
            Self::Cloud { url, token } => {
                (url, format!("Bearer {}", token.expose_secret()))
            }
        };
        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocket(e.to_string()))?;
        Ok(ClientRequestBuilder::new(uri).with_header("Authorization", authorization))
    }

    /// TLS connector for this target. The device presents a self-signed
    /// certificate, so the local path skips verification entirely; the
    /// cloud path uses the default webpki roots.
    fn connector(&self) -> Result<Option<Connector>, Error> {
        match self {
            Self::Local { url, .. } if url.scheme() == "wss" => {
                Ok(Some(danger_accept_any_connector()?))
            }
            _ => Ok(None),
        }
    }
}

// ── Permissive TLS for the self-signed device certificate ────────────

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn danger_accept_any_connector() -> Result<Connector, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

// ── Tuning ───────────────────────────────────────────────────────────

/// Connection timing knobs. Defaults match the device firmware's
/// expectations.
#[derive(Debug, Clone)]
pub struct TransportTimings {
    /// Interval between protocol keepalive frames, independent of
    /// application traffic.
    pub keepalive_interval: Duration,
    /// Receive-side watchdog: no frame for this long forces a reconnect.
    pub idle_read_timeout: Duration,
    /// Hard upper bound on a silent connection, enforced by the
    /// keepalive loop as a backstop to the read watchdog.
    pub stale_timeout: Duration,
    /// WebSocket handshake deadline.
    pub handshake_timeout: Duration,
}

impl Default for TransportTimings {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            idle_read_timeout: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub base: Duration,
    /// Multiplicative growth per failed attempt.
    pub factor: f64,
    /// Upper bound on the delay.
    pub cap: Duration,
    /// Random jitter added to the first attempt only, to spread
    /// reconnection storms across clients.
    pub first_jitter: Duration,
    /// Give up after this many failed attempts and report a final
    /// `Disconnected`. `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs_f64(1.85),
            factor: 1.618,
            cap: Duration::from_secs(60),
            first_jitter: Duration::from_secs(1),
            max_retries: None,
        }
    }
}

/// Pure backoff sequence: `base, base*factor, ... , cap`. Resets to
/// base on a successful connect.
#[derive(Debug)]
pub struct Backoff {
    base: f64,
    factor: f64,
    cap: f64,
    current: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let base = config.base.as_secs_f64();
        Self {
            base,
            factor: config.factor,
            cap: config.cap.as_secs_f64(),
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * self.factor).min(self.cap);
        Duration::from_secs_f64(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

fn first_attempt_jitter(limit: Duration) -> Duration {
    if limit.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..limit.as_secs_f64()))
}

// ── Transport ────────────────────────────────────────────────────────

/// One physical connection to a camera.
///
/// Cheaply cloneable. Create, `connect()`, `send()` frames, and
/// `close()` exactly once; a session that needs a different target
/// builds a fresh transport with a new generation.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    target: ConnectTarget,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    timings: TransportTimings,
    backoff: BackoffConfig,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    state_tx: watch::Sender<ConnectionState>,
    last_rx: Mutex<Instant>,
    cancel: CancellationToken,
    conn_cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl Transport {
    /// `events` is deliberately unbounded: the receive loop forwards
    /// frames without ever blocking, so teardown can never deadlock on
    /// a stalled consumer. The owning session drains it continuously.
    pub fn new(
        target: ConnectTarget,
        generation: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
        timings: TransportTimings,
        backoff: BackoffConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                target,
                generation,
                events,
                timings,
                backoff,
                sink: tokio::sync::Mutex::new(None),
                state_tx,
                last_rx: Mutex::new(Instant::now()),
                cancel: CancellationToken::new(),
                conn_cancel: Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.target.kind()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions (in addition to the event channel).
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the socket and start the receive and keepalive loops.
    ///
    /// Resolves once the handshake completes; failures leave the
    /// transport `Disconnected` and are returned to the caller, which
    /// decides about fallback.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        self.inner.set_state(ConnectionState::Connecting, None);

        match open_socket(&self.inner).await {
            Ok(stream) => {
                install_connection(&self.inner, stream).await;
                self.inner.set_state(ConnectionState::Connected, None);
                info!(
                    generation = self.inner.generation,
                    kind = %self.inner.target.kind(),
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                self.inner
                    .set_state(ConnectionState::Disconnected, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Write one frame. Fails immediately when there is no open socket;
    /// nothing is queued.
    pub async fn send(&self, frame: Bytes) -> Result<(), Error> {
        self.inner.send_frame(frame).await
    }

    /// Cancel all activities, join them, and close the socket.
    /// Idempotent; safe to call from any task except the transport's own
    /// loops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.lock_tasks();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }

        self.inner.set_state(ConnectionState::Disconnected, None);
        debug!(generation = self.inner.generation, "transport closed");
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let previous = self.state_tx.send_replace(state);
        if previous == state && error.is_none() {
            return;
        }
        let _ = self.events.send(TransportEvent::State {
            generation: self.generation,
            state,
            kind: self.target.kind(),
            error,
        });
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), Error> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        sink.send(tungstenite::Message::Binary(frame))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    fn touch_rx(&self) {
        *self.last_rx.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn rx_age(&self) -> Duration {
        self.last_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Cancel the loops belonging to the current connection (not the
    /// transport as a whole).
    fn cancel_connection(&self) {
        self.conn_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────

async fn open_socket(inner: &Inner) -> Result<WsStream, Error> {
    let request = inner.target.request()?;
    let connector = inner.target.connector()?;
    let handshake = connect_async_tls_with_config(request, None, false, connector);

    match tokio::time::timeout(inner.timings.handshake_timeout, handshake).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(Error::WebSocket(e.to_string())),
        Err(_) => Err(Error::WebSocket(format!(
            "handshake timed out after {:.0?}",
            inner.timings.handshake_timeout
        ))),
    }
}

/// Split the socket, store the writer, and spawn the per-connection
/// loops under a fresh child token.
async fn install_connection(inner: &Arc<Inner>, stream: WsStream) {
    let (sink, source) = stream.split();
    *inner.sink.lock().await = Some(sink);
    inner.touch_rx();

    let conn_cancel = inner.cancel.child_token();
    *inner
        .conn_cancel
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = conn_cancel.clone();

    let recv = tokio::spawn(recv_loop(
        Arc::clone(inner),
        source,
        conn_cancel.clone(),
    ));
    let keepalive = tokio::spawn(keepalive_loop(Arc::clone(inner), conn_cancel));
    inner.track_task(recv);
    inner.track_task(keepalive);
}

/// Elect a single reconnector and hand it the backoff loop. Called from
/// whichever loop notices the failure first; the loser of the race
/// returns immediately.
fn begin_reconnect(inner: &Arc<Inner>, reason: String) {
    if inner.closed.load(Ordering::SeqCst) || inner.cancel.is_cancelled() {
        return;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return;
    }
    let handle = tokio::spawn(reconnect_loop(Arc::clone(inner), reason));
    inner.track_task(handle);
}

// ── Background loops ─────────────────────────────────────────────────

/// Read frames until the connection dies, forwarding each one upward in
/// arrival order.
async fn recv_loop(inner: Arc<Inner>, mut source: WsSource, cancel: CancellationToken) {
    let idle = inner.timings.idle_read_timeout;
    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            read = tokio::time::timeout(idle, source.next()) => {
                match read {
                    Err(_) => break format!("no frames for {}s", idle.as_secs()),
                    Ok(None) => break "stream ended".to_owned(),
                    Ok(Some(Err(e))) => break format!("read error: {e}"),
                    Ok(Some(Ok(message))) => match message {
                        tungstenite::Message::Binary(payload) => {
                            inner.touch_rx();
                            let event = TransportEvent::Frame {
                                generation: inner.generation,
                                payload,
                            };
                            if inner.events.send(event).is_err() {
                                // Owner is gone; nothing left to feed.
                                return;
                            }
                        }
                        tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => {
                            // tungstenite answers pings itself; both count
                            // as liveness.
                            inner.touch_rx();
                        }
                        tungstenite::Message::Close(frame) => {
                            debug!(generation = inner.generation, ?frame, "close frame received");
                            break "closed by peer".to_owned();
                        }
                        _ => {}
                    },
                }
            }
        }
    };

    if !cancel.is_cancelled() {
        warn!(generation = inner.generation, reason = %reason, "connection lost");
        begin_reconnect(&inner, reason);
    }
}

/// Send a protocol keepalive on a fixed cadence and enforce the stale
/// bound.
async fn keepalive_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.timings.keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if inner.rx_age() >= inner.timings.stale_timeout {
                    warn!(generation = inner.generation, "connection stale, forcing reconnect");
                    begin_reconnect(&inner, "stale connection".to_owned());
                    return;
                }
                if let Err(e) = inner.send_frame(wire::build_keepalive()).await {
                    warn!(generation = inner.generation, error = %e, "keepalive send failed");
                    begin_reconnect(&inner, format!("keepalive failed: {e}"));
                    return;
                }
            }
        }
    }
}

/// Backoff loop: tear down the old connection, then dial until a
/// connect succeeds, the retry budget runs out, or the transport closes.
async fn reconnect_loop(inner: Arc<Inner>, reason: String) {
    inner.cancel_connection();
    *inner.sink.lock().await = None;
    inner.set_state(ConnectionState::Reconnecting, Some(reason));

    let mut backoff = Backoff::new(&inner.backoff);
    let mut attempt: u32 = 0;

    loop {
        if inner.closed.load(Ordering::SeqCst) || inner.cancel.is_cancelled() {
            break;
        }
        if let Some(max) = inner.backoff.max_retries {
            if attempt >= max {
                warn!(
                    generation = inner.generation,
                    max_retries = max,
                    "reconnect attempts exhausted, giving up"
                );
                inner.set_state(
                    ConnectionState::Disconnected,
                    Some("reconnect attempts exhausted".to_owned()),
                );
                break;
            }
        }

        let mut delay = backoff.next_delay();
        if attempt == 0 {
            delay += first_attempt_jitter(inner.backoff.first_jitter);
        }
        debug!(
            generation = inner.generation,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        inner.set_state(ConnectionState::Connecting, None);
        match open_socket(&inner).await {
            Ok(stream) => {
                install_connection(&inner, stream).await;
                inner.set_state(ConnectionState::Connected, None);
                info!(
                    generation = inner.generation,
                    kind = %inner.target.kind(),
                    attempt,
                    "reconnected"
                );
                break;
            }
            Err(e) => {
                warn!(generation = inner.generation, attempt, error = %e, "reconnect attempt failed");
                inner.set_state(ConnectionState::Reconnecting, Some(e.to_string()));
                attempt += 1;
            }
        }
    }

    inner.reconnecting.store(false, Ordering::SeqCst);
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base: f64, cap: u64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs_f64(base),
            factor: 1.618,
            cap: Duration::from_secs(cap),
            first_jitter: Duration::ZERO,
            max_retries: None,
        }
    }

    #[test]
    fn backoff_is_monotone_up_to_the_cap() {
        let mut backoff = Backoff::new(&config(1.85, 60));
        let mut previous = Duration::ZERO;
        for _ in 0..32 {
            let delay = backoff.next_delay();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        // Long sequences pin at the cap.
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn backoff_starts_at_base_and_grows_by_the_golden_ratio() {
        let mut backoff = Backoff::new(&config(1.85, 60));
        let first = backoff.next_delay().as_secs_f64();
        let second = backoff.next_delay().as_secs_f64();
        assert!((first - 1.85).abs() < 1e-9);
        assert!((second - 1.85 * 1.618).abs() < 1e-9);
    }

    #[test]
    fn backoff_resets_to_base() {
        let mut backoff = Backoff::new(&config(1.85, 60));
        for _ in 0..10 {
            let _ = backoff.next_delay();
        }
        backoff.reset();
        assert!((backoff.next_delay().as_secs_f64() - 1.85).abs() < 1e-9);
    }

    #[test]
    fn first_jitter_respects_the_limit() {
        for _ in 0..64 {
            let jitter = first_attempt_jitter(Duration::from_secs(1));
            assert!(jitter < Duration::from_secs(1));
        }
        assert_eq!(first_attempt_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn targets_expose_their_kind() {
        let local = ConnectTarget::Local {
            url: "ws://10.0.0.5:4443".parse().unwrap(),
            token: SecretString::from("local-token".to_owned()),
        };
        let cloud = ConnectTarget::Cloud {
            url: "wss://relay.example/devices/abc/connect".parse().unwrap(),
            token: SecretString::from("bearer-token".to_owned()),
        };
        assert_eq!(local.kind(), TransportKind::Local);
        assert_eq!(cloud.kind(), TransportKind::Cloud);
    }
}
