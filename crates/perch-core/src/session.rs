// ── Device session ──
//
// The single authority for one device's connection and state. Composes
// the transport, wire codec, correlation table, and token manager into
// the local-first / cloud-fallback lifecycle:
//
//   start -> local connect (if configured) -> cloud fallback
//         -> initial full-state fetch -> enable sensor push
//         -> promotion probe while on cloud
//
// One event-pump task consumes the transport's ordered event stream, so
// frames are decoded serially and state merges never race each other.
// Swapping transports (promotion, failover) never drops in-flight
// commands: the superseded transport keeps delivering frames until a
// grace period expires, and late responses still resolve through the
// shared correlation table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use perch_api::pending::PendingRequests;
use perch_api::transport::{
    Backoff, BackoffConfig, ConnectTarget, ConnectionState, Transport, TransportEvent,
    TransportKind,
};
use perch_api::wire::{
    self, CommandBody, CommandKind, ControlPayload, NightLight, SensorPushFlags, SettingsPayload,
    StreamTarget, StreamingPayload, StreamingStatus,
};
use perch_api::{CancelReason, RestClient, TokenManager};

use crate::config::{ClientConfig, SessionConfig};
use crate::error::CoreError;
use crate::model::{
    ConnectionInfo, ControlState, DeviceEvent, SensorState, SettingsState, StateUpdate,
    StatusState,
};

/// Minimum access-token lifetime demanded before opening a connection.
const TOKEN_MIN_TTL: Duration = Duration::from_secs(60);

const MAX_VOLUME: u8 = 100;
const MAX_NIGHT_LIGHT_TIMEOUT_SECS: u32 = 3600;

type SubscriberCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;
type SubscriberMap = Mutex<HashMap<u64, SubscriberCallback>>;

// ── Command parameter structs ────────────────────────────────────────

/// Partial settings change; only the provided fields are sent.
#[derive(Debug, Clone, Default)]
pub struct SettingsChange {
    pub night_vision: Option<bool>,
    pub volume: Option<u8>,
    pub sleep_mode: Option<bool>,
    pub status_light_on: Option<bool>,
    pub mic_mute_on: Option<bool>,
}

impl SettingsChange {
    fn validate(&self) -> Result<(), CoreError> {
        if self.night_vision.is_none()
            && self.volume.is_none()
            && self.sleep_mode.is_none()
            && self.status_light_on.is_none()
            && self.mic_mute_on.is_none()
        {
            return Err(CoreError::Validation {
                message: "no settings provided".into(),
            });
        }
        if let Some(volume) = self.volume {
            if volume > MAX_VOLUME {
                return Err(CoreError::Validation {
                    message: format!("volume {volume} out of range 0-{MAX_VOLUME}"),
                });
            }
        }
        Ok(())
    }

    fn into_payload(self) -> SettingsPayload {
        SettingsPayload {
            night_vision: self.night_vision,
            volume: self.volume,
            sleep_mode: self.sleep_mode,
            status_light_on: self.status_light_on,
            mic_mute_on: self.mic_mute_on,
            ..SettingsPayload::default()
        }
    }
}

/// Partial control change; only the provided fields are sent.
#[derive(Debug, Clone, Default)]
pub struct ControlChange {
    pub night_light: Option<NightLight>,
    pub night_light_timeout: Option<u32>,
}

impl ControlChange {
    fn validate(&self) -> Result<(), CoreError> {
        if self.night_light.is_none() && self.night_light_timeout.is_none() {
            return Err(CoreError::Validation {
                message: "no control fields provided".into(),
            });
        }
        if let Some(timeout) = self.night_light_timeout {
            if timeout == 0 || timeout > MAX_NIGHT_LIGHT_TIMEOUT_SECS {
                return Err(CoreError::Validation {
                    message: format!(
                        "night light timeout {timeout} out of range 1-{MAX_NIGHT_LIGHT_TIMEOUT_SECS}"
                    ),
                });
            }
        }
        Ok(())
    }

    fn into_payload(self) -> ControlPayload {
        ControlPayload {
            night_light: self.night_light,
            night_light_timeout: self.night_light_timeout,
            ..ControlPayload::default()
        }
    }
}

// ── Subscriptions ────────────────────────────────────────────────────

/// Deregistration handle returned by [`DeviceSession::subscribe`].
///
/// Holds only a weak reference, so an outstanding handle never keeps a
/// session alive.
pub struct SubscriptionHandle {
    id: u64,
    subscribers: Weak<SubscriberMap>,
}

impl SubscriptionHandle {
    /// Remove the callback. A no-op if the session is already gone.
    pub fn unsubscribe(self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

// ── Streaming helper ─────────────────────────────────────────────────

/// Format the media URL for a device. A pure function of the device id
/// and a fresh token -- no protocol exchange, no state.
pub fn media_stream_url(
    media_base: &Url,
    device_id: &str,
    token: &SecretString,
) -> Result<Url, CoreError> {
    let base = media_base.as_str().trim_end_matches('/');
    format!("{base}/live/{device_id}.{}", token.expose_secret())
        .parse()
        .map_err(|e| CoreError::Config {
            message: format!("invalid media URL: {e}"),
        })
}

// ── DeviceSession ────────────────────────────────────────────────────

/// The single authority for one device.
///
/// Cheaply cloneable; construct only through
/// [`Client::camera`](crate::Client::camera) so there is never more
/// than one session per device id.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    device_id: String,
    config: SessionConfig,
    client_config: ClientConfig,
    tokens: Arc<TokenManager>,
    rest: Arc<RestClient>,
    pending: PendingRequests,

    state: ArcSwap<crate::model::DeviceState>,
    /// Serializes snapshot replacement + subscriber notification so
    /// delivery order always matches acceptance order.
    merge_gate: Mutex<()>,
    subscribers: Arc<SubscriberMap>,
    next_subscriber_id: AtomicU64,

    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    active: Mutex<Option<Transport>>,
    retired: Mutex<Vec<Transport>>,
    active_generation: AtomicU64,
    next_generation: AtomicU64,
    /// Connection state as last observed for the *active* transport.
    /// Lives here rather than in the pump so a transport swap
    /// (promotion, failover) keeps disconnect accounting correct.
    last_conn_state: Mutex<ConnectionState>,
    refetch_on_connect: AtomicBool,
    failing_over: AtomicBool,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl DeviceSession {
    pub(crate) fn new(
        device_id: impl Into<String>,
        config: SessionConfig,
        client_config: ClientConfig,
        tokens: Arc<TokenManager>,
        rest: Arc<RestClient>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SessionInner {
                device_id: device_id.into(),
                config,
                client_config,
                tokens,
                rest,
                pending: PendingRequests::new(),
                state: ArcSwap::from_pointee(crate::model::DeviceState::default()),
                merge_gate: Mutex::new(()),
                subscribers: Arc::new(Mutex::new(HashMap::new())),
                next_subscriber_id: AtomicU64::new(0),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                active: Mutex::new(None),
                retired: Mutex::new(Vec::new()),
                active_generation: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                last_conn_state: Mutex::new(ConnectionState::Disconnected),
                refetch_on_connect: AtomicBool::new(false),
                failing_over: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Current state snapshot. Cheap; callers get an immutable view.
    pub fn state(&self) -> Arc<crate::model::DeviceState> {
        self.inner.state.load_full()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connection.state == ConnectionState::Connected
    }

    /// Number of in-flight commands.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.pending_count()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect and bring the session to steady state.
    ///
    /// Tries the LAN path first when configured, falls back to the
    /// cloud relay on any local failure, and fails with
    /// [`CoreError::DeviceUnavailable`] when neither succeeds. On
    /// success the initial full-state fetch runs, sensor push is
    /// enabled, and -- when connected via cloud with a local endpoint
    /// configured -- the promotion probe starts.
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(CoreError::SessionStopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(device_id = %self.inner.device_id, "session already started");
            return Ok(());
        }

        // The pump must run before the first connect so no transport
        // event is ever missed.
        if let Some(rx) = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let session = self.clone();
            let cancel = self.inner.cancel.clone();
            self.track_task(tokio::spawn(pump_loop(session, rx, cancel)));
        }

        let mut connected = false;
        if self.inner.config.prefer_local {
            if let Some(target) = self.local_target() {
                match self.connect_primary(target, self.local_backoff()).await {
                    Ok(()) => connected = true,
                    Err(e) => info!(
                        device_id = %self.inner.device_id,
                        error = %e,
                        "local connect failed, falling back to cloud"
                    ),
                }
            }
        }

        if !connected {
            let target = match self.cloud_target().await {
                Ok(target) => target,
                Err(e) => {
                    self.inner.started.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            if let Err(e) = self.connect_primary(target, self.cloud_backoff()).await {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(CoreError::DeviceUnavailable {
                    device_id: self.inner.device_id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        self.fetch_full_state().await;
        self.enable_sensor_push().await;
        self.inner.refetch_on_connect.store(true, Ordering::SeqCst);

        if self.active_kind() == Some(TransportKind::Cloud) {
            self.spawn_probe();
        }
        Ok(())
    }

    /// Stop the session for good: cancel every background activity,
    /// fail outstanding commands, close all transports, and join
    /// everything. Safe to call repeatedly; afterwards no activity
    /// remains.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(device_id = %self.inner.device_id, "stopping session");

        self.inner.cancel.cancel();
        self.inner.pending.cancel_all(CancelReason::SessionStopped);

        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(transport) = active {
            transport.close().await;
        }
        let retired: Vec<Transport> = {
            let mut retired = self
                .inner
                .retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            retired.drain(..).collect()
        };
        for transport in retired {
            transport.close().await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.lock_tasks();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        // The pump is gone by now, so surface the final transition
        // directly: subscribers mark the device unavailable.
        self.apply_update(StateUpdate::Connection(ConnectionInfo {
            state: ConnectionState::Disconnected,
            transport: TransportKind::None,
            last_seen: self.state().connection.last_seen,
            last_error: None,
            reconnect_attempts: 0,
        }));
        debug!(device_id = %self.inner.device_id, "session stopped");
    }

    /// Register a listener for every [`DeviceEvent`]. Events arrive in
    /// the order state changes are accepted and never concurrently for
    /// one session.
    pub fn subscribe(
        &self,
        callback: impl Fn(DeviceEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        SubscriptionHandle {
            id,
            subscribers: Arc::downgrade(&self.inner.subscribers),
        }
    }

    // ── Commands — GET ───────────────────────────────────────────────

    pub async fn get_status(&self) -> Result<StatusState, CoreError> {
        let resp = self
            .send_command(
                CommandKind::GetStatus,
                CommandBody {
                    all: Some(true),
                    ..CommandBody::default()
                },
            )
            .await?;
        let status: StatusState = resp.status.map(Into::into).unwrap_or_default();
        self.apply_update(StateUpdate::Status(status.clone()));
        Ok(status)
    }

    pub async fn get_settings(&self) -> Result<SettingsState, CoreError> {
        let resp = self
            .send_command(CommandKind::GetSettings, CommandBody::default())
            .await?;
        let settings: SettingsState = resp.settings.map(Into::into).unwrap_or_default();
        self.apply_update(StateUpdate::Settings(settings.clone()));
        Ok(settings)
    }

    pub async fn get_sensors(&self) -> Result<SensorState, CoreError> {
        let resp = self
            .send_command(
                CommandKind::GetSensors,
                CommandBody {
                    all: Some(true),
                    ..CommandBody::default()
                },
            )
            .await?;
        let samples = resp.sensors.unwrap_or_default();
        let merged = self.state().sensors.merged_with(&samples);
        self.apply_update(StateUpdate::Sensors(merged.clone()));
        Ok(merged)
    }

    pub async fn get_control(&self) -> Result<ControlState, CoreError> {
        let resp = self
            .send_command(
                CommandKind::GetControl,
                CommandBody {
                    all: Some(true),
                    ..CommandBody::default()
                },
            )
            .await?;
        let control: ControlState = resp.control.map(Into::into).unwrap_or_default();
        self.apply_update(StateUpdate::Control(control.clone()));
        Ok(control)
    }

    // ── Commands — SET ───────────────────────────────────────────────

    /// Apply a partial settings change. Invalid input is rejected
    /// before any frame is sent or correlation entry created.
    pub async fn set_settings(&self, change: SettingsChange) -> Result<SettingsState, CoreError> {
        change.validate()?;
        let body = CommandBody {
            settings: Some(change.into_payload()),
            ..CommandBody::default()
        };
        let resp = self.send_command(CommandKind::PutSettings, body).await?;
        let settings: SettingsState = resp.settings.map(Into::into).unwrap_or_default();
        self.apply_update(StateUpdate::Settings(settings.clone()));
        Ok(settings)
    }

    /// Apply a partial control change (night light and its timeout).
    pub async fn set_control(&self, change: ControlChange) -> Result<ControlState, CoreError> {
        change.validate()?;
        let body = CommandBody {
            control: Some(change.into_payload()),
            ..CommandBody::default()
        };
        let resp = self.send_command(CommandKind::PutControl, body).await?;
        let control: ControlState = resp.control.map(Into::into).unwrap_or_default();
        self.apply_update(StateUpdate::Control(control.clone()));
        Ok(control)
    }

    // ── Streaming ────────────────────────────────────────────────────

    /// The media URL for this device with a freshly fetched token.
    pub async fn stream_url(&self) -> Result<Url, CoreError> {
        let token = self.inner.tokens.get_valid_token(TOKEN_MIN_TTL).await?;
        media_stream_url(
            &self.inner.client_config.media_base,
            &self.inner.device_id,
            &token,
        )
    }

    /// Ask the device to start publishing media.
    ///
    /// Devices that push automatically on first connection
    /// (`requires_stream_start: false`) skip the exchange entirely.
    pub async fn start_streaming(&self) -> Result<(), CoreError> {
        if !self.inner.config.requires_stream_start {
            return Ok(());
        }
        let url = self.stream_url().await?;
        let body = CommandBody {
            streaming: Some(StreamingPayload {
                id: StreamTarget::Mobile,
                status: StreamingStatus::Started,
                url: Some(url.to_string()),
            }),
            ..CommandBody::default()
        };
        self.send_command(CommandKind::PutStreaming, body).await?;
        Ok(())
    }

    pub async fn stop_streaming(&self) -> Result<(), CoreError> {
        if !self.inner.config.requires_stream_start {
            return Ok(());
        }
        let body = CommandBody {
            streaming: Some(StreamingPayload {
                id: StreamTarget::Mobile,
                status: StreamingStatus::Stopped,
                url: None,
            }),
            ..CommandBody::default()
        };
        self.send_command(CommandKind::PutStreaming, body).await?;
        Ok(())
    }

    /// Fetch a JPEG still over REST. Best-effort; `None` on any failure.
    pub async fn snapshot(&self) -> Option<Bytes> {
        let token = self.inner.tokens.get_valid_token(TOKEN_MIN_TTL).await.ok()?;
        self.inner
            .rest
            .fetch_snapshot(&token, &self.inner.device_id)
            .await
    }

    // ── Request plumbing ─────────────────────────────────────────────

    async fn send_command(
        &self,
        op: CommandKind,
        body: CommandBody,
    ) -> Result<wire::Response, CoreError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(CoreError::SessionStopped);
        }
        let transport = self.active_transport()?;

        let id = self.inner.pending.next_id();
        let frame = wire::build_command(id, op, body)?;
        // Track before sending: a fast response must always find its slot.
        let slot = self.inner.pending.track(id);

        if let Err(e) = transport.send(frame).await {
            self.inner.pending.remove(id);
            return Err(e.into());
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, slot).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_closed)) => {
                self.inner.pending.remove(id);
                Err(CoreError::ConnectionLost)
            }
            Err(_elapsed) => {
                // The caller owns its entry past the deadline.
                self.inner.pending.remove(id);
                Err(CoreError::RequestTimeout { op, id, timeout })
            }
        }
    }

    // ── Inbound routing ──────────────────────────────────────────────

    fn handle_frame(&self, payload: &[u8]) {
        let message = match wire::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(device_id = %self.inner.device_id, error = %e, "dropping malformed frame");
                return;
            }
        };

        match message {
            wire::Message::Keepalive => {}
            wire::Message::Response(response) => {
                let id = response.id;
                if !self.inner.pending.resolve(id, response) {
                    debug!(
                        device_id = %self.inner.device_id,
                        request_id = id,
                        "response for unknown or expired request"
                    );
                }
            }
            wire::Message::Push(push) => {
                let update = StateUpdate::from_push(push, &self.state().sensors);
                self.apply_update(update);
            }
            wire::Message::Request(request) => {
                debug!(
                    device_id = %self.inner.device_id,
                    op = %request.op,
                    "ignoring request frame from device"
                );
            }
            wire::Message::Unrecognized { kind } => {
                debug!(device_id = %self.inner.device_id, kind, "ignoring unrecognized frame");
            }
        }
    }

    fn handle_state_change(
        &self,
        state: ConnectionState,
        kind: TransportKind,
        error: Option<String>,
    ) {
        let (was_connected, from_reconnecting) = {
            let mut prev = self
                .inner
                .last_conn_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let observed = (
                *prev == ConnectionState::Connected,
                *prev == ConnectionState::Reconnecting,
            );
            *prev = state;
            observed
        };

        let old = self.state();
        let connection = ConnectionInfo {
            state,
            transport: kind,
            last_seen: if state == ConnectionState::Connected {
                Some(Utc::now())
            } else {
                old.connection.last_seen
            },
            last_error: if state == ConnectionState::Connected {
                None
            } else {
                error.or_else(|| old.connection.last_error.clone())
            },
            reconnect_attempts: match state {
                ConnectionState::Reconnecting => old.connection.reconnect_attempts + 1,
                ConnectionState::Connected => 0,
                _ => old.connection.reconnect_attempts,
            },
        };
        self.apply_update(StateUpdate::Connection(connection));

        // Exactly once per disconnect, before any reconnect attempt can
        // land: stale requests must never resolve against a later
        // connection.
        if was_connected && state != ConnectionState::Connected {
            self.inner.pending.cancel_all(CancelReason::ConnectionLost);
        }

        // Pushes may lag after an outage; refetch instead of waiting.
        if state == ConnectionState::Connected
            && !was_connected
            && self.inner.refetch_on_connect.load(Ordering::SeqCst)
        {
            self.spawn_refetch();
        }

        // The local transport ran out of retries: move to the cloud
        // path and resume probing from there.
        if state == ConnectionState::Disconnected
            && from_reconnecting
            && kind == TransportKind::Local
            && !self.inner.stopped.load(Ordering::SeqCst)
            && !self.inner.failing_over.swap(true, Ordering::SeqCst)
        {
            let session = self.clone();
            let cancel = self.inner.cancel.clone();
            self.track_task(tokio::spawn(failover_loop(session, cancel)));
        }
    }

    // ── State aggregation ────────────────────────────────────────────

    fn apply_update(&self, update: StateUpdate) {
        let kind = update.event_kind();
        let gate = self
            .inner
            .merge_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let old = self.inner.state.load_full();
        let new = Arc::new(update.apply(&old));
        self.inner.state.store(Arc::clone(&new));

        let subscribers: Vec<SubscriberCallback> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let event = DeviceEvent { kind, state: new };
        for callback in &subscribers {
            callback(event.clone());
        }
        drop(gate);
    }

    // ── Targets and transports ───────────────────────────────────────

    fn local_target(&self) -> Option<ConnectTarget> {
        let endpoint = self.inner.config.local.as_ref()?;
        let scheme = if endpoint.use_tls { "wss" } else { "ws" };
        let addr = std::net::SocketAddr::new(endpoint.ip, endpoint.port);
        let url: Url = format!("{scheme}://{addr}").parse().ok()?;
        Some(ConnectTarget::Local {
            url,
            token: endpoint.token.clone(),
        })
    }

    async fn cloud_target(&self) -> Result<ConnectTarget, CoreError> {
        let token = self.inner.tokens.get_valid_token(TOKEN_MIN_TTL).await?;
        let url = self
            .inner
            .client_config
            .ws_base
            .join(&format!("devices/{}/connect", self.inner.device_id))
            .map_err(|e| CoreError::Config {
                message: format!("invalid ws_base: {e}"),
            })?;
        Ok(ConnectTarget::Cloud { url, token })
    }

    fn cloud_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            max_retries: None,
            ..self.inner.config.backoff.clone()
        }
    }

    fn local_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            max_retries: Some(self.inner.config.local_retry_limit),
            ..self.inner.config.backoff.clone()
        }
    }

    fn build_transport(&self, target: ConnectTarget, backoff: BackoffConfig) -> Transport {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        Transport::new(
            target,
            generation,
            self.inner.events_tx.clone(),
            self.inner.config.timings.clone(),
            backoff,
        )
    }

    /// Connect a transport as the active one from the outset (initial
    /// connect and fallback during `start`).
    async fn connect_primary(
        &self,
        target: ConnectTarget,
        backoff: BackoffConfig,
    ) -> Result<(), perch_api::Error> {
        let transport = self.build_transport(target, backoff);
        self.inner
            .active_generation
            .store(transport.generation(), Ordering::SeqCst);
        *self.lock_active() = Some(transport.clone());
        transport.connect().await
    }

    /// Swap a freshly connected transport in as the active one.
    ///
    /// With `graceful_old_close` the superseded transport stays open for
    /// one request-timeout so in-flight commands resolve (or time out)
    /// against it instead of being dropped.
    async fn adopt_transport(&self, transport: Transport, graceful_old_close: bool) {
        let old = {
            let mut active = self.lock_active();
            let old = active.replace(transport.clone());
            self.inner
                .active_generation
                .store(transport.generation(), Ordering::SeqCst);
            old
        };
        *self
            .inner
            .last_conn_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ConnectionState::Connected;

        // The new transport's Connected event predates the swap and was
        // discarded as stale, so surface the transition here.
        self.apply_update(StateUpdate::Connection(ConnectionInfo {
            state: ConnectionState::Connected,
            transport: transport.kind(),
            last_seen: Some(Utc::now()),
            last_error: None,
            reconnect_attempts: 0,
        }));

        if let Some(old) = old {
            if graceful_old_close {
                self.inner
                    .retired
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(old.clone());
                let session = self.clone();
                let cancel = self.inner.cancel.clone();
                let grace = self.inner.config.request_timeout;
                self.track_task(tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(grace) => {
                            let generation = old.generation();
                            old.close().await;
                            session
                                .inner
                                .retired
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .retain(|t| t.generation() != generation);
                        }
                    }
                }));
            } else {
                old.close().await;
            }
        }

        self.spawn_refetch();
    }

    fn active_transport(&self) -> Result<Transport, CoreError> {
        self.lock_active().clone().ok_or(CoreError::NotConnected)
    }

    fn active_kind(&self) -> Option<TransportKind> {
        self.lock_active().as_ref().map(Transport::kind)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Transport>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.lock_tasks();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // ── Steady-state upkeep ──────────────────────────────────────────

    /// Fetch every sub-record as ordinary correlated commands. Failures
    /// are logged, not propagated: a partial initial state fills in as
    /// pushes arrive.
    async fn fetch_full_state(&self) {
        if let Err(e) = self.get_status().await {
            warn!(device_id = %self.inner.device_id, error = %e, "initial status fetch failed");
        }
        if let Err(e) = self.get_settings().await {
            warn!(device_id = %self.inner.device_id, error = %e, "initial settings fetch failed");
        }
        if let Err(e) = self.get_sensors().await {
            warn!(device_id = %self.inner.device_id, error = %e, "initial sensor fetch failed");
        }
        if let Err(e) = self.get_control().await {
            warn!(device_id = %self.inner.device_id, error = %e, "initial control fetch failed");
        }
    }

    /// Ask the device to push every sensor category unsolicited.
    async fn enable_sensor_push(&self) {
        let body = CommandBody {
            control: Some(ControlPayload {
                sensor_push: Some(SensorPushFlags::all()),
                ..ControlPayload::default()
            }),
            ..CommandBody::default()
        };
        if let Err(e) = self.send_command(CommandKind::PutControl, body).await {
            warn!(device_id = %self.inner.device_id, error = %e, "enabling sensor push failed");
        }
    }

    fn spawn_refetch(&self) {
        let session = self.clone();
        let cancel = self.inner.cancel.clone();
        self.track_task(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = async {
                    session.fetch_full_state().await;
                    session.enable_sensor_push().await;
                } => {}
            }
        }));
    }

    fn spawn_probe(&self) {
        if !self.inner.config.prefer_local
            || self.inner.config.local.is_none()
            || self.inner.stopped.load(Ordering::SeqCst)
        {
            return;
        }
        let session = self.clone();
        let cancel = self.inner.cancel.clone();
        self.track_task(tokio::spawn(probe_loop(session, cancel)));
    }
}

// ── Background loops ─────────────────────────────────────────────────

/// Consume the transport event stream: frames in arrival order, state
/// transitions filtered by generation so superseded transports cannot
/// corrupt the connection sub-record. Late response frames from a
/// superseded transport still resolve through the correlation table.
async fn pump_loop(
    session: DeviceSession,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            TransportEvent::Frame { payload, .. } => session.handle_frame(&payload),
            TransportEvent::State {
                generation,
                state,
                kind,
                error,
            } => {
                if generation != session.inner.active_generation.load(Ordering::SeqCst) {
                    debug!(
                        device_id = %session.inner.device_id,
                        generation,
                        "ignoring state event from superseded transport"
                    );
                } else if !session.inner.stopped.load(Ordering::SeqCst) {
                    session.handle_state_change(state, kind, error);
                }
            }
        }
    }
}

/// Low-frequency probe for the LAN path while connected via cloud. On
/// a successful handshake the probe transport becomes the active one;
/// the cloud transport lingers for a grace period so in-flight
/// commands are not dropped.
async fn probe_loop(session: DeviceSession, cancel: CancellationToken) {
    let interval = session.inner.config.probe_interval;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        if session.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if session.active_kind() == Some(TransportKind::Local) {
            return;
        }
        let Some(target) = session.local_target() else {
            return;
        };

        debug!(device_id = %session.inner.device_id, "probing local endpoint");
        let transport = session.build_transport(target, session.local_backoff());
        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                transport.close().await;
                return;
            }
            result = transport.connect() => result,
        };
        match connected {
            Ok(()) => {
                info!(
                    device_id = %session.inner.device_id,
                    "local endpoint reachable, promoting from cloud"
                );
                session.adopt_transport(transport, true).await;
                return;
            }
            Err(e) => {
                debug!(
                    device_id = %session.inner.device_id,
                    error = %e,
                    "local probe failed, staying on cloud"
                );
                transport.close().await;
            }
        }
    }
}

/// The local transport exhausted its retries: establish a cloud
/// connection, adopt it, and resume probing for promotion.
async fn failover_loop(session: DeviceSession, cancel: CancellationToken) {
    warn!(device_id = %session.inner.device_id, "local connection lost, failing over to cloud");
    let mut backoff = Backoff::new(&session.inner.config.backoff);

    loop {
        if session.inner.stopped.load(Ordering::SeqCst) || cancel.is_cancelled() {
            break;
        }

        let attempt_error: CoreError = match session.cloud_target().await {
            Ok(target) => {
                let transport = session.build_transport(target, session.cloud_backoff());
                let connected = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        transport.close().await;
                        break;
                    }
                    result = transport.connect() => result,
                };
                match connected {
                    Ok(()) => {
                        session.adopt_transport(transport, false).await;
                        session.spawn_probe();
                        break;
                    }
                    Err(e) => {
                        transport.close().await;
                        e.into()
                    }
                }
            }
            Err(e) => e,
        };

        if matches!(
            attempt_error,
            CoreError::AuthExpired | CoreError::Auth { .. }
        ) {
            // Only the host application can fix dead credentials; the
            // session stays observably disconnected.
            warn!(
                device_id = %session.inner.device_id,
                error = %attempt_error,
                "failover blocked on credentials"
            );
            break;
        }
        warn!(
            device_id = %session.inner.device_id,
            error = %attempt_error,
            "cloud failover attempt failed"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(backoff.next_delay()) => {}
        }
    }

    session.inner.failing_over.store(false, Ordering::SeqCst);
}
