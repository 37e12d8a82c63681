#![allow(clippy::unwrap_used)]
// End-to-end session tests against an in-process camera stub speaking
// the wire protocol over plain WebSocket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use perch_api::wire::{
    self, CommandKind, ControlPayload, NightLight, Push, Request, Response, SensorKind,
    SensorSample, SettingsPayload, StatusPayload,
};
use perch_api::{BackoffConfig, TransportTimings};
use perch_core::{
    Client, ClientConfig, ConnectionState, CoreError, DeviceEventKind, LocalEndpoint,
    SessionConfig, SettingsChange, TransportKind,
};

// ── Camera stub ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct StubOptions {
    /// Ops the stub receives but never answers.
    silent_ops: Vec<CommandKind>,
    /// Ops answered only after a delay.
    delays: Vec<(CommandKind, Duration)>,
}

struct CameraStub {
    addr: SocketAddr,
    /// Every request the stub decoded, in arrival order.
    requests: mpsc::UnboundedReceiver<Request>,
    /// Frames broadcast to every live connection (pushes, late replies).
    inject: broadcast::Sender<Bytes>,
    connections: Arc<AtomicUsize>,
}

fn canned_response(request: &Request) -> Response {
    let id = request.id;
    match request.op {
        CommandKind::GetStatus => Response {
            id,
            status: Some(StatusPayload {
                connected_to_server: Some(true),
                firmware_version: Some("3.2.1".into()),
                ..StatusPayload::default()
            }),
            ..Response::default()
        },
        CommandKind::GetSettings => Response {
            id,
            settings: Some(SettingsPayload {
                volume: Some(25),
                night_vision: Some(true),
                ..SettingsPayload::default()
            }),
            ..Response::default()
        },
        CommandKind::PutSettings => Response {
            id,
            settings: request.body.settings.clone(),
            ..Response::default()
        },
        CommandKind::GetSensors => Response {
            id,
            sensors: Some(vec![SensorSample {
                sensor: SensorKind::Temperature,
                value: None,
                value_milli: Some(20_500),
                alert: false,
                timestamp: None,
            }]),
            ..Response::default()
        },
        CommandKind::GetControl | CommandKind::PutControl => Response {
            id,
            control: Some(request.body.control.clone().unwrap_or_else(|| {
                ControlPayload {
                    night_light: Some(NightLight::Off),
                    ..ControlPayload::default()
                }
            })),
            ..Response::default()
        },
        CommandKind::PutStreaming => Response {
            id,
            ..Response::default()
        },
    }
}

fn start_camera_stub_on(listener: TcpListener, options: StubOptions) -> CameraStub {
    let addr = listener.local_addr().unwrap();
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (inject_tx, _) = broadcast::channel(64);
    let connections = Arc::new(AtomicUsize::new(0));

    let inject = inject_tx.clone();
    let conn_counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conn_counter.fetch_add(1, Ordering::SeqCst);
            let options = options.clone();
            let requests_tx = requests_tx.clone();
            let mut inject_rx = inject_tx.subscribe();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
                loop {
                    tokio::select! {
                        Some(frame) = out_rx.recv() => {
                            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                                return;
                            }
                        }
                        Ok(frame) = inject_rx.recv() => {
                            if sink.send(WsMessage::Binary(frame)).await.is_err() {
                                return;
                            }
                        }
                        message = source.next() => {
                            let payload = match message {
                                Some(Ok(WsMessage::Binary(payload))) => payload,
                                Some(Ok(_)) => continue,
                                None | Some(Err(_)) => return,
                            };
                            let Ok(wire::Message::Request(request)) = wire::decode(&payload) else {
                                continue; // keepalives and anything else
                            };
                            let _ = requests_tx.send(request.clone());
                            if options.silent_ops.contains(&request.op) {
                                continue;
                            }
                            let frame =
                                wire::encode(&wire::Message::Response(canned_response(&request)))
                                    .unwrap();
                            let delay = options
                                .delays
                                .iter()
                                .find(|(op, _)| *op == request.op)
                                .map(|(_, d)| *d);
                            if let Some(delay) = delay {
                                let out_tx = out_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = out_tx.send(frame);
                                });
                            } else {
                                let _ = out_tx.send(frame);
                            }
                        }
                    }
                }
            });
        }
    });

    CameraStub {
        addr,
        requests: requests_rx,
        inject,
        connections,
    }
}

async fn start_camera_stub(options: StubOptions) -> CameraStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    start_camera_stub_on(listener, options)
}

// ── Fixture helpers ─────────────────────────────────────────────────

fn test_session_config(request_timeout: Duration) -> SessionConfig {
    SessionConfig {
        request_timeout,
        probe_interval: Duration::from_millis(150),
        timings: TransportTimings {
            keepalive_interval: Duration::from_millis(100),
            idle_read_timeout: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(2),
        },
        backoff: BackoffConfig {
            base: Duration::from_millis(50),
            factor: 1.618,
            cap: Duration::from_secs(1),
            first_jitter: Duration::ZERO,
            max_retries: None,
        },
        ..SessionConfig::default()
    }
}

fn client_for(stub_addr: SocketAddr) -> Client {
    let config = ClientConfig {
        ws_base: format!("ws://{stub_addr}").parse().unwrap(),
        ..ClientConfig::default()
    };
    let client = Client::new(config).unwrap();
    client.restore_credentials(
        SecretString::from("test-access".to_owned()),
        SecretString::from("test-refresh".to_owned()),
    );
    client
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn push_frame(push: Push) -> Bytes {
    wire::encode(&wire::Message::Push(push)).unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn cloud_session_lifecycle_and_push_aggregation() {
    let stub = start_camera_stub(StubOptions::default()).await;
    let client = client_for(stub.addr);

    let session = client
        .camera("cam-1", test_session_config(Duration::from_secs(2)))
        .unwrap();

    let seen_kinds: Arc<Mutex<Vec<DeviceEventKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen_kinds);
    let _subscription = session.subscribe(move |event| {
        sink.lock().unwrap().push(event.kind);
    });

    session.start().await.unwrap();

    // Initial fetch populated every sub-record.
    let state = session.state();
    assert_eq!(state.connection.state, ConnectionState::Connected);
    assert_eq!(state.connection.transport, TransportKind::Cloud);
    assert_eq!(state.status.firmware_version.as_deref(), Some("3.2.1"));
    assert_eq!(state.settings.volume, Some(25));
    assert_eq!(state.sensors.temperature, Some(20.5));

    // A second `camera()` for the same id reuses the session: still
    // exactly one connection to the device.
    let again = client
        .camera("cam-1", test_session_config(Duration::from_secs(2)))
        .unwrap();
    again.start().await.unwrap();
    assert_eq!(stub.connections.load(Ordering::SeqCst), 1);

    // An unsolicited push replaces exactly one sub-record.
    stub.inject
        .send(push_frame(Push::Sensors {
            sensors: vec![SensorSample {
                sensor: SensorKind::Temperature,
                value: None,
                value_milli: Some(30_000),
                alert: false,
                timestamp: None,
            }],
        }))
        .unwrap();
    wait_until(
        || session.state().sensors.temperature == Some(30.0),
        "sensor push to land",
    )
    .await;
    assert_eq!(session.state().settings.volume, Some(25));
    assert!(
        seen_kinds
            .lock()
            .unwrap()
            .contains(&DeviceEventKind::SensorUpdate)
    );

    // A command updates its sub-record from the response.
    let settings = session
        .set_settings(SettingsChange {
            volume: Some(55),
            ..SettingsChange::default()
        })
        .await
        .unwrap();
    assert_eq!(settings.volume, Some(55));
    assert_eq!(session.state().settings.volume, Some(55));

    session.stop().await;
    assert_eq!(session.in_flight(), 0);

    // Stopping is terminal and idempotent.
    session.stop().await;
    assert!(matches!(
        session.set_settings(SettingsChange {
            volume: Some(10),
            ..SettingsChange::default()
        })
        .await,
        Err(CoreError::SessionStopped)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_range_volume_is_rejected_before_any_frame() {
    let stub = start_camera_stub(StubOptions::default()).await;
    let client = client_for(stub.addr);
    let session = client
        .camera("cam-2", test_session_config(Duration::from_secs(2)))
        .unwrap();
    session.start().await.unwrap();

    let result = session
        .set_settings(SettingsChange {
            volume: Some(150),
            ..SettingsChange::default()
        })
        .await;
    assert!(matches!(result, Err(CoreError::Validation { .. })));
    assert_eq!(session.in_flight(), 0);

    // An empty change is rejected the same way.
    let result = session.set_settings(SettingsChange::default()).await;
    assert!(matches!(result, Err(CoreError::Validation { .. })));

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_timeout_names_the_request_and_discards_the_late_response() {
    let mut stub = start_camera_stub(StubOptions {
        silent_ops: vec![CommandKind::GetSensors],
        ..StubOptions::default()
    })
    .await;
    let client = client_for(stub.addr);
    let session = client
        .camera("cam-3", test_session_config(Duration::from_millis(300)))
        .unwrap();
    session.start().await.unwrap();

    let result = session.get_sensors().await;
    let Err(CoreError::RequestTimeout { op, id, timeout }) = result else {
        panic!("expected RequestTimeout, got {result:?}");
    };
    assert_eq!(op, CommandKind::GetSensors);
    assert_eq!(timeout, Duration::from_millis(300));
    assert_eq!(session.in_flight(), 0);

    // The stub really saw that request id.
    let mut observed = None;
    while let Ok(request) = stub.requests.try_recv() {
        if request.op == CommandKind::GetSensors {
            observed = Some(request.id);
        }
    }
    assert_eq!(observed, Some(id));

    // A late response for the expired id is resolved as no-match and
    // discarded -- ids are never reused, so it cannot hit a new call.
    stub.inject
        .send(
            wire::encode(&wire::Message::Response(Response {
                id,
                sensors: Some(vec![SensorSample {
                    sensor: SensorKind::Temperature,
                    value: None,
                    value_milli: Some(99_000),
                    alert: false,
                    timestamp: None,
                }]),
                ..Response::default()
            }))
            .unwrap(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ne!(session.state().sensors.temperature, Some(99.0));
    assert_eq!(session.in_flight(), 0);

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn local_refused_falls_back_to_cloud_then_promotes_without_dropping_commands() {
    // Reserve a port for the "camera LAN endpoint", then release it so
    // the first local connect is refused.
    let local_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    };

    // Cloud path answers get_status slowly, so a promotion can land
    // while that command is in flight.
    let cloud_stub = start_camera_stub(StubOptions {
        delays: vec![(CommandKind::GetStatus, Duration::from_millis(600))],
        ..StubOptions::default()
    })
    .await;
    let client = client_for(cloud_stub.addr);

    let mut config = test_session_config(Duration::from_secs(3));
    config.local = Some(LocalEndpoint {
        ip: "127.0.0.1".parse().unwrap(),
        port: local_port,
        token: SecretString::from("local-token".to_owned()),
        use_tls: false,
    });

    let session = client.camera("cam-4", config).unwrap();
    session.start().await.unwrap();

    // Local connect was refused; we are on the cloud relay.
    assert_eq!(session.state().connection.transport, TransportKind::Cloud);
    assert_eq!(session.state().connection.state, ConnectionState::Connected);

    // The LAN endpoint comes alive; the probe will find it.
    let local_listener = TcpListener::bind(("127.0.0.1", local_port)).await.unwrap();
    let _local_stub = start_camera_stub_on(local_listener, StubOptions::default());

    // Issue a slow command against the cloud transport right away.
    let in_flight = {
        let session = session.clone();
        tokio::spawn(async move { session.get_status().await })
    };

    wait_until(
        || session.state().connection.transport == TransportKind::Local,
        "promotion to the local transport",
    )
    .await;
    assert_eq!(session.state().connection.state, ConnectionState::Connected);

    // The command issued before the swap still resolves: the cloud
    // transport lingers for the grace period and late responses route
    // through the shared correlation table.
    let status = in_flight.await.unwrap().unwrap();
    assert_eq!(status.firmware_version.as_deref(), Some("3.2.1"));

    session.stop().await;
    assert_eq!(session.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_silences_subscribers_and_clears_pending() {
    let stub = start_camera_stub(StubOptions::default()).await;
    let client = client_for(stub.addr);
    let session = client
        .camera("cam-5", test_session_config(Duration::from_secs(2)))
        .unwrap();

    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let subscription = session.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.start().await.unwrap();
    wait_until(|| events.load(Ordering::SeqCst) > 0, "initial events").await;

    // Unsubscribing stops delivery even while the session lives on.
    subscription.unsubscribe();
    let before = events.load(Ordering::SeqCst);
    stub.inject
        .send(push_frame(Push::Status {
            status: StatusPayload {
                connected_to_server: Some(false),
                ..StatusPayload::default()
            },
        }))
        .unwrap();
    wait_until(
        || session.state().status.connected_to_server == Some(false),
        "push after unsubscribe",
    )
    .await;
    assert_eq!(events.load(Ordering::SeqCst), before);

    session.stop().await;
    assert_eq!(session.in_flight(), 0);
    assert_ne!(
        session.state().connection.state,
        ConnectionState::Connected
    );

    // Nothing runs afterwards: repeated stop is immediate and the
    // counter stays frozen.
    session.stop().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(events.load(Ordering::SeqCst), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn camera_requires_authentication() {
    let client = Client::new(ClientConfig::default()).unwrap();
    let result = client.camera("cam-6", SessionConfig::default());
    assert!(matches!(result, Err(CoreError::NotAuthenticated)));
}
