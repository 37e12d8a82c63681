//! Protocol and cloud plumbing for Perch cameras.
//!
//! This crate owns everything below the device session: the framed
//! binary codec ([`wire`]), request/response correlation ([`pending`]),
//! the credential lifecycle ([`auth`]), the cloud REST surface
//! ([`rest`]), and the supervised WebSocket transport ([`transport`])
//! with its reconnect/keepalive loops. `perch-core` composes these into
//! per-device sessions.

pub mod auth;
pub mod error;
pub mod pending;
pub mod rest;
pub mod transport;
pub mod wire;

pub use auth::{RotationHandle, TokenManager};
pub use error::{CancelReason, Error};
pub use pending::PendingRequests;
pub use rest::{CloudEvent, DeviceRecord, LoginOutcome, RestClient, TokenPair};
pub use transport::{
    Backoff, BackoffConfig, ConnectTarget, ConnectionState, Transport, TransportEvent,
    TransportKind, TransportTimings,
};
