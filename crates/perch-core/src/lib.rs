//! Device-session engine for Perch cameras.
//!
//! This crate composes the plumbing in `perch-api` into the long-lived
//! client the host application talks to:
//!
//! - **[`Client`]** — Top-level factory. Owns the credential (one
//!   [`TokenManager`](perch_api::TokenManager) shared by every session)
//!   and the session registry; at most one [`DeviceSession`] ever
//!   exists per device id.
//!
//! - **[`DeviceSession`]** — The single authority for one device.
//!   Local-first connect with cloud fallback, background promotion back
//!   to the LAN path, strictly ordered state aggregation, and
//!   correlated command execution with per-call timeouts.
//!
//! - **Domain model** ([`model`]) — Immutable [`DeviceState`] snapshots
//!   composed of independently replaceable sub-records, plus the
//!   [`DeviceEvent`] stream subscribers observe.
//!
//! - **[`config`]** — Runtime configuration types. Core never reads
//!   config files; the host constructs these and hands them in.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::Client;
pub use config::{ClientConfig, LocalEndpoint, SessionConfig};
pub use error::CoreError;
pub use session::{
    ControlChange, DeviceSession, SettingsChange, SubscriptionHandle, media_stream_url,
};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    ConnectionInfo, ControlState, DeviceEvent, DeviceEventKind, DeviceState, SensorState,
    SettingsState, StateUpdate, StatusState,
};

// Plumbing types that surface in this crate's public API.
pub use perch_api::transport::{ConnectionState, TransportKind};
pub use perch_api::{CloudEvent, DeviceRecord, LoginOutcome, TokenPair};
