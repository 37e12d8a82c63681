use std::sync::Arc;

use serde::Serialize;

use super::state::DeviceState;

/// Which sub-record an accepted state change replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceEventKind {
    SensorUpdate,
    SettingsUpdate,
    ControlUpdate,
    StatusUpdate,
    ConnectionChange,
}

/// One state change, delivered to every subscriber with the full
/// snapshot that resulted from it. Ephemeral: produced once, never
/// retained.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub state: Arc<DeviceState>,
}
