// ── Device state ──
//
// One immutable snapshot per device, composed of independently
// replaceable sub-records. Every accepted frame or command response
// produces a new snapshot with exactly one sub-record swapped; a
// published snapshot is always internally consistent.

use chrono::{DateTime, Utc};
use perch_api::transport::{ConnectionState, TransportKind};
use perch_api::wire::{MountingMode, NightLight, WifiBand};
use serde::Serialize;

use super::event::DeviceEventKind;

/// Complete snapshot of everything known about one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    pub connection: ConnectionInfo,
    pub sensors: SensorState,
    pub settings: SettingsState,
    pub control: ControlState,
    pub status: StatusState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub transport: TransportKind,
    /// Last moment the connection was known good.
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorState {
    /// Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    /// Ambient light level, lux.
    pub light_level: Option<i64>,
    pub sound_alert: bool,
    pub motion_alert: bool,
    /// True when the device considers the room dark.
    pub night: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingsState {
    pub night_vision: Option<bool>,
    /// 0..=100.
    pub volume: Option<u8>,
    pub sleep_mode: Option<bool>,
    pub status_light_on: Option<bool>,
    pub mic_mute_on: Option<bool>,
    pub wifi_band: Option<WifiBand>,
    pub mounting_mode: Option<MountingMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlState {
    pub night_light: Option<NightLight>,
    pub night_light_timeout: Option<u32>,
    pub sensor_push_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusState {
    pub connected_to_server: Option<bool>,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    pub mounting_mode: Option<MountingMode>,
}

// ── Sub-record replacement ───────────────────────────────────────────

/// The closed set of state mutations. Each variant replaces exactly one
/// sub-record; applying one to a snapshot leaves every other sub-record
/// untouched.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    Sensors(SensorState),
    Settings(SettingsState),
    Control(ControlState),
    Status(StatusState),
    Connection(ConnectionInfo),
}

impl StateUpdate {
    /// The event kind subscribers see for this update.
    pub fn event_kind(&self) -> DeviceEventKind {
        match self {
            Self::Sensors(_) => DeviceEventKind::SensorUpdate,
            Self::Settings(_) => DeviceEventKind::SettingsUpdate,
            Self::Control(_) => DeviceEventKind::ControlUpdate,
            Self::Status(_) => DeviceEventKind::StatusUpdate,
            Self::Connection(_) => DeviceEventKind::ConnectionChange,
        }
    }

    /// Produce the successor snapshot.
    pub fn apply(self, old: &DeviceState) -> DeviceState {
        let mut next = old.clone();
        match self {
            Self::Sensors(sensors) => next.sensors = sensors,
            Self::Settings(settings) => next.settings = settings,
            Self::Control(control) => next.control = control,
            Self::Status(status) => next.status = status,
            Self::Connection(connection) => next.connection = connection,
        }
        next
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sensors(temp: f64) -> SensorState {
        SensorState {
            temperature: Some(temp),
            ..SensorState::default()
        }
    }

    fn settings(volume: u8) -> SettingsState {
        SettingsState {
            volume: Some(volume),
            ..SettingsState::default()
        }
    }

    #[test]
    fn apply_replaces_exactly_one_sub_record() {
        let base = DeviceState::default();
        let next = StateUpdate::Sensors(sensors(21.5)).apply(&base);

        assert_eq!(next.sensors.temperature, Some(21.5));
        assert_eq!(next.settings, base.settings);
        assert_eq!(next.control, base.control);
        assert_eq!(next.status, base.status);
        assert_eq!(next.connection, base.connection);
    }

    #[test]
    fn disjoint_updates_commute_to_per_record_last_write() {
        // Two interleavings of updates touching disjoint sub-records
        // end in the same snapshot: the last write per sub-record.
        let updates_a = [
            StateUpdate::Sensors(sensors(20.0)),
            StateUpdate::Settings(settings(10)),
            StateUpdate::Sensors(sensors(22.0)),
            StateUpdate::Settings(settings(40)),
        ];
        let updates_b = [
            StateUpdate::Settings(settings(10)),
            StateUpdate::Sensors(sensors(20.0)),
            StateUpdate::Settings(settings(40)),
            StateUpdate::Sensors(sensors(22.0)),
        ];

        let fold = |updates: &[StateUpdate]| {
            updates
                .iter()
                .fold(DeviceState::default(), |state, update| {
                    update.clone().apply(&state)
                })
        };

        let final_a = fold(&updates_a);
        let final_b = fold(&updates_b);
        assert_eq!(final_a, final_b);
        assert_eq!(final_a.sensors.temperature, Some(22.0));
        assert_eq!(final_a.settings.volume, Some(40));
    }

    #[test]
    fn event_kind_matches_the_sub_record() {
        assert_eq!(
            StateUpdate::Connection(ConnectionInfo::default()).event_kind(),
            DeviceEventKind::ConnectionChange
        );
        assert_eq!(
            StateUpdate::Status(StatusState::default()).event_kind(),
            DeviceEventKind::StatusUpdate
        );
    }
}
