// ── Wire payload -> domain state conversion ──

use perch_api::wire::{
    ControlPayload, Push, SensorKind, SensorSample, SettingsPayload, StatusPayload,
};

use super::state::{ControlState, SensorState, SettingsState, StateUpdate, StatusState};

impl From<SettingsPayload> for SettingsState {
    fn from(payload: SettingsPayload) -> Self {
        Self {
            night_vision: payload.night_vision,
            volume: payload.volume,
            sleep_mode: payload.sleep_mode,
            status_light_on: payload.status_light_on,
            mic_mute_on: payload.mic_mute_on,
            wifi_band: payload.wifi_band,
            mounting_mode: payload.mounting_mode,
        }
    }
}

impl From<ControlPayload> for ControlState {
    fn from(payload: ControlPayload) -> Self {
        Self {
            night_light: payload.night_light,
            night_light_timeout: payload.night_light_timeout,
            sensor_push_enabled: payload.sensor_push.map(|flags| flags.any()),
        }
    }
}

impl From<StatusPayload> for StatusState {
    fn from(payload: StatusPayload) -> Self {
        Self {
            connected_to_server: payload.connected_to_server,
            firmware_version: payload.firmware_version,
            hardware_version: payload.hardware_version,
            mounting_mode: payload.mounting_mode,
        }
    }
}

impl SensorState {
    /// Fold a batch of samples into this state. Sensors absent from the
    /// batch keep their current values -- the device reports deltas, not
    /// full sweeps.
    #[allow(clippy::cast_precision_loss)]
    pub fn merged_with(&self, samples: &[SensorSample]) -> Self {
        let mut next = self.clone();
        for sample in samples {
            match sample.sensor {
                SensorKind::Temperature => {
                    next.temperature = scaled_value(sample).or(next.temperature);
                }
                SensorKind::Humidity => {
                    next.humidity = scaled_value(sample).or(next.humidity);
                }
                SensorKind::Light => {
                    next.light_level = sample.value.or(next.light_level);
                }
                SensorKind::Sound => next.sound_alert = sample.alert,
                SensorKind::Motion => next.motion_alert = sample.alert,
                SensorKind::Night => {
                    next.night = sample.value.map(|v| v != 0).unwrap_or(next.night);
                }
            }
        }
        next
    }
}

/// Prefer the fine-grained milli reading when present.
#[allow(clippy::cast_precision_loss)]
fn scaled_value(sample: &SensorSample) -> Option<f64> {
    sample
        .value_milli
        .map(|milli| milli as f64 / 1000.0)
        .or_else(|| sample.value.map(|v| v as f64))
}

impl StateUpdate {
    /// Map an unsolicited push onto the sub-record it replaces.
    /// `current_sensors` feeds the delta merge for sensor pushes.
    pub fn from_push(push: Push, current_sensors: &SensorState) -> Self {
        match push {
            Push::Sensors { sensors } => {
                Self::Sensors(current_sensors.merged_with(&sensors))
            }
            Push::Settings { settings } => Self::Settings(settings.into()),
            Push::Control { control } => Self::Control(control.into()),
            Push::Status { status } => Self::Status(status.into()),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
