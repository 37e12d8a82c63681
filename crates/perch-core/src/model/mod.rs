// Domain model: immutable device-state snapshots and change events.

mod convert;
mod event;
mod state;

pub use event::{DeviceEvent, DeviceEventKind};
pub use state::{
    ConnectionInfo, ControlState, DeviceState, SensorState, SettingsState, StateUpdate,
    StatusState,
};
