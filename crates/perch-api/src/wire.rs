// ── Wire codec ──
//
// Pure encode/decode for the camera's framed binary protocol. Each frame
// is a fixed little-endian header followed by a JSON payload:
//
//   magic u16 | version u8 | kind u8 | payload_len u32 | payload...
//
// No I/O and no state -- safe to call from any task. Decoding is
// defensive: unknown JSON fields are ignored and a frame or push kind
// that fits no known shape yields `Message::Unrecognized`, never an
// error. Firmware updates add fields and kinds without warning.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const FRAME_MAGIC: u16 = 0x5043;
pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

const KIND_KEEPALIVE: u8 = 0;
const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_PUSH: u8 = 3;

// ── Message ──────────────────────────────────────────────────────────

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Periodic no-op frame. Carries no payload.
    Keepalive,
    /// A correlated command (client -> device).
    Request(Request),
    /// The device's reply to a [`Request`], echoing its id.
    Response(Response),
    /// Unsolicited state report from the device.
    Push(Push),
    /// A frame whose kind or shape this client does not know.
    Unrecognized { kind: u8 },
}

impl Message {
    /// Extract the response, or `None` for every other kind.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(r) => Some(r),
            _ => None,
        }
    }

    /// Extract the push, or `None` for every other kind.
    pub fn into_push(self) -> Option<Push> {
        match self {
            Self::Push(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::Keepalive)
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// The command vocabulary. The `op` field of every request frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    GetStatus,
    GetSettings,
    GetSensors,
    GetControl,
    PutSettings,
    PutControl,
    PutStreaming,
}

/// A correlated command. The id is chosen by the caller and echoed back
/// in the matching [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: CommandKind,
    #[serde(flatten)]
    pub body: CommandBody,
}

/// Optional payload sections of a request. Only the sections relevant to
/// the `op` are populated; absent sections are omitted from the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingPayload>,
}

// ── Responses ────────────────────────────────────────────────────────

/// A device reply. Which sections are present depends on the request the
/// device is answering; anything it sends beyond the known set lands in
/// `extra` so nothing is silently dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Vec<SensorSample>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ── Pushes ───────────────────────────────────────────────────────────

/// An unsolicited state report. The `kind` tag names the single state
/// sub-record the push replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Push {
    Sensors { sensors: Vec<SensorSample> },
    Settings { settings: SettingsPayload },
    Control { control: ControlPayload },
    Status { status: StatusPayload },
}

impl Push {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Sensors { .. } => "sensors",
            Self::Settings { .. } => "settings",
            Self::Control { .. } => "control",
            Self::Status { .. } => "status",
        }
    }
}

// ── Payload sections ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Sound,
    Motion,
    Temperature,
    Humidity,
    Light,
    Night,
}

/// One sensor reading. Fine-grained sensors report `value_milli`
/// (thousandths); coarse ones report `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub sensor: SensorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_milli: Option<i64>,
    #[serde(default)]
    pub alert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiBand {
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "2.4ghz")]
    Band24Ghz,
    #[serde(rename = "5ghz")]
    Band5Ghz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountingMode {
    Stand,
    Travel,
    Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NightLight {
    On,
    Off,
}

/// Device settings. All fields optional: a partial payload in a
/// `put_settings` request changes only the fields it carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night_vision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_light_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_mute_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_band: Option<WifiBand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounting_mode: Option<MountingMode>,
}

/// Which sensor categories the device should push unsolicited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorPushFlags {
    #[serde(default)]
    pub sound: bool,
    #[serde(default)]
    pub motion: bool,
    #[serde(default)]
    pub temperature: bool,
    #[serde(default)]
    pub humidity: bool,
    #[serde(default)]
    pub light: bool,
    #[serde(default)]
    pub night: bool,
}

impl SensorPushFlags {
    /// Enable every category.
    pub fn all() -> Self {
        Self {
            sound: true,
            motion: true,
            temperature: true,
            humidity: true,
            light: true,
            night: true,
        }
    }

    pub fn any(&self) -> bool {
        self.sound || self.motion || self.temperature || self.humidity || self.light || self.night
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night_light: Option<NightLight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub night_light_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_push: Option<SensorPushFlags>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_to_server: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounting_mode: Option<MountingMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTarget {
    Mobile,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingStatus {
    Started,
    Stopped,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingPayload {
    pub id: StreamTarget,
    pub status: StreamingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ── Encode ───────────────────────────────────────────────────────────

/// Serialize a message to a complete frame.
pub fn encode(msg: &Message) -> Result<Bytes, Error> {
    let (kind, payload) = match msg {
        Message::Keepalive => (KIND_KEEPALIVE, Vec::new()),
        Message::Request(r) => (KIND_REQUEST, to_payload(r)?),
        Message::Response(r) => (KIND_RESPONSE, to_payload(r)?),
        Message::Push(p) => (KIND_PUSH, to_payload(p)?),
        Message::Unrecognized { kind } => {
            return Err(Error::Protocol {
                message: format!("cannot encode unrecognized frame kind {kind}"),
            });
        }
    };

    let len = u32::try_from(payload.len()).map_err(|_| Error::Protocol {
        message: format!("payload too large: {} bytes", payload.len()),
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16_le(FRAME_MAGIC);
    buf.put_u8(FRAME_VERSION);
    buf.put_u8(kind);
    buf.put_u32_le(len);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Build a serialized request frame ready to send.
pub fn build_command(id: u64, op: CommandKind, body: CommandBody) -> Result<Bytes, Error> {
    encode(&Message::Request(Request { id, op, body }))
}

/// Build a serialized keepalive frame. Infallible -- the frame is a bare
/// header.
pub fn build_keepalive() -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u16_le(FRAME_MAGIC);
    buf.put_u8(FRAME_VERSION);
    buf.put_u8(KIND_KEEPALIVE);
    buf.put_u32_le(0);
    buf.freeze()
}

// ── Decode ───────────────────────────────────────────────────────────

/// Parse a complete frame.
///
/// Fails with [`Error::Protocol`] on a corrupt header or malformed JSON.
/// A structurally valid frame of an unknown kind decodes to
/// [`Message::Unrecognized`].
pub fn decode(data: &[u8]) -> Result<Message, Error> {
    if data.len() < HEADER_LEN {
        return Err(Error::Protocol {
            message: format!("frame too short: {} bytes", data.len()),
        });
    }

    let mut buf = data;
    let magic = buf.get_u16_le();
    if magic != FRAME_MAGIC {
        return Err(Error::Protocol {
            message: format!("bad frame magic {magic:#06x}"),
        });
    }
    let version = buf.get_u8();
    if version != FRAME_VERSION {
        return Err(Error::Protocol {
            message: format!("unsupported frame version {version}"),
        });
    }
    let kind = buf.get_u8();
    let declared = buf.get_u32_le() as usize;
    if declared != buf.remaining() {
        return Err(Error::Protocol {
            message: format!(
                "payload length mismatch: header says {declared}, got {}",
                buf.remaining()
            ),
        });
    }

    match kind {
        KIND_KEEPALIVE => Ok(Message::Keepalive),
        KIND_REQUEST => from_payload(buf).map(Message::Request),
        KIND_RESPONSE => from_payload(buf).map(Message::Response),
        KIND_PUSH => {
            // Two-stage parse: malformed JSON is a protocol error, but a
            // well-formed push of an unknown kind is merely unrecognized.
            let value: serde_json::Value =
                serde_json::from_slice(buf).map_err(|e| Error::Protocol {
                    message: format!("malformed push payload: {e}"),
                })?;
            match serde_json::from_value::<Push>(value) {
                Ok(push) => Ok(Message::Push(push)),
                Err(_) => Ok(Message::Unrecognized { kind }),
            }
        }
        other => Ok(Message::Unrecognized { kind: other }),
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::Protocol {
        message: format!("serialize failed: {e}"),
    })
}

fn from_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(payload).map_err(|e| Error::Protocol {
        message: format!("malformed payload: {e}"),
    })
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_roundtrip() {
        let frame = build_keepalive();
        assert_eq!(frame.len(), HEADER_LEN);
        assert_eq!(decode(&frame).unwrap(), Message::Keepalive);
    }

    #[test]
    fn request_roundtrip() {
        let frame = build_command(
            42,
            CommandKind::PutSettings,
            CommandBody {
                settings: Some(SettingsPayload {
                    volume: Some(70),
                    night_vision: Some(true),
                    ..SettingsPayload::default()
                }),
                ..CommandBody::default()
            },
        )
        .unwrap();

        let Message::Request(req) = decode(&frame).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.id, 42);
        assert_eq!(req.op, CommandKind::PutSettings);
        let settings = req.body.settings.unwrap();
        assert_eq!(settings.volume, Some(70));
        assert_eq!(settings.night_vision, Some(true));
        assert!(req.body.control.is_none());
    }

    #[test]
    fn response_roundtrip() {
        let msg = Message::Response(Response {
            id: 7,
            sensors: Some(vec![SensorSample {
                sensor: SensorKind::Temperature,
                value: None,
                value_milli: Some(21_500),
                alert: false,
                timestamp: Some(1_700_000_000),
            }]),
            ..Response::default()
        });
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn push_roundtrip() {
        let msg = Message::Push(Push::Settings {
            settings: SettingsPayload {
                sleep_mode: Some(true),
                ..SettingsPayload::default()
            },
        });
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let payload =
            br#"{"id":9,"settings":{"volume":30,"hologram_mode":true},"firmware_blob":"x"}"#;
        let mut frame = BytesMut::new();
        frame.put_u16_le(FRAME_MAGIC);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(2); // response
        frame.put_u32_le(u32::try_from(payload.len()).unwrap());
        frame.put_slice(payload);

        let Message::Response(resp) = decode(&frame).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(resp.id, 9);
        assert_eq!(resp.settings.unwrap().volume, Some(30));
        // Unknown top-level fields survive in `extra`.
        assert!(resp.extra.contains_key("firmware_blob"));
    }

    #[test]
    fn unknown_frame_kind_is_unrecognized() {
        let mut frame = BytesMut::new();
        frame.put_u16_le(FRAME_MAGIC);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(200);
        frame.put_u32_le(2);
        frame.put_slice(b"{}");
        assert_eq!(
            decode(&frame).unwrap(),
            Message::Unrecognized { kind: 200 }
        );
    }

    #[test]
    fn unknown_push_kind_is_unrecognized() {
        let payload = br#"{"kind":"barometer","pressure":1013}"#;
        let mut frame = BytesMut::new();
        frame.put_u16_le(FRAME_MAGIC);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(3); // push
        frame.put_u32_le(u32::try_from(payload.len()).unwrap());
        frame.put_slice(payload);
        assert!(matches!(
            decode(&frame).unwrap(),
            Message::Unrecognized { kind: 3 }
        ));
    }

    #[test]
    fn corrupt_frames_are_protocol_errors() {
        // Too short.
        assert!(matches!(
            decode(&[0x01, 0x02]),
            Err(Error::Protocol { .. })
        ));

        // Bad magic.
        let mut frame = BytesMut::new();
        frame.put_u16_le(0xDEAD);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(0);
        frame.put_u32_le(0);
        assert!(matches!(decode(&frame), Err(Error::Protocol { .. })));

        // Length mismatch.
        let mut frame = BytesMut::new();
        frame.put_u16_le(FRAME_MAGIC);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(0);
        frame.put_u32_le(10);
        assert!(matches!(decode(&frame), Err(Error::Protocol { .. })));

        // Malformed JSON in a known kind.
        let mut frame = BytesMut::new();
        frame.put_u16_le(FRAME_MAGIC);
        frame.put_u8(FRAME_VERSION);
        frame.put_u8(2);
        frame.put_u32_le(5);
        frame.put_slice(b"{id:]");
        assert!(matches!(decode(&frame), Err(Error::Protocol { .. })));
    }

    #[test]
    fn classification_helpers() {
        let resp = Message::Response(Response::default());
        assert!(resp.clone().into_push().is_none());
        assert!(resp.into_response().is_some());
        assert!(Message::Keepalive.is_keepalive());
        assert!(Message::Keepalive.into_response().is_none());
    }
}
