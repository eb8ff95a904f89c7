use crate::mqtt::ParsedTopic;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use common::domain::{
    AckResult, CommandAckReport, CommandKind, DeviceCommand, Envelope, HelloReport,
    LegacyReading, LegacyTelemetry, Measurement, MessageBody, MessageType, OtaState,
    OtaStatusReport, ProtocolVersion, ReportedStatus, StatusReport, TelemetryBatch,
    MAX_MEASUREMENTS_PER_BATCH,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorReason {
    InvalidTopic(String),
    MalformedPayload(String),
    NotAnObject,
    UnsupportedVersion(String),
    MissingField(&'static str),
    InvalidField { field: &'static str, detail: String },
    MessageTypeMismatch { declared: String, topic: MessageType },
    DeviceIdMismatch { payload: String, topic: String },
    TooManyMeasurements(usize),
    LegacyNotAccepted(MessageType),
    InvalidBody(String),
}

impl std::fmt::Display for DecodeErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErrorReason::InvalidTopic(detail) => write!(f, "invalid topic {}", detail),
            DecodeErrorReason::MalformedPayload(detail) => write!(f, "malformed JSON: {}", detail),
            DecodeErrorReason::NotAnObject => write!(f, "payload is not a JSON object"),
            DecodeErrorReason::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            DecodeErrorReason::MissingField(field) => write!(f, "missing field {}", field),
            DecodeErrorReason::InvalidField { field, detail } => {
                write!(f, "invalid field {}: {}", field, detail)
            }
            DecodeErrorReason::MessageTypeMismatch { declared, topic } => {
                write!(f, "msg_type {} does not match {} topic", declared, topic)
            }
            DecodeErrorReason::DeviceIdMismatch { payload, topic } => {
                write!(f, "device_id {} does not match topic device {}", payload, topic)
            }
            DecodeErrorReason::TooManyMeasurements(count) => write!(
                f,
                "{} measurements exceed the limit of {}",
                count, MAX_MEASUREMENTS_PER_BATCH
            ),
            DecodeErrorReason::LegacyNotAccepted(message_type) => {
                write!(f, "version 1 payloads are not accepted on {} topics", message_type)
            }
            DecodeErrorReason::InvalidBody(detail) => write!(f, "invalid body: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} ({raw_size_bytes} bytes)")]
pub struct DecodeError {
    pub reason: DecodeErrorReason,
    pub raw_size_bytes: usize,
}

/// A validated envelope together with the JSON it was decoded from
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub envelope: Envelope,
    pub payload: Value,
}

#[derive(Deserialize)]
struct WireMeasurement {
    ts: String,
    #[serde(rename = "type")]
    measurement_type: String,
    val: f64,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Deserialize)]
struct WireTelemetry {
    measurements: Vec<WireMeasurement>,
}

#[derive(Deserialize)]
struct WireHello {
    fw_version: String,
    uptime_s: u64,
    #[serde(default)]
    broker_connections: Option<u32>,
    #[serde(default)]
    buf_usage_pct: Option<u8>,
}

#[derive(Deserialize)]
struct WireStatus {
    status: ReportedStatus,
}

#[derive(Deserialize)]
struct WireCommandAck {
    cmd_id: String,
    result: AckResult,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct WireOtaStatus {
    cmd_id: String,
    ota_state: OtaState,
    progress_pct: u8,
    #[serde(default)]
    fw_version_target: Option<String>,
}

#[derive(Serialize)]
struct WireCommand<'a> {
    v: u8,
    cmd_id: &'a str,
    ts: String,
    cmd: CommandKind,
    params: &'a Map<String, Value>,
}

/// Decode one device message received on `topic`.
///
/// Legacy (version 1) payloads are flat objects of numeric readings and are
/// only accepted on telemetry topics; `received_at` stands in for a missing
/// `timestamp`.
pub fn decode(raw: &[u8], topic: &ParsedTopic, received_at: DateTime<Utc>) -> Result<DecodedMessage, DecodeError> {
    let fail = |reason: DecodeErrorReason| DecodeError {
        reason,
        raw_size_bytes: raw.len(),
    };

    let payload: Value = serde_json::from_slice(raw)
        .map_err(|e| fail(DecodeErrorReason::MalformedPayload(e.to_string())))?;
    let object = payload
        .as_object()
        .ok_or_else(|| fail(DecodeErrorReason::NotAnObject))?;

    let envelope = match protocol_version(object).map_err(fail)? {
        ProtocolVersion::V1 => decode_legacy(object, topic, received_at),
        ProtocolVersion::V2 => decode_versioned(object, topic),
    }
    .map_err(fail)?;

    Ok(DecodedMessage { envelope, payload })
}

/// Serialize a command in the device wire format
pub fn encode_command(command: &DeviceCommand) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&WireCommand {
        v: ProtocolVersion::V2.as_u8(),
        cmd_id: &command.command_id,
        ts: command.issued_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        cmd: command.kind,
        params: &command.params,
    })
}

fn protocol_version(object: &Map<String, Value>) -> Result<ProtocolVersion, DecodeErrorReason> {
    match object.get("v") {
        None | Some(Value::Null) => Ok(ProtocolVersion::V1),
        Some(v) => match v.as_u64() {
            Some(1) => Ok(ProtocolVersion::V1),
            Some(2) => Ok(ProtocolVersion::V2),
            _ => Err(DecodeErrorReason::UnsupportedVersion(v.to_string())),
        },
    }
}

fn decode_versioned(object: &Map<String, Value>, topic: &ParsedTopic) -> Result<Envelope, DecodeErrorReason> {
    let device_id = required_str(object, "device_id")?;
    if device_id != topic.device_id {
        return Err(DecodeErrorReason::DeviceIdMismatch {
            payload: device_id.to_string(),
            topic: topic.device_id.clone(),
        });
    }
    let timestamp = parse_timestamp("ts", required_str(object, "ts")?)?;

    // Status is published retained and as the last will: no seq, no msg_type
    let is_status = topic.message_type == MessageType::Status;
    match object.get("msg_type") {
        Some(declared) if declared.as_str() != Some(topic.message_type.as_str()) => {
            return Err(DecodeErrorReason::MessageTypeMismatch {
                declared: declared.to_string(),
                topic: topic.message_type,
            });
        }
        None if !is_status => return Err(DecodeErrorReason::MissingField("msg_type")),
        _ => {}
    }
    let sequence = if is_status {
        None
    } else {
        Some(sequence(object)?)
    };

    let body_value = Value::Object(object.clone());
    let body = match topic.message_type {
        MessageType::Telemetry => {
            let wire: WireTelemetry = body_from(body_value)?;
            if wire.measurements.len() > MAX_MEASUREMENTS_PER_BATCH {
                return Err(DecodeErrorReason::TooManyMeasurements(wire.measurements.len()));
            }
            let measurements = wire
                .measurements
                .into_iter()
                .map(|m| {
                    Ok(Measurement {
                        timestamp: parse_timestamp("measurements.ts", &m.ts)?,
                        measurement_type: m.measurement_type,
                        value: m.val,
                        unit: m.unit,
                    })
                })
                .collect::<Result<Vec<_>, DecodeErrorReason>>()?;
            MessageBody::Telemetry(TelemetryBatch { measurements })
        }
        MessageType::Hello => {
            let wire: WireHello = body_from(body_value)?;
            MessageBody::Hello(HelloReport {
                fw_version: wire.fw_version,
                uptime_s: wire.uptime_s,
                broker_connections: wire.broker_connections,
                buf_usage_pct: wire.buf_usage_pct,
            })
        }
        MessageType::Status => {
            let wire: WireStatus = body_from(body_value)?;
            MessageBody::Status(StatusReport { status: wire.status })
        }
        MessageType::CommandAck => {
            let wire: WireCommandAck = body_from(body_value)?;
            MessageBody::CommandAck(CommandAckReport {
                command_id: wire.cmd_id,
                result: wire.result,
                detail: wire.detail,
            })
        }
        MessageType::OtaStatus => {
            let wire: WireOtaStatus = body_from(body_value)?;
            if wire.progress_pct > 100 {
                return Err(DecodeErrorReason::InvalidField {
                    field: "progress_pct",
                    detail: format!("{} is above 100", wire.progress_pct),
                });
            }
            MessageBody::OtaStatus(OtaStatusReport {
                command_id: wire.cmd_id,
                state: wire.ota_state,
                progress_percent: wire.progress_pct,
                target_firmware_version: wire.fw_version_target,
            })
        }
    };

    Ok(Envelope {
        version: ProtocolVersion::V2,
        device_id: device_id.to_string(),
        timestamp,
        sequence,
        message_type: topic.message_type,
        body,
    })
}

fn decode_legacy(
    object: &Map<String, Value>,
    topic: &ParsedTopic,
    received_at: DateTime<Utc>,
) -> Result<Envelope, DecodeErrorReason> {
    if topic.message_type != MessageType::Telemetry {
        return Err(DecodeErrorReason::LegacyNotAccepted(topic.message_type));
    }
    if let Some(device_id) = object.get("device_id").and_then(Value::as_str) {
        if device_id != topic.device_id {
            return Err(DecodeErrorReason::DeviceIdMismatch {
                payload: device_id.to_string(),
                topic: topic.device_id.clone(),
            });
        }
    }

    let timestamp = match object.get("timestamp").and_then(Value::as_str) {
        Some(raw) => parse_timestamp("timestamp", raw)?,
        None => received_at,
    };

    let readings = object
        .iter()
        .filter(|(name, _)| !matches!(name.as_str(), "timestamp" | "device_id" | "v"))
        .filter_map(|(name, value)| {
            value.as_f64().map(|value| LegacyReading {
                name: name.clone(),
                value,
            })
        })
        .collect();

    Ok(Envelope {
        version: ProtocolVersion::V1,
        device_id: topic.device_id.clone(),
        timestamp,
        sequence: None,
        message_type: MessageType::Telemetry,
        body: MessageBody::LegacyTelemetry(LegacyTelemetry { readings }),
    })
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, DecodeErrorReason> {
    match object.get(field) {
        None | Some(Value::Null) => Err(DecodeErrorReason::MissingField(field)),
        Some(value) => value.as_str().ok_or_else(|| DecodeErrorReason::InvalidField {
            field,
            detail: "expected a string".to_string(),
        }),
    }
}

fn sequence(object: &Map<String, Value>) -> Result<u32, DecodeErrorReason> {
    let value = object
        .get("seq")
        .filter(|value| !value.is_null())
        .ok_or(DecodeErrorReason::MissingField("seq"))?;
    value
        .as_u64()
        .and_then(|seq| u32::try_from(seq).ok())
        .ok_or_else(|| DecodeErrorReason::InvalidField {
            field: "seq",
            detail: format!("{} is not an unsigned 32-bit integer", value),
        })
}

/// RFC 3339, or a naive ISO 8601 timestamp taken as UTC
fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, DecodeErrorReason> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DecodeErrorReason::InvalidField {
            field,
            detail: format!("'{}' is not a timestamp: {}", raw, e),
        })
}

fn body_from<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, DecodeErrorReason> {
    serde_json::from_value(value).map_err(|e| DecodeErrorReason::InvalidBody(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topic(message_type: MessageType) -> ParsedTopic {
        ParsedTopic {
            device_id: "dc-meter-007".to_string(),
            message_type,
        }
    }

    fn decode_json(value: Value, message_type: MessageType) -> Result<DecodedMessage, DecodeError> {
        decode(value.to_string().as_bytes(), &topic(message_type), Utc::now())
    }

    fn telemetry(seq: Value) -> Value {
        json!({
            "v": 2,
            "device_id": "dc-meter-007",
            "ts": "2025-03-01T10:00:00Z",
            "seq": seq,
            "msg_type": "telemetry",
            "measurements": [
                {"ts": "2025-03-01T09:59:59Z", "type": "voltage_dc", "val": 750.2, "unit": "V"},
                {"ts": "2025-03-01T10:00:00Z", "type": "pf", "val": 0.97}
            ]
        })
    }

    #[test]
    fn test_decode_v2_telemetry() {
        let decoded = decode_json(telemetry(json!(142)), MessageType::Telemetry).unwrap();
        let envelope = decoded.envelope;
        assert_eq!(envelope.version, ProtocolVersion::V2);
        assert_eq!(envelope.sequence, Some(142));
        match envelope.body {
            MessageBody::Telemetry(batch) => {
                assert_eq!(batch.measurements.len(), 2);
                assert_eq!(batch.measurements[0].measurement_type, "voltage_dc");
                assert_eq!(batch.measurements[1].unit, None);
            }
            other => panic!("unexpected body {:?}", other),
        }
        assert_eq!(decoded.payload["seq"], 142);
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = decode(b"{not json", &topic(MessageType::Telemetry), Utc::now()).unwrap_err();
        assert!(matches!(err.reason, DecodeErrorReason::MalformedPayload(_)));
        assert_eq!(err.raw_size_bytes, 9);
    }

    #[test]
    fn test_decode_rejects_bad_sequences() {
        for seq in [json!(-1), json!(4_294_967_296u64), json!("7"), json!(1.5)] {
            let err = decode_json(telemetry(seq), MessageType::Telemetry).unwrap_err();
            assert!(matches!(err.reason, DecodeErrorReason::InvalidField { field: "seq", .. }));
        }
        let mut missing = telemetry(json!(1));
        missing.as_object_mut().unwrap().remove("seq");
        let err = decode_json(missing, MessageType::Telemetry).unwrap_err();
        assert_eq!(err.reason, DecodeErrorReason::MissingField("seq"));
    }

    #[test]
    fn test_decode_rejects_topic_mismatch() {
        let err = decode_json(telemetry(json!(1)), MessageType::Hello).unwrap_err();
        assert!(matches!(err.reason, DecodeErrorReason::MessageTypeMismatch { .. }));

        let mut other_device = telemetry(json!(1));
        other_device["device_id"] = json!("dc-meter-008");
        let err = decode_json(other_device, MessageType::Telemetry).unwrap_err();
        assert!(matches!(err.reason, DecodeErrorReason::DeviceIdMismatch { .. }));
    }

    #[test]
    fn test_decode_rejects_oversized_batch() {
        let measurement = json!({"ts": "2025-03-01T10:00:00Z", "type": "temperature", "val": 20.0});
        let mut payload = telemetry(json!(1));
        payload["measurements"] = Value::Array(vec![measurement; MAX_MEASUREMENTS_PER_BATCH + 1]);
        let err = decode_json(payload, MessageType::Telemetry).unwrap_err();
        assert_eq!(
            err.reason,
            DecodeErrorReason::TooManyMeasurements(MAX_MEASUREMENTS_PER_BATCH + 1)
        );
    }

    #[test]
    fn test_decode_status_without_sequence() {
        let payload = json!({
            "v": 2,
            "device_id": "dc-meter-007",
            "status": "offline",
            "ts": "2025-03-01T10:00:00Z"
        });
        let envelope = decode_json(payload, MessageType::Status).unwrap().envelope;
        assert_eq!(envelope.dedup_sequence(), None);
        assert_eq!(
            envelope.body,
            MessageBody::Status(StatusReport {
                status: ReportedStatus::Offline
            })
        );
    }

    #[test]
    fn test_decode_command_ack_and_ota_status() {
        let ack = json!({
            "v": 2, "device_id": "dc-meter-007", "ts": "2025-03-01T10:00:00Z", "seq": 9,
            "msg_type": "command_ack", "cmd_id": "c1", "result": "unsupported",
            "detail": "unknown command: self_destruct"
        });
        let envelope = decode_json(ack, MessageType::CommandAck).unwrap().envelope;
        assert!(matches!(
            envelope.body,
            MessageBody::CommandAck(CommandAckReport { result: AckResult::Unsupported, .. })
        ));

        let ota = json!({
            "v": 2, "device_id": "dc-meter-007", "ts": "2025-03-01T10:00:00Z", "seq": 10,
            "msg_type": "ota_status", "cmd_id": "c2", "ota_state": "downloading",
            "progress_pct": 40, "fw_version_target": "2.1.0"
        });
        let envelope = decode_json(ota, MessageType::OtaStatus).unwrap().envelope;
        assert!(matches!(
            envelope.body,
            MessageBody::OtaStatus(OtaStatusReport { state: OtaState::Downloading, progress_percent: 40, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_progress_over_100() {
        let ota = json!({
            "v": 2, "device_id": "dc-meter-007", "ts": "2025-03-01T10:00:00Z", "seq": 10,
            "msg_type": "ota_status", "cmd_id": "c2", "ota_state": "downloading",
            "progress_pct": 140
        });
        let err = decode_json(ota, MessageType::OtaStatus).unwrap_err();
        assert!(matches!(err.reason, DecodeErrorReason::InvalidField { field: "progress_pct", .. }));
    }

    #[test]
    fn test_decode_legacy_flat_payload() {
        let payload = json!({"timestamp": "2024-01-15T10:30:00", "voltage": 750.5, "current": 320, "label": "north"});
        let envelope = decode_json(payload, MessageType::Telemetry).unwrap().envelope;
        assert_eq!(envelope.version, ProtocolVersion::V1);
        assert_eq!(envelope.sequence_or_legacy(), -1);
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-01-15T10:30:00+00:00");
        match envelope.body {
            MessageBody::LegacyTelemetry(legacy) => assert_eq!(legacy.readings.len(), 2),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_legacy_only_on_telemetry() {
        let err = decode_json(json!({"voltage": 1.0}), MessageType::Hello).unwrap_err();
        assert_eq!(err.reason, DecodeErrorReason::LegacyNotAccepted(MessageType::Hello));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut payload = telemetry(json!(1));
        payload["v"] = json!(3);
        let err = decode_json(payload, MessageType::Telemetry).unwrap_err();
        assert!(matches!(err.reason, DecodeErrorReason::UnsupportedVersion(_)));
    }

    #[test]
    fn test_encode_command_wire_shape() {
        let issued_at = DateTime::parse_from_rfc3339("2025-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let command = DeviceCommand {
            command_id: "cmd-1".to_string(),
            device_id: "dc-meter-007".to_string(),
            kind: CommandKind::StartOta,
            params: json!({"fw_version": "2.1.0"}).as_object().unwrap().clone(),
            issued_at,
        };
        let encoded: Value = serde_json::from_slice(&encode_command(&command).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({
                "v": 2,
                "cmd_id": "cmd-1",
                "ts": "2025-03-01T10:00:00Z",
                "cmd": "start_ota",
                "params": {"fw_version": "2.1.0"}
            })
        );
    }
}
