use common::domain::{DomainError, DomainResult, MessageType};

/// Device and message category taken from an inbound topic
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTopic {
    pub device_id: String,
    pub message_type: MessageType,
}

/// Parse `{root}/{device_id}/{category}` where category is one of
/// `telemetry`, `hello`, `status`, `command/ack` or `ota/status`.
///
/// ```
/// use common::domain::MessageType;
/// use telemetry_ingest::mqtt::parse_topic;
///
/// let parsed = parse_topic("iot", "iot/dc-meter-007/ota/status").unwrap();
/// assert_eq!(parsed.device_id, "dc-meter-007");
/// assert_eq!(parsed.message_type, MessageType::OtaStatus);
/// ```
pub fn parse_topic(root: &str, topic: &str) -> DomainResult<ParsedTopic> {
    let invalid = |detail: &str| DomainError::InvalidTopic(format!("'{}': {}", topic, detail));

    let rest = topic
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| invalid("outside the device topic root"))?;

    let (device_id, category) = rest
        .split_once('/')
        .ok_or_else(|| invalid("expected {device_id}/{category}"))?;

    if device_id.trim().is_empty() {
        return Err(invalid("device id cannot be empty"));
    }
    if device_id.contains(['+', '#']) {
        return Err(invalid("device id contains a wildcard"));
    }

    let message_type = match category {
        "telemetry" => MessageType::Telemetry,
        "hello" => MessageType::Hello,
        "status" => MessageType::Status,
        "command/ack" => MessageType::CommandAck,
        "ota/status" => MessageType::OtaStatus,
        _ => return Err(invalid("unknown message category")),
    };

    Ok(ParsedTopic {
        device_id: device_id.to_string(),
        message_type,
    })
}

/// Topic on which a device listens for commands
pub fn command_topic(root: &str, device_id: &str) -> String {
    format!("{}/{}/command", root, device_id)
}

/// Filters covering every inbound category for all devices
pub fn subscription_filters(root: &str) -> Vec<String> {
    ["telemetry", "hello", "status", "command/ack", "ota/status"]
        .iter()
        .map(|category| format!("{}/+/{}", root, category))
        .collect()
}
