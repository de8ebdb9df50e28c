//! Message envelope codec.
//!
//! Partition records carry text. A record whose text is a JSON object with
//! the envelope fields is unwrapped: the headers become message attributes
//! and the payload field becomes the message payload. Any other text is the
//! payload itself.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::{Header, Key, Message, TextMessage};

pub const HEADERS_FIELD: &str = "_shardline_msg_headers";
pub const PAYLOAD_FIELD: &str = "_shardline_msg_payload";

/// Decode raw record data into a message.
///
/// `None` or empty data is a tombstone. `header` supplies the arrival
/// timestamp and position; envelope headers are added to its attributes.
pub fn decode(key: Key, mut header: Header, data: Option<&str>) -> TextMessage {
    let Some(data) = data.filter(|d| !d.is_empty()) else {
        return Message::tombstone(key, header);
    };

    match parse_envelope(data) {
        Some((attributes, payload)) => {
            header.attributes.extend(attributes);
            Message::new(key, header, payload)
        }
        None => Message::new(key, header, Some(data.to_owned())),
    }
}

/// Encode a message into record data.
///
/// Messages without attributes are written as their raw payload. Everything
/// else is wrapped in an envelope: attributes, tombstones, empty payloads,
/// and payloads that would themselves decode as an envelope.
pub fn encode(message: &TextMessage) -> String {
    match &message.payload {
        Some(payload)
            if message.header.attributes.is_empty()
                && !payload.is_empty()
                && parse_envelope(payload).is_none() =>
        {
            payload.clone()
        }
        payload => {
            let mut envelope = Map::new();
            envelope.insert(
                HEADERS_FIELD.to_owned(),
                Value::Object(
                    message
                        .header
                        .attributes
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            );
            envelope.insert(
                PAYLOAD_FIELD.to_owned(),
                payload.clone().map_or(Value::Null, Value::String),
            );
            Value::Object(envelope).to_string()
        }
    }
}

fn parse_envelope(data: &str) -> Option<(BTreeMap<String, String>, Option<String>)> {
    if !data.trim_start().starts_with('{') {
        return None;
    }
    let Value::Object(mut object) = serde_json::from_str::<Value>(data).ok()? else {
        return None;
    };
    if !object.contains_key(PAYLOAD_FIELD) {
        return None;
    }

    let attributes = match object.remove(HEADERS_FIELD) {
        Some(Value::Object(headers)) => headers
            .into_iter()
            .map(|(name, value)| (name, text_of(value)))
            .collect(),
        _ => BTreeMap::new(),
    };
    let payload = match object.remove(PAYLOAD_FIELD) {
        None | Some(Value::Null) => None,
        Some(value) => Some(text_of(value)),
    };
    Some((attributes, payload))
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
