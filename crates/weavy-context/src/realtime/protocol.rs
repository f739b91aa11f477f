//! SignalR JSON hub protocol framing.
//!
//! Records are JSON objects terminated by the ASCII record separator (`0x1E`).
//! One websocket text frame may carry several records.

use serde_json::{Map, Value, json};

use crate::error::RealtimeError;

pub const RECORD_SEPARATOR: char = '\u{1e}';

const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// A decoded hub record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, cancellations and anything newer; ignored.
    Other(u64),
}

/// The handshake record opening every connection.
pub fn handshake_request() -> String {
    let mut frame = json!({ "protocol": "json", "version": 1 }).to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Parses the first text frame after the handshake request.
///
/// Returns whatever hub records followed the handshake response in the same
/// frame.
pub fn parse_handshake_response(text: &str) -> Result<Vec<HubMessage>, RealtimeError> {
    let mut records = split_records(text);
    let first = records
        .next()
        .ok_or_else(|| RealtimeError::Handshake("empty handshake response".into()))?;

    let response: Value = serde_json::from_str(first)
        .map_err(|e| RealtimeError::Handshake(format!("invalid handshake response: {e}")))?;
    if let Some(error) = response.get("error").and_then(Value::as_str) {
        return Err(RealtimeError::Handshake(error.to_string()));
    }

    records.map(parse_record).collect()
}

/// Decodes every record in a text frame.
pub fn parse_frames(text: &str) -> Vec<Result<HubMessage, RealtimeError>> {
    split_records(text).map(parse_record).collect()
}

fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

fn string_field(record: &Map<String, Value>, field: &str) -> Option<String> {
    record.get(field).and_then(Value::as_str).map(str::to_string)
}

fn parse_record(record: &str) -> Result<HubMessage, RealtimeError> {
    let value: Value =
        serde_json::from_str(record).map_err(|e| RealtimeError::Protocol(e.to_string()))?;
    let Value::Object(record) = value else {
        return Err(RealtimeError::Protocol("record is not an object".into()));
    };
    let kind = record
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| RealtimeError::Protocol("record has no type".into()))?;

    let message = match kind {
        TYPE_INVOCATION => HubMessage::Invocation {
            invocation_id: string_field(&record, "invocationId"),
            target: string_field(&record, "target")
                .ok_or_else(|| RealtimeError::Protocol("invocation has no target".into()))?,
            arguments: match record.get("arguments") {
                Some(Value::Array(arguments)) => arguments.clone(),
                _ => Vec::new(),
            },
        },
        TYPE_COMPLETION => HubMessage::Completion {
            invocation_id: string_field(&record, "invocationId")
                .ok_or_else(|| RealtimeError::Protocol("completion has no id".into()))?,
            result: record.get("result").cloned(),
            error: string_field(&record, "error"),
        },
        TYPE_PING => HubMessage::Ping,
        TYPE_CLOSE => HubMessage::Close {
            error: string_field(&record, "error"),
            allow_reconnect: record
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        other => HubMessage::Other(other),
    };
    Ok(message)
}

impl HubMessage {
    /// Encodes the record, separator included.
    pub fn to_frame(&self) -> String {
        let value = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut record = json!({
                    "type": TYPE_INVOCATION,
                    "target": target,
                    "arguments": arguments,
                });
                if let Some(id) = invocation_id {
                    record["invocationId"] = Value::String(id.clone());
                }
                record
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut record = json!({ "type": TYPE_COMPLETION, "invocationId": invocation_id });
                if let Some(result) = result {
                    record["result"] = result.clone();
                }
                if let Some(error) = error {
                    record["error"] = Value::String(error.clone());
                }
                record
            }
            HubMessage::Ping => json!({ "type": TYPE_PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut record = json!({ "type": TYPE_CLOSE, "allowReconnect": allow_reconnect });
                if let Some(error) = error {
                    record["error"] = Value::String(error.clone());
                }
                record
            }
            HubMessage::Other(kind) => json!({ "type": kind }),
        };
        let mut frame = value.to_string();
        frame.push(RECORD_SEPARATOR);
        frame
    }
}
