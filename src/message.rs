//! Wire messages exchanged with clients.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ProtocolError, RelayError, ValidationError},
    event::Event,
    filter::Filter,
};

/// Inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`
    Event(Box<Event>),
    /// `["REQ", <sub>, <filter>...]`
    Req { sub: String, filters: Vec<Filter> },
    /// `["COUNT", <sub>, <filter>...]`
    Count { sub: String, filters: Vec<Filter> },
    /// `["CLOSE", <sub>]`
    Close(String),
}

impl ClientMessage {
    /// Decode one text frame.
    ///
    /// An EVENT whose object does not decode is a validation error; anything
    /// else malformed is a protocol error.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let val: Value = serde_json::from_str(text).map_err(ProtocolError::NotJson)?;
        let arr = val.as_array().ok_or(ProtocolError::NotACommand)?;
        let command = arr
            .first()
            .and_then(Value::as_str)
            .ok_or(ProtocolError::NotACommand)?;
        match command {
            "EVENT" => {
                let [_, obj] = arr.as_slice() else {
                    return Err(shape("EVENT", "expected exactly one event").into());
                };
                let ev = Event::deserialize(obj).map_err(ValidationError::Malformed)?;
                Ok(ClientMessage::Event(Box::new(ev)))
            }
            "REQ" => {
                let (sub, filters) = subscription("REQ", arr)?;
                Ok(ClientMessage::Req { sub, filters })
            }
            "COUNT" => {
                let (sub, filters) = subscription("COUNT", arr)?;
                Ok(ClientMessage::Count { sub, filters })
            }
            "CLOSE" => match arr.as_slice() {
                [_, Value::String(sub)] => Ok(ClientMessage::Close(sub.clone())),
                _ => Err(shape("CLOSE", "expected a subscription id").into()),
            },
            other => Err(ProtocolError::UnknownCommand(other.to_string()).into()),
        }
    }
}

fn shape(command: &'static str, reason: &'static str) -> ProtocolError {
    ProtocolError::Shape { command, reason }
}

fn subscription(
    command: &'static str,
    arr: &[Value],
) -> Result<(String, Vec<Filter>), ProtocolError> {
    let sub = match arr.get(1) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(shape(command, "expected a subscription id")),
    };
    if arr.len() < 3 {
        return Err(shape(command, "expected at least one filter"));
    }
    let filters = arr[2..]
        .iter()
        .map(Filter::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((sub, filters))
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub: String, event: Arc<Event> },
    Eose(String),
    Count { sub: String, count: u64 },
    Notice(String),
}

impl RelayMessage {
    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event { sub, event } => json!(["EVENT", sub, event.as_ref()]),
            RelayMessage::Eose(sub) => json!(["EOSE", sub]),
            RelayMessage::Count { sub, count } => json!(["COUNT", sub, { "count": count }]),
            RelayMessage::Notice(error) => json!(["NOTICE", { "error": error }]),
        }
        .to_string()
    }
}
