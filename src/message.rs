//! NIP-01 wire frames exchanged with relays.

use serde_json::{json, Value};

use crate::{event::Event, filter::Filter};

/// Frames sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["REQ", subscription_id, filter…]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", subscription_id]`
    Close { subscription_id: String },
    /// `["EVENT", event]`
    Event(Event),
}

impl ClientMessage {
    /// Serialize into the text frame sent on the socket.
    pub fn to_frame(&self) -> String {
        match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                arr.extend(filters.iter().map(Filter::to_value));
                Value::Array(arr).to_string()
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]).to_string(),
            ClientMessage::Event(ev) => json!(["EVENT", ev]).to_string(),
        }
    }
}

/// Frames received from a relay.
///
/// Events are kept as raw JSON so integrity checks happen in one place,
/// the router, rather than during frame decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: Value,
    },
    /// `["EOSE", subscription_id]`
    Eose { subscription_id: String },
    /// `["CLOSED", subscription_id, message]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["NOTICE", message]`
    Notice(String),
}

impl RelayMessage {
    /// Decode a text frame. Unknown or malformed frames yield `None`.
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let text = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(|s| s.to_string());
        match arr.first().and_then(|v| v.as_str())? {
            "EVENT" if arr.len() >= 3 => Some(RelayMessage::Event {
                subscription_id: text(1)?,
                event: arr[2].clone(),
            }),
            "EOSE" => Some(RelayMessage::Eose {
                subscription_id: text(1)?,
            }),
            "CLOSED" => Some(RelayMessage::Closed {
                subscription_id: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "OK" if arr.len() >= 3 => Some(RelayMessage::Ok {
                event_id: text(1)?,
                accepted: arr[2].as_bool()?,
                message: text(3).unwrap_or_default(),
            }),
            "NOTICE" => Some(RelayMessage::Notice(text(1).unwrap_or_default())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_carries_every_filter() {
        let msg = ClientMessage::Req {
            subscription_id: "ab12cd34".into(),
            filters: vec![Filter::new().kinds([0]), Filter::new().tag("p", ["me"])],
        };
        let v: Value = serde_json::from_str(&msg.to_frame()).unwrap();
        assert_eq!(
            v,
            json!(["REQ", "ab12cd34", {"kinds": [0]}, {"#p": ["me"]}])
        );
    }

    #[test]
    fn close_frame() {
        let msg = ClientMessage::Close {
            subscription_id: "s".into(),
        };
        assert_eq!(msg.to_frame(), r#"["CLOSE","s"]"#);
    }

    #[test]
    fn parses_relay_frames() {
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","s"]"#),
            Some(RelayMessage::Eose {
                subscription_id: "s".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","abcd",false,"blocked: pow"]"#),
            Some(RelayMessage::Ok {
                event_id: "abcd".into(),
                accepted: false,
                message: "blocked: pow".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["CLOSED","s","auth-required: x"]"#),
            Some(RelayMessage::Closed {
                subscription_id: "s".into(),
                message: "auth-required: x".into()
            })
        );
        assert!(matches!(
            RelayMessage::parse(r#"["EVENT","s",{"id":"x"}]"#),
            Some(RelayMessage::Event { .. })
        ));
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(RelayMessage::parse("not json"), None);
        assert_eq!(RelayMessage::parse(r#"{"a":1}"#), None);
        assert_eq!(RelayMessage::parse(r#"["AUTH","challenge"]"#), None);
        assert_eq!(RelayMessage::parse(r#"["EVENT","s"]"#), None);
        assert_eq!(RelayMessage::parse(r#"["OK","id","yes"]"#), None);
    }
}
