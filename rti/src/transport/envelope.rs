//! Wire envelope and inbound frame classification
//!
//! Every structured frame is a single JSON object with the optional fields
//! `event`, `data`, `cid`, `rid` and `error`. Keepalive tokens (`#1`/`#2`)
//! are bare strings outside the envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{RtiError, RtiResult};

/// Keepalive ping sent by the broker
pub const PING: &str = "#1";
/// Keepalive reply
pub const PONG: &str = "#2";

/// Correlation id of the handshake; its reply is the authentication ack
pub const HANDSHAKE_CID: u64 = 1;

pub const EVENT_HANDSHAKE: &str = "#handshake";
pub const EVENT_SUBSCRIBE: &str = "#subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "#unsubscribe";
pub const EVENT_PUBLISH: &str = "#publish";
pub const EVENT_SET_AUTH_TOKEN: &str = "#setAuthToken";
pub const EVENT_REMOVE_AUTH_TOKEN: &str = "#removeAuthToken";

/// Structured frame in either direction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Envelope {
    pub fn event(event: impl Into<String>, data: Value, cid: Option<u64>) -> Self {
        Self {
            event: Some(event.into()),
            data: Some(data),
            cid,
            ..Default::default()
        }
    }

    /// Reply to a server-invoked event carrying `cid`
    pub fn reply(rid: u64, result: Result<Value, Value>) -> Self {
        match result {
            Ok(data) => Self {
                rid: Some(rid),
                data: Some(data),
                ..Default::default()
            },
            Err(error) => Self {
                rid: Some(rid),
                error: Some(error),
                ..Default::default()
            },
        }
    }

    pub fn handshake(auth_token: Option<&str>, cid: u64) -> Self {
        Self::event(EVENT_HANDSHAKE, json!({ "authToken": auth_token }), Some(cid))
    }

    pub fn subscribe(channel: &str, cid: u64) -> Self {
        Self::event(EVENT_SUBSCRIBE, json!({ "channel": channel }), Some(cid))
    }

    pub fn unsubscribe(channel: &str, cid: u64) -> Self {
        Self::event(EVENT_UNSUBSCRIBE, json!(channel), Some(cid))
    }

    pub fn publish(channel: &str, data: &str, cid: u64) -> Self {
        Self::event(EVENT_PUBLISH, json!({ "channel": channel, "data": data }), Some(cid))
    }

    pub fn to_text(&self) -> RtiResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Bare keepalive ping
    Ping,
    /// Empty keepalive frame
    Empty,
    /// Channel delivery
    Publish { channel: String, data: String },
    SetAuthToken { token: String },
    RemoveAuthToken,
    /// Reply to the handshake
    AuthAck { id: String, is_authenticated: bool },
    /// Named server event or server-side invocation
    Event { name: String, data: Value, cid: Option<u64> },
    /// Reply to one of our correlation ids
    Reply { rid: u64, data: Value, error: Option<Value> },
}

impl Inbound {
    /// Parse one raw text frame
    pub fn parse(text: &str) -> RtiResult<Self> {
        if text == PING {
            return Ok(Inbound::Ping);
        }
        if text.is_empty() {
            return Ok(Inbound::Empty);
        }

        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| RtiError::Protocol(format!("Malformed frame: {}", e)))?;
        let data = envelope.data.unwrap_or(Value::Null);

        match envelope.event.as_deref() {
            Some(EVENT_PUBLISH) => {
                let channel = data
                    .get("channel")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RtiError::Protocol("#publish without channel".to_string()))?
                    .to_string();
                let data = match data.get("data") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Ok(Inbound::Publish { channel, data })
            }
            Some(EVENT_SET_AUTH_TOKEN) => {
                let token = match data.get("token") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => return Err(RtiError::Protocol("#setAuthToken without token".to_string())),
                };
                Ok(Inbound::SetAuthToken { token })
            }
            Some(EVENT_REMOVE_AUTH_TOKEN) => Ok(Inbound::RemoveAuthToken),
            Some(name) if !name.is_empty() => Ok(Inbound::Event {
                name: name.to_string(),
                data,
                cid: envelope.cid,
            }),
            _ => match envelope.rid {
                Some(HANDSHAKE_CID) => Ok(Inbound::AuthAck {
                    id: data.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    is_authenticated: data.get("isAuthenticated").and_then(Value::as_bool).unwrap_or(false),
                }),
                Some(rid) => Ok(Inbound::Reply {
                    rid,
                    data,
                    error: envelope.error.filter(|e| !e.is_null()),
                }),
                None => Err(RtiError::Protocol(format!("Frame with neither event nor rid: {}", text))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_serialize() {
        let json = Envelope::publish("rti/clients", "abc=", 4).to_text().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "#publish");
        assert_eq!(value["data"]["channel"], "rti/clients");
        assert_eq!(value["data"]["data"], "abc=");
        assert_eq!(value["cid"], 4);
        assert!(value.get("rid").is_none());
    }

    #[test]
    fn test_handshake_carries_absent_token_as_null() {
        let json = Envelope::handshake(None, 1).to_text().unwrap();
        assert_eq!(json, r##"{"event":"#handshake","data":{"authToken":null},"cid":1}"##);
    }

    #[test]
    fn test_unsubscribe_data_is_bare_channel() {
        let json = Envelope::unsubscribe("foo", 9).to_text().unwrap();
        assert_eq!(json, r##"{"event":"#unsubscribe","data":"foo","cid":9}"##);
    }

    #[test]
    fn test_parse_ping_bypasses_json() {
        assert_eq!(Inbound::parse("#1").unwrap(), Inbound::Ping);
        assert_eq!(Inbound::parse("").unwrap(), Inbound::Empty);
    }

    #[test]
    fn test_parse_publish() {
        let frame = r##"{"event":"#publish","data":{"channel":"foo","data":"hello"}}"##;
        assert_eq!(
            Inbound::parse(frame).unwrap(),
            Inbound::Publish {
                channel: "foo".to_string(),
                data: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_auth_ack() {
        let frame = r#"{"rid":1,"data":{"id":"sock-1","isAuthenticated":true}}"#;
        assert_eq!(
            Inbound::parse(frame).unwrap(),
            Inbound::AuthAck {
                id: "sock-1".to_string(),
                is_authenticated: true
            }
        );
    }

    #[test]
    fn test_parse_reply_with_error() {
        let frame = r#"{"rid":7,"error":"nope"}"#;
        assert_eq!(
            Inbound::parse(frame).unwrap(),
            Inbound::Reply {
                rid: 7,
                data: Value::Null,
                error: Some(json!("nope"))
            }
        );
    }

    #[test]
    fn test_parse_token_push_and_removal() {
        let set = r##"{"event":"#setAuthToken","data":{"token":"t0k"}}"##;
        assert_eq!(
            Inbound::parse(set).unwrap(),
            Inbound::SetAuthToken {
                token: "t0k".to_string()
            }
        );
        let remove = r##"{"event":"#removeAuthToken"}"##;
        assert_eq!(Inbound::parse(remove).unwrap(), Inbound::RemoveAuthToken);
    }

    #[test]
    fn test_parse_generic_event_keeps_cid() {
        let frame = r#"{"event":"ping","data":"x","cid":12}"#;
        assert_eq!(
            Inbound::parse(frame).unwrap(),
            Inbound::Event {
                name: "ping".to_string(),
                data: json!("x"),
                cid: Some(12)
            }
        );
    }

    #[test]
    fn test_parse_malformed_is_protocol_violation() {
        let err = Inbound::parse("{not json").unwrap_err();
        assert!(matches!(err, RtiError::Protocol(_)));
        let err = Inbound::parse("{}").unwrap_err();
        assert!(matches!(err, RtiError::Protocol(_)));
    }
}
