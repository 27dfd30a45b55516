//! Wire types: the message model and the client/server protocol frames
//!
//! `Message` is the immutable unit routed between nodes (§3). `Command` and
//! `Response` are the discriminated unions that make up the wire protocol
//! (§6): every frame is a single JSON object carrying a `type` field plus
//! whatever the command/response in §4.9 demands.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Error;

/// A client-assigned request sequence number, echoed back on the matching
/// response. Distinct from a `Subscription`'s delivery sequence numbers.
pub type Seq = u32;

/// A header value scalar: string, number, or boolean (§3 Message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    String(String),
    Number(serde_json::Number),
    Bool(bool),
}

pub type Headers = HashMap<String, HeaderValue>;

/// The immutable unit of transfer routed between nodes.
///
/// `topic` must be non-empty; `headers` absent on the wire is equivalent to
/// an empty map, not `None` — there is no distinction once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: None,
            headers: Headers::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Rejects a non-string (empty) topic. Header value typing is already
    /// enforced by `HeaderValue`'s deserialization, so there is nothing
    /// further to check there once a `Message` has been constructed.
    pub fn validate(&self) -> Result<(), Error> {
        if self.topic.is_empty() {
            return Err(Error::protocol("topic must be a non-empty string"));
        }
        Ok(())
    }

    pub fn header_bool(&self, key: &str) -> Option<bool> {
        match self.headers.get(key) {
            Some(HeaderValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
}

/// A pattern spec as it appears on the wire: absent means "matches
/// everything", a bare string is a single pattern, a list is their union
/// (§4.1). `subscription`'s per-node `bindings` map uses this; `subscribe`'s
/// `pattern` field uses only the `Single` form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternSpec {
    Single(String),
    Many(Vec<String>),
}

impl PatternSpec {
    pub fn patterns(&self) -> Vec<String> {
        match self {
            PatternSpec::Single(s) => vec![s.clone()],
            PatternSpec::Many(v) => v.clone(),
        }
    }
}

/// Client-to-broker commands (§4.9, §6). Tagged by `type`; every variant
/// carries the optional `seq` the response must echo.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Login {
        seq: Option<Seq>,
        username: String,
        password: String,
    },
    Session {
        seq: Option<Seq>,
        name: String,
        #[serde(default)]
        subscriptions: Option<Vec<String>>,
    },
    Subscription {
        seq: Option<Seq>,
        id: String,
        #[serde(default)]
        bindings: Option<HashMap<String, PatternSpec>>,
    },
    Subscribe {
        seq: Option<Seq>,
        node: String,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
    Unsubscribe {
        seq: Option<Seq>,
        node: String,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
    Publish {
        seq: Option<Seq>,
        node: String,
        topic: String,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        headers: Option<Headers>,
    },
    Ack {
        seq: Option<Seq>,
        id: String,
        ack: u64,
        #[serde(default)]
        window: Option<u64>,
    },
    Ping {
        seq: Option<Seq>,
    },
}

impl Command {
    /// The `seq` every command carries, used to echo it back on failure
    /// even before the command-specific handler runs.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Command::Login { seq, .. }
            | Command::Session { seq, .. }
            | Command::Subscription { seq, .. }
            | Command::Subscribe { seq, .. }
            | Command::Unsubscribe { seq, .. }
            | Command::Publish { seq, .. }
            | Command::Ack { seq, .. }
            | Command::Ping { seq } => *seq,
        }
    }
}

/// Broker-to-client responses (§4.9, §6). A `message` response is a push
/// notification, not a reply: its `seq` field is the per-subscription
/// delivery sequence number, not an echoed command `seq`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Loginack {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Sessionack {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Subscriptionack {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        #[serde(rename = "lastAck")]
        last_ack: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        bindings: Option<HashMap<String, Vec<String>>>,
    },
    Suback {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Unsuback {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Puback {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Pingack {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
    },
    Message {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        headers: Headers,
        subscription: String,
        seq: u64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<Seq>,
        message: String,
    },
}

impl Response {
    pub fn error(seq: Option<Seq>, message: impl Into<String>) -> Self {
        Response::Error {
            seq,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_requires_nonempty_topic() {
        let m = Message::new("");
        assert!(m.validate().is_err());
        let m = Message::new("a/b");
        assert!(m.validate().is_ok());
    }

    #[test]
    fn command_decodes_login() {
        let json = r#"{"type":"login","seq":1,"username":"alice","password":"secret"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::Login { seq, username, password } => {
                assert_eq!(seq, Some(1));
                assert_eq!(username, "alice");
                assert_eq!(password, "secret");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn command_decodes_subscribe_without_pattern() {
        let json = r#"{"type":"subscribe","node":"default"}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        match cmd {
            Command::Subscribe { node, pattern, id, seq } => {
                assert_eq!(node, "default");
                assert_eq!(pattern, None);
                assert_eq!(id, None);
                assert_eq!(seq, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_message_serializes_with_numeric_seq() {
        let resp = Response::Message {
            topic: "hello".into(),
            data: Some(Value::from(42)),
            headers: Headers::new(),
            subscription: "default".into(),
            seq: 1,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["seq"], 1);
        assert_eq!(json["topic"], "hello");
    }

    #[test]
    fn response_error_omits_missing_seq() {
        let resp = Response::error(None, "permission denied");
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("seq").is_none());
        assert_eq!(json["message"], "permission denied");
    }

    #[test]
    fn pattern_spec_union() {
        let single: PatternSpec = serde_json::from_str(r#""/foo/**""#).unwrap();
        assert_eq!(single.patterns(), vec!["/foo/**".to_string()]);
        let many: PatternSpec = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(many.patterns(), vec!["a".to_string(), "b".to_string()]);
    }
}
