//! JSON wire protocol between clients and the hub.
//!
//! Inbound frames go through two steps: `Frame::parse` (is this a JSON object
//! with a `type`?) and `Frame::validate` (are the fields that type needs
//! present and well-formed?). The result is a `Command`, which the router
//! matches on exhaustively.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::{ConnectionId, Topic};
use crate::store::{Identity, Submission, SubmitOutcome};

pub const MAX_TOPIC_LEN: usize = 64;
pub const MAX_NOTE_LEN: usize = 500;

/// In-band credentials, either a PIN login checked by the store or a session
/// token checked locally.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    Token { token: String },
    Pin { identity: String, pin: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token { .. } => f.debug_struct("Token").finish_non_exhaustive(),
            Credentials::Pin { identity, .. } => f
                .debug_struct("Pin")
                .field("identity", identity)
                .finish_non_exhaustive(),
        }
    }
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Heartbeat,
    Authenticate {
        credentials: Credentials,
    },
    Subscribe {
        topic: Topic,
        credentials: Option<Credentials>,
    },
    Unsubscribe {
        topic: Topic,
    },
    SubmitPrediction(Submission),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Parse(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("invalid field(s): {}", .0.join(", "))]
    InvalidFields(Vec<&'static str>),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            ProtocolError::Parse(_) => ErrorCode::ParseError,
            ProtocolError::UnknownType(_) => ErrorCode::UnknownType,
            ProtocolError::MissingFields(_) => ErrorCode::MissingFields,
            ProtocolError::InvalidFields(_) => ErrorCode::InvalidFields,
        }
    }

    pub fn fields(&self) -> Vec<String> {
        match self {
            ProtocolError::MissingFields(fields) | ProtocolError::InvalidFields(fields) => {
                fields.iter().map(|f| f.to_string()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// A parsed but not yet validated inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: String,
    pub request_id: Option<String>,
    fields: Map<String, Value>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::Parse("expected a JSON object".to_string()));
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            None | Some(Value::Null) => return Err(ProtocolError::MissingFields(vec!["type"])),
            Some(_) => return Err(ProtocolError::InvalidFields(vec!["type"])),
        };
        let request_id = match fields.remove("requestId") {
            Some(Value::String(id)) => Some(id),
            _ => None,
        };

        Ok(Self {
            kind,
            request_id,
            fields,
        })
    }

    pub fn validate(&self) -> Result<Command, ProtocolError> {
        let mut check = FieldCheck::new(&self.fields);
        let command = match self.kind.as_str() {
            "heartbeat" => Some(Command::Heartbeat),
            "authenticate" => {
                let credentials = check.required("credentials", as_credentials);
                credentials.map(|credentials| Command::Authenticate { credentials })
            }
            "subscribe-topic" => {
                let topic = check.required("topic", as_topic);
                let credentials = check.optional("credentials", as_credentials);
                topic.map(|topic| Command::Subscribe { topic, credentials })
            }
            "unsubscribe-topic" => {
                let topic = check.required("topic", as_topic);
                topic.map(|topic| Command::Unsubscribe { topic })
            }
            "submit-prediction" => {
                let prediction_id = check.required("predictionId", as_prediction_id);
                let choice = check.required("choice", as_non_empty_string);
                let confidence = check.required("confidence", as_confidence);
                let note = check.optional("note", as_note);
                match (prediction_id, choice, confidence) {
                    (Some(prediction_id), Some(choice), Some(confidence)) => {
                        Some(Command::SubmitPrediction(Submission {
                            prediction_id,
                            choice,
                            confidence,
                            note,
                        }))
                    }
                    _ => None,
                }
            }
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        check.finish()?;
        command.ok_or_else(|| ProtocolError::Parse("frame could not be validated".to_string()))
    }
}

/// Collects missing and invalid field names while extracting values.
struct FieldCheck<'a> {
    fields: &'a Map<String, Value>,
    missing: Vec<&'static str>,
    invalid: Vec<&'static str>,
}

impl<'a> FieldCheck<'a> {
    fn new(fields: &'a Map<String, Value>) -> Self {
        Self {
            fields,
            missing: Vec::new(),
            invalid: Vec::new(),
        }
    }

    fn required<T>(&mut self, name: &'static str, extract: fn(&Value) -> Option<T>) -> Option<T> {
        match self.fields.get(name) {
            None | Some(Value::Null) => {
                self.missing.push(name);
                None
            }
            Some(value) => self.extract(name, value, extract),
        }
    }

    fn optional<T>(&mut self, name: &'static str, extract: fn(&Value) -> Option<T>) -> Option<T> {
        match self.fields.get(name) {
            None | Some(Value::Null) => None,
            Some(value) => self.extract(name, value, extract),
        }
    }

    fn extract<T>(
        &mut self,
        name: &'static str,
        value: &Value,
        extract: fn(&Value) -> Option<T>,
    ) -> Option<T> {
        let extracted = extract(value);
        if extracted.is_none() {
            self.invalid.push(name);
        }
        extracted
    }

    /// Missing fields are reported ahead of invalid ones.
    fn finish(self) -> Result<(), ProtocolError> {
        if !self.missing.is_empty() {
            return Err(ProtocolError::MissingFields(self.missing));
        }
        if !self.invalid.is_empty() {
            return Err(ProtocolError::InvalidFields(self.invalid));
        }
        Ok(())
    }
}

fn as_non_empty_string(value: &Value) -> Option<String> {
    let s = value.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn as_topic(value: &Value) -> Option<Topic> {
    as_non_empty_string(value).filter(|t| t.chars().count() <= MAX_TOPIC_LEN)
}

fn as_prediction_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        _ => as_non_empty_string(value),
    }
}

fn as_confidence(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .filter(|c| *c > 0)
        .and_then(|c| u32::try_from(c).ok())
}

fn as_note(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|n| n.chars().count() <= MAX_NOTE_LEN)
        .map(|n| n.to_string())
}

fn as_credentials(value: &Value) -> Option<Credentials> {
    let credentials: Credentials = serde_json::from_value(value.clone()).ok()?;
    let complete = match &credentials {
        Credentials::Token { token } => !token.is_empty(),
        Credentials::Pin { identity, pin } => !identity.trim().is_empty() && !pin.is_empty(),
    };
    complete.then_some(credentials)
}

/// Machine-readable error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ParseError,
    FrameTooLarge,
    UnknownType,
    MissingFields,
    InvalidFields,
    AuthenticationRequired,
    InvalidCredentials,
    StoreUnavailable,
    SubmissionRejected,
}

/// Payload of a `state-changed` broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub topic: Topic,
    pub prediction_id: String,
    pub user_id: String,
    pub username: String,
    pub player_number: i64,
    pub choice: String,
    pub confidence: u32,
    pub submitted_at: DateTime<Utc>,
    pub tally: Value,
}

impl StateChange {
    pub fn new(user: &Identity, outcome: SubmitOutcome) -> Self {
        Self {
            topic: outcome.topic,
            prediction_id: outcome.prediction_id,
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            player_number: user.player_number,
            choice: outcome.choice,
            confidence: outcome.confidence,
            submitted_at: outcome.submitted_at,
            tally: outcome.tally,
        }
    }
}

/// Hub → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Heartbeat {
        server_time: DateTime<Utc>,
    },
    StateSnapshot {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        topic: Topic,
        state: Value,
    },
    StateChanged(StateChange),
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
    },
    ConnectionStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        authenticated: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<Identity>,
    },
    Announcement {
        message: String,
    },
}

impl ServerMessage {
    pub fn heartbeat() -> Self {
        ServerMessage::Heartbeat {
            server_time: Utc::now(),
        }
    }

    pub fn error(request_id: Option<&str>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id: request_id.map(str::to_string),
            code,
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn protocol_error(request_id: Option<&str>, err: &ProtocolError) -> Self {
        ServerMessage::Error {
            request_id: request_id.map(str::to_string),
            code: err.code(),
            message: err.to_string(),
            fields: err.fields(),
        }
    }

    pub fn status(request_id: Option<&str>, message: impl Into<String>) -> Self {
        ServerMessage::ConnectionStatus {
            request_id: request_id.map(str::to_string),
            message: message.into(),
            connection_id: None,
            authenticated: None,
            user: None,
        }
    }

    pub fn authenticated(request_id: Option<&str>, user: Identity) -> Self {
        ServerMessage::ConnectionStatus {
            request_id: request_id.map(str::to_string),
            message: format!("authenticated as {}", user.username),
            connection_id: None,
            authenticated: Some(true),
            user: Some(user),
        }
    }

    pub fn connected(connection_id: ConnectionId) -> Self {
        ServerMessage::ConnectionStatus {
            request_id: None,
            message: "connected".to_string(),
            connection_id: Some(connection_id),
            authenticated: Some(false),
            user: None,
        }
    }

    /// Encode as a WebSocket text frame.
    pub fn to_ws(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(text: &str) -> Result<Command, ProtocolError> {
        Frame::parse(text)?.validate()
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = Frame::parse("not-json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParseError);
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let err = Frame::parse("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse(_)));
    }

    #[test]
    fn test_missing_type() {
        let err = Frame::parse(r#"{"topic": "week-1"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingFields(vec!["type"]));
    }

    #[test]
    fn test_unknown_type() {
        let err = validate(r#"{"type": "teleport"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("teleport".to_string()));
        assert_eq!(err.code(), ErrorCode::UnknownType);
    }

    #[test]
    fn test_request_id_is_kept() {
        let frame = Frame::parse(r#"{"type": "heartbeat", "requestId": "r-1"}"#).unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("r-1"));
        assert_eq!(frame.validate().unwrap(), Command::Heartbeat);
    }

    #[test]
    fn test_subscribe_requires_topic() {
        let err = validate(r#"{"type": "subscribe-topic"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingFields(vec!["topic"]));

        let err = validate(r#"{"type": "subscribe-topic", "topic": "   "}"#).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFields(vec!["topic"]));

        let long = "w".repeat(MAX_TOPIC_LEN + 1);
        let err = validate(&json!({"type": "subscribe-topic", "topic": long}).to_string())
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFields(vec!["topic"]));
    }

    #[test]
    fn test_subscribe_with_pin_credentials() {
        let cmd = validate(
            r#"{"type": "subscribe-topic", "topic": "week-5",
                "credentials": {"identity": "7", "pin": "1234"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Subscribe {
                topic: "week-5".to_string(),
                credentials: Some(Credentials::Pin {
                    identity: "7".to_string(),
                    pin: "1234".to_string()
                }),
            }
        );
    }

    #[test]
    fn test_malformed_credentials_are_invalid() {
        let err = validate(
            r#"{"type": "subscribe-topic", "topic": "week-5", "credentials": {"pin": "1"}}"#,
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFields(vec!["credentials"]));

        let err = validate(r#"{"type": "authenticate", "credentials": {"token": ""}}"#)
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFields(vec!["credentials"]));
    }

    #[test]
    fn test_submit_names_every_missing_field() {
        let err = validate(r#"{"type": "submit-prediction", "choice": "KC"}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingFields(vec!["predictionId", "confidence"])
        );
        assert_eq!(err.fields(), vec!["predictionId", "confidence"]);
    }

    #[test]
    fn test_submit_rejects_bad_confidence() {
        for bad in ["0", "-3", "2.5", "\"high\""] {
            let text = format!(
                r#"{{"type": "submit-prediction", "predictionId": "p1", "choice": "KC", "confidence": {bad}}}"#
            );
            let err = validate(&text).unwrap_err();
            assert_eq!(err, ProtocolError::InvalidFields(vec!["confidence"]), "{bad}");
        }
    }

    #[test]
    fn test_submit_accepts_numeric_prediction_id() {
        let cmd = validate(
            r#"{"type": "submit-prediction", "predictionId": 42, "choice": "BUF",
                "confidence": 9, "note": "cold game"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SubmitPrediction(Submission {
                prediction_id: "42".to_string(),
                choice: "BUF".to_string(),
                confidence: 9,
                note: Some("cold game".to_string()),
            })
        );
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::Pin {
            identity: "alice".to_string(),
            pin: "9999".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("9999"));
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::protocol_error(
            Some("r-9"),
            &ProtocolError::MissingFields(vec!["predictionId"]),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "missing-fields");
        assert_eq!(value["requestId"], "r-9");
        assert_eq!(value["fields"], json!(["predictionId"]));

        let status = serde_json::to_value(ServerMessage::status(None, "ok")).unwrap();
        assert_eq!(status["type"], "connection-status");
        assert!(status.get("requestId").is_none());
        assert!(status.get("user").is_none());
    }

    #[test]
    fn test_state_changed_wire_shape() {
        let user = Identity {
            user_id: "u1".to_string(),
            player_number: 7,
            username: "alice".to_string(),
        };
        let outcome = SubmitOutcome {
            topic: "week-5".to_string(),
            prediction_id: "p1".to_string(),
            choice: "KC".to_string(),
            confidence: 12,
            submitted_at: Utc::now(),
            tally: json!({"KC": 1}),
        };
        let msg = ServerMessage::StateChanged(StateChange::new(&user, outcome));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "state-changed");
        assert_eq!(value["topic"], "week-5");
        assert_eq!(value["predictionId"], "p1");
        assert_eq!(value["playerNumber"], 7);
        assert_eq!(value["tally"]["KC"], 1);
    }
}
