//! Wire format spoken with the agent-runner gateway.
//!
//! Every frame is a JSON object with a `type` discriminator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Ask the runner to start an agent on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnCommand {
    pub agent: String,
    pub task: String,
    pub session_id: String,
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl SpawnCommand {
    pub fn new(
        agent: impl Into<String>,
        task: impl Into<String>,
        session_id: impl Into<String>,
        config: Option<Value>,
    ) -> Self {
        Self {
            agent: agent.into(),
            task: task.into(),
            session_id: session_id.into(),
            config: config.unwrap_or_else(empty_object),
        }
    }
}

/// Frames sent to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Spawn(SpawnCommand),
    Ping,
}

/// Progress report for a session, as pushed by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub session_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Frames received from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayMessage {
    Pong,
    Status(StatusUpdate),
    Error(Value),
    /// Any other `type`, passed through untouched.
    Other { kind: String, raw: Value },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

impl GatewayMessage {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut raw: Value = serde_json::from_str(text)?;
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        match kind.as_str() {
            "pong" => Ok(GatewayMessage::Pong),
            "status" => {
                let payload = raw.get_mut("payload").map(Value::take).unwrap_or_default();
                serde_json::from_value(payload)
                    .map(GatewayMessage::Status)
                    .map_err(|source| ProtocolError::InvalidPayload {
                        kind: "status".to_string(),
                        source,
                    })
            }
            "error" => Ok(GatewayMessage::Error(
                raw.get_mut("payload").map(Value::take).unwrap_or_default(),
            )),
            _ => Ok(GatewayMessage::Other {
                kind: kind.clone(),
                raw,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spawn_serializes_with_camel_case_session_id() {
        let msg = OutboundMessage::Spawn(SpawnCommand::new(
            "Ada",
            "Write spec: ",
            "s-1",
            None,
        ));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "spawn",
                "agent": "Ada",
                "task": "Write spec: ",
                "sessionId": "s-1",
                "config": {}
            })
        );
    }

    #[test]
    fn ping_is_bare_type() {
        let value = serde_json::to_value(OutboundMessage::Ping).unwrap();
        assert_eq!(value, json!({"type": "ping"}));
    }

    #[test]
    fn parses_status_payload() {
        let msg = GatewayMessage::parse(
            r#"{"type":"status","payload":{"sessionId":"s-1","status":"running","output":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            GatewayMessage::Status(StatusUpdate {
                session_id: "s-1".into(),
                status: "running".into(),
                output: Some("hi".into()),
                error: None,
            })
        );
    }

    #[test]
    fn unknown_types_pass_through() {
        let msg = GatewayMessage::parse(r#"{"type":"hello","version":2}"#).unwrap();
        match msg {
            GatewayMessage::Other { kind, raw } => {
                assert_eq!(kind, "hello");
                assert_eq!(raw["version"], 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(
            GatewayMessage::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            GatewayMessage::parse(r#"{"payload":1}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            GatewayMessage::parse(r#"{"type":"status","payload":{"status":"x"}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }
}
