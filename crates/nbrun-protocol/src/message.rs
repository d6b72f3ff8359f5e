//! Kernel message envelopes.
//!
//! Kernels multiplex every logical request over one session-wide stream. A
//! message belongs to the request whose `header.msg_id` appears as its
//! `parent_header.msg_id`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use utoipa::ToSchema;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "5.3";

pub const EXECUTE_REQUEST: &str = "execute_request";
pub const EXECUTE_REPLY: &str = "execute_reply";
pub const INPUT_REQUEST: &str = "input_request";
pub const INPUT_REPLY: &str = "input_reply";
pub const CLEAR_OUTPUT: &str = "clear_output";

/// Current UTC time as RFC 3339 with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MessageHeader {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl MessageHeader {
    /// Fresh header with a random message id.
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            username: "nbrun".into(),
            date: now_timestamp(),
            version: default_version(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub channel: Channel,
    pub header: MessageHeader,
    #[serde(
        default,
        deserialize_with = "empty_header_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_header: Option<MessageHeader>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn new(
        channel: Channel,
        msg_type: impl Into<String>,
        session: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            channel,
            header: MessageHeader::new(msg_type, session),
            parent_header: None,
            metadata: json!({}),
            content,
        }
    }

    pub fn with_parent(mut self, parent: &MessageHeader) -> Self {
        self.parent_header = Some(parent.clone());
        self
    }

    /// Build an `execute_request` for `code` on the shell channel.
    pub fn execute_request(session: &str, code: &str, allow_stdin: bool) -> Self {
        Self::new(
            Channel::Shell,
            EXECUTE_REQUEST,
            session,
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": allow_stdin,
                "stop_on_error": true,
            }),
        )
    }

    /// Build an `input_reply` answering the prompt identified by `prompt_header`.
    pub fn input_reply(prompt_header: &MessageHeader, value: &str) -> Self {
        Self::new(
            Channel::Stdin,
            INPUT_REPLY,
            prompt_header.session.clone(),
            json!({ "value": value }),
        )
        .with_parent(prompt_header)
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

// Kernels send `{}` for "no parent".
fn empty_header_as_none<'de, D>(deserializer: D) -> Result<Option<MessageHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parent_header_decodes_as_none() {
        let raw = json!({
            "channel": "iopub",
            "header": {"msg_id": "m1", "msg_type": "status"},
            "parent_header": {},
            "content": {"execution_state": "idle"}
        });
        let msg: KernelMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.parent_header.is_none());
        assert_eq!(msg.header.version, PROTOCOL_VERSION);
    }

    #[test]
    fn input_reply_is_addressed_to_prompt_header() {
        let prompt = MessageHeader::new(INPUT_REQUEST, "session-1");
        let reply = KernelMessage::input_reply(&prompt, "42");
        assert_eq!(reply.channel, Channel::Stdin);
        assert_eq!(reply.msg_type(), INPUT_REPLY);
        assert_eq!(reply.parent_msg_id(), Some(prompt.msg_id.as_str()));
        assert_eq!(reply.header.session, "session-1");
        assert_eq!(reply.content["value"], "42");
    }

    #[test]
    fn execute_request_carries_stdin_flag() {
        let msg = KernelMessage::execute_request("s", "1+1", false);
        assert_eq!(msg.msg_type(), EXECUTE_REQUEST);
        assert_eq!(msg.content["allow_stdin"], false);
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains("parent_header"));
    }
}
