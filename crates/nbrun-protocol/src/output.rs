use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::message::KernelMessage;

/// A notebook output produced by a kernel while executing a request.
///
/// Serialized in nbformat v4 shape (`output_type` discriminator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputEvent {
    Stream { name: String, text: String },
    DisplayData {
        #[schema(value_type = Object)]
        data: Map<String, Value>,
        #[serde(default)]
        #[schema(value_type = Object)]
        metadata: Map<String, Value>,
    },
    ExecuteResult {
        #[schema(value_type = Object)]
        data: Map<String, Value>,
        #[serde(default)]
        #[schema(value_type = Object)]
        metadata: Map<String, Value>,
        execution_count: Option<i64>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl OutputEvent {
    pub const MESSAGE_TYPES: [&'static str; 4] =
        ["stream", "display_data", "execute_result", "error"];

    /// Convert a content-bearing kernel message into an output.
    ///
    /// Returns `None` for message types that carry no output (status,
    /// execute_input, replies) or for malformed content.
    pub fn from_message(msg: &KernelMessage) -> Option<Self> {
        let msg_type = msg.msg_type();
        if !Self::MESSAGE_TYPES.contains(&msg_type) {
            return None;
        }
        let mut content = msg.content.as_object()?.clone();
        content.insert("output_type".into(), Value::String(msg_type.to_string()));
        serde_json::from_value(Value::Object(content)).ok()
    }

    pub fn output_type(&self) -> &'static str {
        match self {
            OutputEvent::Stream { .. } => "stream",
            OutputEvent::DisplayData { .. } => "display_data",
            OutputEvent::ExecuteResult { .. } => "execute_result",
            OutputEvent::Error { .. } => "error",
        }
    }

    pub fn stream(name: impl Into<String>, text: impl Into<String>) -> Self {
        OutputEvent::Stream {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// Prompt carried by a kernel `input_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InputRequest {
    pub prompt: String,
    #[serde(default)]
    pub password: bool,
}
