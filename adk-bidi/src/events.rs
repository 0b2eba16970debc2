//! Backend event types.
//!
//! A backend session yields events in one of two shapes: a loose JSON mapping
//! (as received from a socket) or a typed [`BidiOutputEvent`]. Both are read
//! through the [`EventAccessor`] trait so that classification never depends on
//! which shape arrived.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Type tags of the backend event vocabulary.
pub mod tags {
    /// Assistant audio chunk.
    pub const AUDIO_STREAM: &str = "bidi_audio_stream";
    /// Partial or final transcript.
    pub const TRANSCRIPT_STREAM: &str = "bidi_transcript_stream";
    /// The user spoke over the assistant.
    pub const INTERRUPTION: &str = "bidi_interruption";
    /// Tool call progress.
    pub const TOOL_USE_STREAM: &str = "tool_use_stream";
    /// Substring identifying tool call events.
    pub const TOOL_USE_MARKER: &str = "tool_use";
    /// Backend error.
    pub const ERROR: &str = "bidi_error";
    /// Assistant response started.
    pub const RESPONSE_START: &str = "bidi_response_start";
    /// Assistant response finished.
    pub const RESPONSE_COMPLETE: &str = "bidi_response_complete";
    /// Backend connection established.
    pub const CONNECTION_START: &str = "bidi_connection_start";
    /// Backend connection re-established.
    pub const CONNECTION_RESTART: &str = "bidi_connection_restart";
    /// Backend connection closed.
    pub const CONNECTION_CLOSE: &str = "bidi_connection_close";
    /// Token usage report.
    pub const USAGE: &str = "bidi_usage";
}

/// The tool call carried by a `tool_use_stream` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    /// Backend-assigned call identifier.
    #[serde(rename = "toolUseId", default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
}

/// Status of a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    /// The tool ran.
    Success,
    /// The tool failed or was not found.
    Error,
}

/// Result of a tool call, sent back to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Identifier of the call being answered.
    pub tool_use_id: String,
    /// Tool name.
    pub name: String,
    /// Outcome.
    pub status: ToolResultStatus,
    /// Tool output.
    pub content: Value,
}

impl ToolResult {
    /// Successful result.
    pub fn success(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            status: ToolResultStatus::Success,
            content,
        }
    }

    /// Failed result carrying an error message.
    pub fn error(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            status: ToolResultStatus::Error,
            content: Value::String(message.into()),
        }
    }
}

/// Typed backend output events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BidiOutputEvent {
    /// Assistant audio.
    #[serde(rename = "bidi_audio_stream")]
    AudioStream {
        /// Base64 PCM16LE audio.
        audio: String,
        /// Encoding name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        /// Sample rate in Hz.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
        /// Channel count.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<u16>,
    },

    /// Transcript of either party.
    #[serde(rename = "bidi_transcript_stream")]
    TranscriptStream {
        /// "user" or "assistant".
        role: String,
        /// Transcript text.
        text: String,
        /// Whether the text is final.
        #[serde(default)]
        is_final: bool,
    },

    /// The user interrupted the assistant.
    #[serde(rename = "bidi_interruption")]
    Interruption {
        /// Why the response was cut.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Tool call requested by the assistant.
    #[serde(rename = "tool_use_stream")]
    ToolUseStream {
        /// The call.
        current_tool_use: ToolUse,
    },

    /// Backend error.
    #[serde(rename = "bidi_error")]
    Error {
        /// Error message.
        message: String,
        /// Provider error code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    /// Assistant response started.
    #[serde(rename = "bidi_response_start")]
    ResponseStart {
        /// Response identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    /// Assistant response finished.
    #[serde(rename = "bidi_response_complete")]
    ResponseComplete {
        /// Response identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        /// "complete", "interrupted" or "tool_use".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// Backend connection established.
    #[serde(rename = "bidi_connection_start")]
    ConnectionStart {
        /// Connection identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        /// Model serving the connection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Backend connection re-established.
    #[serde(rename = "bidi_connection_restart")]
    ConnectionRestart {
        /// Connection identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },

    /// Backend connection closed.
    #[serde(rename = "bidi_connection_close")]
    ConnectionClose {
        /// Close reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Token usage.
    #[serde(rename = "bidi_usage")]
    Usage {
        /// Input tokens.
        #[serde(rename = "inputTokens", default)]
        input_tokens: u64,
        /// Output tokens.
        #[serde(rename = "outputTokens", default)]
        output_tokens: u64,
        /// Total tokens.
        #[serde(rename = "totalTokens", default)]
        total_tokens: u64,
    },

    /// Any tag not listed above.
    #[serde(other)]
    Unknown,
}

impl BidiOutputEvent {
    /// Audio event with the default 16kHz mono layout.
    pub fn audio(audio: impl Into<String>) -> Self {
        Self::AudioStream {
            audio: audio.into(),
            format: Some("pcm".to_string()),
            sample_rate: Some(16000),
            channels: Some(1),
        }
    }

    /// Transcript event.
    pub fn transcript(role: impl Into<String>, text: impl Into<String>, is_final: bool) -> Self {
        Self::TranscriptStream { role: role.into(), text: text.into(), is_final }
    }

    /// The type tag of this event, empty for [`BidiOutputEvent::Unknown`].
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AudioStream { .. } => tags::AUDIO_STREAM,
            Self::TranscriptStream { .. } => tags::TRANSCRIPT_STREAM,
            Self::Interruption { .. } => tags::INTERRUPTION,
            Self::ToolUseStream { .. } => tags::TOOL_USE_STREAM,
            Self::Error { .. } => tags::ERROR,
            Self::ResponseStart { .. } => tags::RESPONSE_START,
            Self::ResponseComplete { .. } => tags::RESPONSE_COMPLETE,
            Self::ConnectionStart { .. } => tags::CONNECTION_START,
            Self::ConnectionRestart { .. } => tags::CONNECTION_RESTART,
            Self::ConnectionClose { .. } => tags::CONNECTION_CLOSE,
            Self::Usage { .. } => tags::USAGE,
            Self::Unknown => "",
        }
    }
}

fn opt_str(value: &Option<String>) -> Option<Value> {
    value.as_ref().map(|s| Value::String(s.clone()))
}

/// Uniform field access over the shapes a backend event can take.
pub trait EventAccessor {
    /// The event's type tag, empty when absent.
    fn event_type(&self) -> &str;

    /// A top-level field, `None` when absent.
    fn field(&self, name: &str) -> Option<Value>;

    /// A field rendered as text. Non-string scalars are stringified.
    fn str_field(&self, name: &str) -> Option<String> {
        match self.field(name)? {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    /// A boolean field.
    fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name)?.as_bool()
    }

    /// An unsigned integer field.
    fn u64_field(&self, name: &str) -> Option<u64> {
        self.field(name)?.as_u64()
    }

    /// `key` inside the object stored at `name`.
    fn nested_field(&self, name: &str, key: &str) -> Option<Value> {
        match self.field(name)? {
            Value::Object(mut map) => map.remove(key),
            _ => None,
        }
    }

    /// `key` inside the object stored at `name`, as a string.
    fn nested_str_field(&self, name: &str, key: &str) -> Option<String> {
        match self.nested_field(name, key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl EventAccessor for Value {
    fn event_type(&self) -> &str {
        self.get("type").and_then(Value::as_str).unwrap_or("")
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl EventAccessor for BidiOutputEvent {
    fn event_type(&self) -> &str {
        self.tag()
    }

    fn field(&self, name: &str) -> Option<Value> {
        match (self, name) {
            (Self::AudioStream { audio, .. }, "audio") => Some(Value::String(audio.clone())),
            (Self::AudioStream { format, .. }, "format") => opt_str(format),
            (Self::AudioStream { sample_rate, .. }, "sample_rate") => sample_rate.map(Value::from),
            (Self::AudioStream { channels, .. }, "channels") => channels.map(Value::from),
            (Self::TranscriptStream { role, .. }, "role") => Some(Value::String(role.clone())),
            (Self::TranscriptStream { text, .. }, "text") => Some(Value::String(text.clone())),
            (Self::TranscriptStream { is_final, .. }, "is_final") => Some(Value::Bool(*is_final)),
            (Self::Interruption { reason }, "reason") => opt_str(reason),
            (Self::ToolUseStream { current_tool_use }, "current_tool_use") => {
                serde_json::to_value(current_tool_use).ok()
            }
            (Self::Error { message, .. }, "message") => Some(Value::String(message.clone())),
            (Self::Error { code, .. }, "code") => opt_str(code),
            (Self::ResponseStart { response_id }, "response_id") => opt_str(response_id),
            (Self::ResponseComplete { response_id, .. }, "response_id") => opt_str(response_id),
            (Self::ResponseComplete { stop_reason, .. }, "stop_reason") => opt_str(stop_reason),
            (Self::ConnectionStart { connection_id, .. }, "connection_id") => {
                opt_str(connection_id)
            }
            (Self::ConnectionStart { model, .. }, "model") => opt_str(model),
            (Self::ConnectionRestart { connection_id }, "connection_id") => opt_str(connection_id),
            (Self::ConnectionClose { reason }, "reason") => opt_str(reason),
            (Self::Usage { input_tokens, .. }, "inputTokens") => Some(Value::from(*input_tokens)),
            (Self::Usage { output_tokens, .. }, "outputTokens") => {
                Some(Value::from(*output_tokens))
            }
            (Self::Usage { total_tokens, .. }, "totalTokens") => Some(Value::from(*total_tokens)),
            _ => None,
        }
    }
}

/// An event as yielded by a backend session.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Untyped JSON mapping.
    Mapping(Value),
    /// Typed event object.
    Object(BidiOutputEvent),
}

impl RawEvent {
    /// Parse a JSON text frame into a mapping event.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self::Mapping(serde_json::from_str(text)?))
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        Self::Mapping(value)
    }
}

impl From<BidiOutputEvent> for RawEvent {
    fn from(event: BidiOutputEvent) -> Self {
        Self::Object(event)
    }
}

impl EventAccessor for RawEvent {
    fn event_type(&self) -> &str {
        match self {
            Self::Mapping(value) => value.event_type(),
            Self::Object(event) => event.event_type(),
        }
    }

    fn field(&self, name: &str) -> Option<Value> {
        match self {
            Self::Mapping(value) => value.field(name),
            Self::Object(event) => event.field(name),
        }
    }
}
