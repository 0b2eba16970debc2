//! Mapping of backend events onto one canonical category.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::events::{EventAccessor, tags};

const UNKNOWN_TOOL: &str = "unknown";
const UNKNOWN_ERROR: &str = "Unknown error";
const UNKNOWN_ROLE: &str = "unknown";

/// Role name the backend uses for its own speech.
pub const ASSISTANT_ROLE: &str = "assistant";

/// Coarse category of a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Assistant audio.
    AudioChunk,
    /// Non-final transcript.
    TranscriptDelta,
    /// Final transcript.
    TranscriptFinal,
    /// Barge-in acknowledged by the backend.
    Interruption,
    /// Tool call.
    ToolInvocation,
    /// Backend error.
    Error,
    /// Response and connection lifecycle.
    Lifecycle,
    /// Token usage.
    Usage,
    /// Anything else.
    Unknown,
}

impl EventCategory {
    /// Snake case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AudioChunk => "audio_chunk",
            Self::TranscriptDelta => "transcript_delta",
            Self::TranscriptFinal => "transcript_final",
            Self::Interruption => "interruption",
            Self::ToolInvocation => "tool_invocation",
            Self::Error => "error",
            Self::Lifecycle => "lifecycle",
            Self::Usage => "usage",
            Self::Unknown => "unknown",
        }
    }

    /// Whether events of this category are sent to the client transport.
    pub fn is_forwardable(&self) -> bool {
        !matches!(self, Self::Lifecycle | Self::Usage | Self::Unknown)
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle signals recognised by explicit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// A response started.
    ResponseStart,
    /// A response finished or was cut.
    ResponseComplete,
    /// The backend connection opened.
    ConnectionStart,
    /// The backend connection reopened.
    ConnectionRestart,
    /// The backend connection closed.
    ConnectionClose,
}

impl LifecycleSignal {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            tags::RESPONSE_START => Some(Self::ResponseStart),
            tags::RESPONSE_COMPLETE => Some(Self::ResponseComplete),
            tags::CONNECTION_START => Some(Self::ConnectionStart),
            tags::CONNECTION_RESTART => Some(Self::ConnectionRestart),
            tags::CONNECTION_CLOSE => Some(Self::ConnectionClose),
            _ => None,
        }
    }
}

/// Category plus the fields extracted for it.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Assistant audio, base64 PCM16LE.
    AudioChunk {
        /// Opaque audio payload.
        audio: String,
    },
    /// Non-final transcript.
    TranscriptDelta {
        /// Speaker.
        role: String,
        /// Text so far.
        text: String,
    },
    /// Final transcript.
    TranscriptFinal {
        /// Speaker.
        role: String,
        /// Final text.
        text: String,
    },
    /// Barge-in.
    Interruption {
        /// Reason given by the backend.
        reason: Option<String>,
    },
    /// Tool call.
    ToolInvocation {
        /// Tool name, `"unknown"` when absent.
        name: String,
        /// Call identifier.
        tool_use_id: Option<String>,
        /// Call arguments.
        input: Option<Value>,
    },
    /// Backend error.
    Error {
        /// Message, `"Unknown error"` when absent.
        message: String,
    },
    /// Lifecycle signal.
    Lifecycle {
        /// Which signal.
        signal: LifecycleSignal,
    },
    /// Token usage.
    Usage {
        /// Input tokens.
        input_tokens: u64,
        /// Output tokens.
        output_tokens: u64,
        /// Total tokens.
        total_tokens: u64,
    },
    /// Unrecognised event.
    Unknown,
}

impl EventKind {
    /// The category of this kind.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::AudioChunk { .. } => EventCategory::AudioChunk,
            Self::TranscriptDelta { .. } => EventCategory::TranscriptDelta,
            Self::TranscriptFinal { .. } => EventCategory::TranscriptFinal,
            Self::Interruption { .. } => EventCategory::Interruption,
            Self::ToolInvocation { .. } => EventCategory::ToolInvocation,
            Self::Error { .. } => EventCategory::Error,
            Self::Lifecycle { .. } => EventCategory::Lifecycle,
            Self::Usage { .. } => EventCategory::Usage,
            Self::Unknown => EventCategory::Unknown,
        }
    }
}

/// A backend event after classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEvent {
    /// Category and payload.
    pub kind: EventKind,
    /// Type tag as received.
    pub source_type: String,
    /// When the event was classified.
    pub received_at: Instant,
}

impl ClassifiedEvent {
    /// Category of this event.
    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }

    /// Whether this is a transcript (delta or final) spoken by the assistant.
    pub fn is_assistant_transcript(&self) -> bool {
        match &self.kind {
            EventKind::TranscriptDelta { role, .. } | EventKind::TranscriptFinal { role, .. } => {
                role == ASSISTANT_ROLE
            }
            _ => false,
        }
    }

    /// Whether this is the given lifecycle signal.
    pub fn is_signal(&self, wanted: LifecycleSignal) -> bool {
        matches!(self.kind, EventKind::Lifecycle { signal } if signal == wanted)
    }
}

/// Classify `event`, stamping it with the current instant.
///
/// Total: any input yields a category. Missing fields take documented
/// defaults instead of failing.
pub fn classify<E: EventAccessor + ?Sized>(event: &E) -> ClassifiedEvent {
    classify_at(event, Instant::now())
}

/// Classify `event` with an explicit timestamp.
pub fn classify_at<E: EventAccessor + ?Sized>(event: &E, received_at: Instant) -> ClassifiedEvent {
    let tag = event.event_type();
    ClassifiedEvent { kind: kind_of(event, tag), source_type: tag.to_string(), received_at }
}

fn kind_of<E: EventAccessor + ?Sized>(event: &E, tag: &str) -> EventKind {
    if tag == tags::AUDIO_STREAM {
        return EventKind::AudioChunk { audio: event.str_field("audio").unwrap_or_default() };
    }
    if tag == tags::TRANSCRIPT_STREAM {
        let role = event.str_field("role").unwrap_or_else(|| UNKNOWN_ROLE.to_string());
        let text = event.str_field("text").unwrap_or_default();
        return if event.bool_field("is_final").unwrap_or(false) {
            EventKind::TranscriptFinal { role, text }
        } else {
            EventKind::TranscriptDelta { role, text }
        };
    }
    if tag == tags::INTERRUPTION {
        return EventKind::Interruption { reason: event.str_field("reason") };
    }
    // Substring match kept for backends that prefix or suffix the tool tag.
    if tag.contains(tags::TOOL_USE_MARKER) {
        return EventKind::ToolInvocation {
            name: event
                .nested_str_field("current_tool_use", "name")
                .unwrap_or_else(|| UNKNOWN_TOOL.to_string()),
            tool_use_id: event.nested_str_field("current_tool_use", "toolUseId"),
            input: event.nested_field("current_tool_use", "input").filter(|v| !v.is_null()),
        };
    }
    if tag == tags::ERROR {
        return EventKind::Error {
            message: event.str_field("message").unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
        };
    }
    if let Some(signal) = LifecycleSignal::from_tag(tag) {
        return EventKind::Lifecycle { signal };
    }
    if tag == tags::USAGE {
        return EventKind::Usage {
            input_tokens: event.u64_field("inputTokens").unwrap_or(0),
            output_tokens: event.u64_field("outputTokens").unwrap_or(0),
            total_tokens: event.u64_field("totalTokens").unwrap_or(0),
        };
    }
    EventKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BidiOutputEvent;
    use serde_json::json;

    #[test]
    fn test_transcript_defaults() {
        let event = classify(&json!({"type": "bidi_transcript_stream"}));
        assert_eq!(
            event.kind,
            EventKind::TranscriptDelta { role: "unknown".to_string(), text: String::new() }
        );
    }

    #[test]
    fn test_tool_use_without_current_call() {
        let event = classify(&json!({"type": "bidi_tool_use_delta"}));
        assert_eq!(
            event.kind,
            EventKind::ToolInvocation {
                name: "unknown".to_string(),
                tool_use_id: None,
                input: None,
            }
        );
    }

    #[test]
    fn test_error_default_message() {
        let event = classify(&json!({"type": "bidi_error"}));
        assert_eq!(event.kind, EventKind::Error { message: "Unknown error".to_string() });
    }

    #[test]
    fn test_lifecycle_and_usage_are_not_forwardable() {
        let start = classify(&BidiOutputEvent::ResponseStart { response_id: None });
        assert!(start.is_signal(LifecycleSignal::ResponseStart));
        assert!(!start.category().is_forwardable());

        let usage = classify(&json!({"type": "bidi_usage", "inputTokens": 10, "totalTokens": 12}));
        assert_eq!(
            usage.kind,
            EventKind::Usage { input_tokens: 10, output_tokens: 0, total_tokens: 12 }
        );
        assert!(!usage.category().is_forwardable());
    }

    #[test]
    fn test_missing_type_is_unknown() {
        let event = classify(&json!({"audio": "AQID"}));
        assert_eq!(event.category(), EventCategory::Unknown);
        assert_eq!(event.source_type, "");
        assert!(classify(&json!("not an object")).kind == EventKind::Unknown);
    }

    #[test]
    fn test_assistant_transcript() {
        let event = classify(&BidiOutputEvent::transcript("assistant", "はい", false));
        assert!(event.is_assistant_transcript());
        let user = classify(&BidiOutputEvent::transcript("user", "はい", true));
        assert!(!user.is_assistant_transcript());
    }
}
