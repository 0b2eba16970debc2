//! Client transport: wire messages, the forwarding sink and the inbound
//! audio source.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::{AudioFormat, AudioFrame};
use crate::classify::{ClassifiedEvent, EventKind};
use crate::error::{BidiError, Result};
use crate::session::SessionContext;
use crate::sink::EventConsumer;
use crate::source::FrameProducer;

/// Message sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Assistant audio.
    Audio {
        /// Base64 PCM16LE.
        audio: String,
    },
    /// Transcript of either party.
    Transcript {
        /// Speaker.
        role: String,
        /// Text.
        text: String,
        /// Whether the text is final.
        is_final: bool,
    },
    /// The assistant was interrupted.
    Interruption,
    /// The assistant called a tool.
    ToolUse {
        /// Tool name.
        name: String,
    },
    /// Backend error.
    Error {
        /// Message.
        message: String,
    },
}

impl OutboundMessage {
    /// Wire form of `event`, `None` for categories that are never forwarded.
    pub fn from_event(event: &ClassifiedEvent) -> Option<Self> {
        match &event.kind {
            EventKind::AudioChunk { audio } => Some(Self::Audio { audio: audio.clone() }),
            EventKind::TranscriptDelta { role, text } => {
                Some(Self::Transcript { role: role.clone(), text: text.clone(), is_final: false })
            }
            EventKind::TranscriptFinal { role, text } => {
                Some(Self::Transcript { role: role.clone(), text: text.clone(), is_final: true })
            }
            EventKind::Interruption { .. } => Some(Self::Interruption),
            EventKind::ToolInvocation { name, .. } => Some(Self::ToolUse { name: name.clone() }),
            EventKind::Error { message } => Some(Self::Error { message: message.clone() }),
            EventKind::Lifecycle { .. } | EventKind::Usage { .. } | EventKind::Unknown => None,
        }
    }

    /// The wire `type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Transcript { .. } => "transcript",
            Self::Interruption => "interruption",
            Self::ToolUse { .. } => "tool_use",
            Self::Error { .. } => "error",
        }
    }
}

/// Message received from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Microphone audio, base64 PCM16LE mono 16kHz.
    Audio {
        /// Encoded samples.
        audio: String,
    },
    /// Any other message type.
    #[serde(other)]
    Other,
}

/// A duplex JSON message channel to the client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message.
    async fn send(&self, message: &OutboundMessage) -> Result<()>;

    /// Read the next JSON message. `None` once the client has gone away.
    async fn recv(&self) -> Option<Result<Value>>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

/// A shared transport for the source and sink of one connection.
pub type SharedTransport = Arc<dyn Transport>;

/// Forwards events to the client in their wire form.
pub struct TransportSink {
    transport: SharedTransport,
}

impl TransportSink {
    /// Forward to `transport`.
    pub fn new(transport: SharedTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EventConsumer for TransportSink {
    fn name(&self) -> &str {
        "transport_sink"
    }

    async fn deliver(&self, event: &ClassifiedEvent) {
        let Some(message) = OutboundMessage::from_event(event) else {
            return;
        };
        if let Err(e) = self.transport.send(&message).await {
            tracing::warn!(
                category = %event.category(),
                source_type = %event.source_type,
                error = %e,
                "failed to forward event"
            );
        }
    }
}

/// Feeds client microphone audio into a run.
///
/// Non-audio messages are skipped. A closed transport ends the input.
pub struct TransportFrameSource {
    transport: SharedTransport,
    format: AudioFormat,
    sequence: u64,
}

impl TransportFrameSource {
    /// Read frames of `format` from `transport`.
    pub fn new(transport: SharedTransport, format: AudioFormat) -> Self {
        Self { transport, format, sequence: 0 }
    }
}

#[async_trait]
impl FrameProducer for TransportFrameSource {
    fn name(&self) -> &str {
        "transport_source"
    }

    async fn start(&mut self, ctx: &SessionContext) -> Result<()> {
        self.format = ctx.config.input_format;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<AudioFrame> {
        loop {
            let value = match self.transport.recv().await {
                Some(value) => value?,
                None => return Err(BidiError::SessionClosed),
            };
            match serde_json::from_value::<InboundMessage>(value) {
                Ok(InboundMessage::Audio { audio }) => {
                    match AudioFrame::from_base64(&audio, self.format, self.sequence) {
                        Ok(frame) => {
                            self.sequence += 1;
                            return Ok(frame);
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping undecodable audio message"),
                    }
                }
                Ok(InboundMessage::Other) => tracing::trace!("ignoring non-audio client message"),
                Err(e) => tracing::debug!(error = %e, "ignoring malformed client message"),
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.transport.close().await
    }
}
