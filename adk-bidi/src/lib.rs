//! # adk-bidi
//!
//! Duplex streaming bridge between a client audio/text transport and a
//! bidirectional voice agent backend.
//!
//! ## Architecture
//!
//! A [`SessionBridge`] runs one backend session at a time. A single
//! [`FrameProducer`] feeds paced input frames to the backend while every
//! backend event is classified once and fanned out to a set of
//! [`EventConsumer`]s.
//!
//! ```text
//!   FrameProducer ──frames──▶ ┌───────────────┐ ──audio──▶ BidiSession
//!   (pcm file, barge-in,      │ SessionBridge │
//!    client transport)        │               │ ◀─events── (websocket,
//!                             └───────┬───────┘             loopback)
//!                                     │ classify + fan-out
//!              ┌──────────────┬───────┴──────┬───────────────┐
//!        TransportSink  CountingSink  RecordingSink  LatencyRecorder
//! ```
//!
//! ## Features
//!
//! - **Event classification**: one total, pure mapping from loosely shaped
//!   backend events to a closed set of categories
//! - **Paced input**: PCM buffers split into real-time frames with trailing silence
//! - **Barge-in**: scripted interruptions gated on the assistant's audible reply
//! - **Latency**: first-write-wins milestone capture relative to end of speech
//! - **Tools**: clock and calculator tools executed on behalf of the agent
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use adk_bidi::{
//!     FrameConfig, LatencyRecorder, LoopbackModel, PcmFrameSource, SessionBridge, SessionConfig,
//! };
//!
//! let bridge = SessionBridge::builder()
//!     .model(Arc::new(LoopbackModel::default()))
//!     .config(SessionConfig::from_env())
//!     .tools(adk_bidi::tools::default_tools())
//!     .build()?;
//!
//! let mut source = PcmFrameSource::from_file("question.pcm", FrameConfig::default()).await?;
//! let latency = Arc::new(LatencyRecorder::new());
//! let report = bridge.run(&mut source, &[latency.clone()], Some(Duration::from_secs(30))).await?;
//! let measurement = latency.latencies_from(&source.speech_end());
//! ```

pub mod audio;
pub mod bridge;
pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod latency;
pub mod loopback;
pub mod model;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod source;
pub mod tools;
pub mod transport;

// Backend clients
#[cfg(feature = "ws")]
pub mod ws;

// Re-exports
pub use audio::{AudioEncoding, AudioFormat, AudioFrame};
pub use bridge::{RunOutcome, RunReport, SessionBridge, SessionBridgeBuilder};
pub use classify::{ClassifiedEvent, EventCategory, EventKind, LifecycleSignal, classify};
pub use config::{BargeInConfig, FrameConfig, SessionConfig, ToolDefinition};
pub use error::{BidiError, Result};
pub use events::{BidiOutputEvent, EventAccessor, RawEvent, ToolResult, ToolResultStatus, ToolUse};
pub use latency::{LatencyMeasurement, LatencyRecorder, LatencySummary, Milestone, MilestoneStats};
pub use loopback::{LoopbackConfig, LoopbackModel};
pub use model::{BidiModel, BoxedModel};
pub use scheduler::{InterruptionPhase, InterruptionScheduler};
pub use session::{BidiSession, BoxedSession, SessionContext, SessionHandle, SessionState};
pub use sink::{
    AudioCounter, CountingSink, EventConsumer, LoggingSink, Recording, RecordingSink,
    SharedConsumer,
};
pub use source::{FrameProducer, PcmFrameSource, SpeechEndMarker};
pub use tools::{ToolHandler, ToolRegistry};
pub use transport::{
    InboundMessage, OutboundMessage, SharedTransport, Transport, TransportFrameSource,
    TransportSink,
};

#[cfg(feature = "ws")]
pub use ws::{WsBidiModel, WsBidiSession};
