//! Backend session trait and session bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audio::AudioFrame;
use crate::config::SessionConfig;
use crate::error::{BidiError, Result};
use crate::events::{RawEvent, ToolResult};

/// Lifecycle state of a bridged session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not yet connected.
    Idle,
    /// Streaming.
    Active,
    /// Shutting down.
    Closing,
    /// Finished.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Identity and state of one session, owned by the bridge that drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    id: String,
    state: SessionState,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    /// New idle handle with a random id.
    pub fn new() -> Self {
        Self { id: Uuid::new_v4().to_string(), state: SessionState::Idle }
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. States only move forward; skipping ahead is allowed
    /// so a failed connect can go straight from idle to closing.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if next <= self.state {
            return Err(BidiError::InvalidTransition { from: self.state, to: next });
        }
        tracing::debug!(
            session_id = %self.id,
            from = %self.state,
            to = %next,
            "session transition"
        );
        self.state = next;
        Ok(())
    }
}

/// Per-connection context handed to every participant of a run.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Session id, shared with the [`SessionHandle`].
    pub session_id: String,
    /// Session configuration.
    pub config: Arc<SessionConfig>,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    /// Create a context for `session_id`.
    pub fn new(session_id: impl Into<String>, config: Arc<SessionConfig>) -> Self {
        Self { session_id: session_id.into(), config, started_at: Utc::now() }
    }
}

/// A live duplex session with an agent backend.
#[async_trait]
pub trait BidiSession: Send + Sync {
    /// Get the backend session ID.
    fn session_id(&self) -> &str;

    /// Check if the session is currently connected.
    fn is_connected(&self) -> bool;

    /// Send one input audio frame.
    async fn send_audio(&self, frame: &AudioFrame) -> Result<()>;

    /// Send a text message.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Answer a tool call.
    async fn send_tool_result(&self, result: ToolResult) -> Result<()>;

    /// Get the next event from the backend.
    ///
    /// Returns `None` when the session is closed.
    async fn next_event(&self) -> Option<Result<RawEvent>>;

    /// Close the session gracefully.
    async fn close(&self) -> Result<()>;
}

/// A boxed session type for dynamic dispatch.
pub type BoxedSession = Box<dyn BidiSession>;
