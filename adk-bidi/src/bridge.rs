//! Session orchestration: one input producer, many event consumers, one
//! backend session.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value;
use tokio::time::Instant;

use crate::classify::{ClassifiedEvent, EventKind, classify};
use crate::config::SessionConfig;
use crate::error::{BidiError, Result};
use crate::events::ToolResult;
use crate::model::BoxedModel;
use crate::session::{BidiSession, SessionContext, SessionHandle, SessionState};
use crate::sink::SharedConsumer;
use crate::source::FrameProducer;
use crate::tools::{STOP_CONVERSATION, ToolHandler, ToolRegistry};

/// How a run ended. None of these is a process failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The backend ended the event stream.
    BackendClosed,
    /// The wall-clock bound elapsed.
    TimedOut,
    /// The input producer failed or ran dry.
    InputEnded {
        /// Producer error.
        reason: String,
    },
    /// Connecting, sending or receiving failed on the backend side.
    BackendFailed {
        /// Backend error.
        reason: String,
    },
    /// The agent called `stop_conversation`.
    Stopped,
    /// A participant failed to start; the backend was never contacted.
    StartFailed {
        /// Name of the participant.
        participant: String,
        /// Start error.
        reason: String,
    },
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendClosed => write!(f, "backend closed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::InputEnded { reason } => write!(f, "input ended: {reason}"),
            Self::BackendFailed { reason } => write!(f, "backend failed: {reason}"),
            Self::Stopped => write!(f, "stopped by agent"),
            Self::StartFailed { participant, reason } => {
                write!(f, "{participant} failed to start: {reason}")
            }
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Session id shared with every participant.
    pub session_id: String,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Frames sent to the backend.
    pub frames_sent: u64,
    /// Events received from the backend.
    pub events_received: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Final session state.
    pub final_state: SessionState,
}

/// Builder for [`SessionBridge`].
#[derive(Default)]
pub struct SessionBridgeBuilder {
    model: Option<BoxedModel>,
    config: SessionConfig,
    tools: ToolRegistry,
}

impl SessionBridgeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend model.
    pub fn model(mut self, model: BoxedModel) -> Self {
        self.model = Some(model);
        self
    }

    /// Set the session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the tool registry.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Register one tool.
    pub fn tool(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.tools.register(handler);
        self
    }

    /// Build the bridge.
    pub fn build(self) -> Result<SessionBridge> {
        let model = self.model.ok_or_else(|| BidiError::config("Model is required"))?;
        let mut config = self.config;
        if !self.tools.is_empty() {
            config.tools = self.tools.definitions();
        }
        Ok(SessionBridge { model, config, tools: self.tools, active: AtomicBool::new(false) })
    }
}

/// Drives backend sessions, one at a time.
///
/// # Example
///
/// ```rust,ignore
/// let bridge = SessionBridge::builder()
///     .model(Arc::new(LoopbackModel::default()))
///     .config(SessionConfig::from_env())
///     .tools(default_tools())
///     .build()?;
///
/// let mut source = PcmFrameSource::from_file("question.pcm", FrameConfig::default()).await?;
/// let recorder = Arc::new(RecordingSink::new());
/// let report = bridge.run(&mut source, &[recorder.clone()], Some(Duration::from_secs(30))).await?;
/// println!("{}", report.outcome);
/// ```
pub struct SessionBridge {
    model: BoxedModel,
    config: SessionConfig,
    tools: ToolRegistry,
    active: AtomicBool,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn advance(handle: &mut SessionHandle, next: SessionState) {
    if let Err(e) = handle.advance(next) {
        tracing::warn!(session_id = %handle.id(), error = %e, "unexpected session transition");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Tool inputs may arrive as a JSON document encoded in a string.
fn normalize_input(input: &Value) -> Value {
    match input {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| input.clone()),
        other => other.clone(),
    }
}

impl SessionBridge {
    /// Create a new builder.
    pub fn builder() -> SessionBridgeBuilder {
        SessionBridgeBuilder::new()
    }

    /// Configuration sent to the backend on connect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Tools the bridge executes.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Whether a run is in progress.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run one session.
    ///
    /// Starts every participant, connects, then pumps input frames to the
    /// backend and backend events to every consumer until the backend
    /// closes, the input fails, the agent stops the conversation or
    /// `timeout` elapses. Every participant is stopped exactly once on the
    /// way out, whatever the outcome.
    ///
    /// A panicking producer ends the run as [`RunOutcome::InputEnded`].
    /// Dropping the returned future before it completes skips the `stop`
    /// calls.
    ///
    /// Only returns `Err` when this bridge is already running a session.
    pub async fn run(
        &self,
        input: &mut dyn FrameProducer,
        outputs: &[SharedConsumer],
        timeout: Option<Duration>,
    ) -> Result<RunReport> {
        if self.active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(BidiError::SessionActive);
        }
        let _guard = ActiveGuard(&self.active);

        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut handle = SessionHandle::new();
        let ctx = SessionContext::new(handle.id(), Arc::new(self.config.clone()));
        let frames = AtomicU64::new(0);
        let events = AtomicU64::new(0);

        tracing::info!(
            session_id = %handle.id(),
            provider = self.model.provider(),
            input = input.name(),
            outputs = outputs.len(),
            "starting session"
        );

        let outcome = match start_all(input, outputs, &ctx).await {
            Some(failure) => failure,
            None => self.drive(&mut handle, input, outputs, deadline, &frames, &events).await,
        };

        advance(&mut handle, SessionState::Closing);
        stop_all(input, outputs).await;
        advance(&mut handle, SessionState::Closed);

        let report = RunReport {
            session_id: handle.id().to_string(),
            outcome,
            frames_sent: frames.load(Ordering::Acquire),
            events_received: events.load(Ordering::Acquire),
            elapsed: started.elapsed(),
            final_state: handle.state(),
        };
        tracing::info!(
            session_id = %report.session_id,
            outcome = %report.outcome,
            frames_sent = report.frames_sent,
            events_received = report.events_received,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "session ended"
        );
        Ok(report)
    }

    async fn drive(
        &self,
        handle: &mut SessionHandle,
        input: &mut dyn FrameProducer,
        outputs: &[SharedConsumer],
        deadline: Option<Instant>,
        frames: &AtomicU64,
        events: &AtomicU64,
    ) -> RunOutcome {
        let connected = tokio::select! {
            result = self.model.connect(self.config.clone()) => result,
            _ = sleep_until(deadline) => return RunOutcome::TimedOut,
        };
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(session_id = %handle.id(), error = %e, "backend connect failed");
                return RunOutcome::BackendFailed { reason: e.to_string() };
            }
        };
        advance(handle, SessionState::Active);
        tracing::debug!(
            session_id = %handle.id(),
            backend_session_id = session.session_id(),
            "backend connected"
        );

        let outcome = tokio::select! {
            outcome = pump_input(session.as_ref(), input, frames) => outcome,
            outcome = self.pump_events(session.as_ref(), outputs, events) => outcome,
            _ = sleep_until(deadline) => RunOutcome::TimedOut,
        };

        if let Err(e) = session.close().await {
            tracing::debug!(session_id = %handle.id(), error = %e, "backend close failed");
        }
        outcome
    }

    async fn pump_events(
        &self,
        session: &dyn BidiSession,
        outputs: &[SharedConsumer],
        events: &AtomicU64,
    ) -> RunOutcome {
        let mut executed: HashSet<String> = HashSet::new();
        loop {
            let raw = match session.next_event().await {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return RunOutcome::BackendFailed { reason: e.to_string() },
                None => return RunOutcome::BackendClosed,
            };
            let event = classify(&raw);
            events.fetch_add(1, Ordering::AcqRel);
            fan_out(outputs, &event).await;

            if let EventKind::ToolInvocation { name, tool_use_id: Some(id), input: Some(args) } =
                &event.kind
            {
                if executed.insert(id.clone()) && self.run_tool(session, name, id, args).await {
                    return RunOutcome::Stopped;
                }
            }
        }
    }

    /// Execute a tool call and send its result. Returns true when the call
    /// ends the conversation.
    async fn run_tool(
        &self,
        session: &dyn BidiSession,
        name: &str,
        id: &str,
        args: &Value,
    ) -> bool {
        let result = match self.tools.get(name) {
            Some(tool) => match tool.execute(&normalize_input(args)).await {
                Ok(value) => ToolResult::success(id, name, value),
                Err(e) => {
                    tracing::warn!(tool = name, error = %e, "tool execution failed");
                    ToolResult::error(id, name, e.to_string())
                }
            },
            None => {
                tracing::warn!(tool = name, "unknown tool requested");
                ToolResult::error(id, name, format!("Unknown tool: {}", name))
            }
        };
        tracing::info!(tool = name, tool_use_id = id, status = ?result.status, "tool executed");
        if let Err(e) = session.send_tool_result(result).await {
            tracing::warn!(tool = name, error = %e, "failed to send tool result");
        }
        name == STOP_CONVERSATION && self.tools.contains(name)
    }
}

async fn pump_input(
    session: &dyn BidiSession,
    input: &mut dyn FrameProducer,
    frames: &AtomicU64,
) -> RunOutcome {
    loop {
        let frame = match AssertUnwindSafe(input.next_frame()).catch_unwind().await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                tracing::info!(input = input.name(), error = %e, "input ended");
                return RunOutcome::InputEnded { reason: e.to_string() };
            }
            Err(_) => {
                tracing::warn!(input = input.name(), "input producer panicked");
                let reason = "input producer panicked".to_string();
                return RunOutcome::InputEnded { reason };
            }
        };
        if let Err(e) = session.send_audio(&frame).await {
            return RunOutcome::BackendFailed { reason: e.to_string() };
        }
        frames.fetch_add(1, Ordering::AcqRel);
    }
}

/// Deliver `event` to every consumer concurrently. A panicking consumer
/// loses this one event and nothing else.
async fn fan_out(outputs: &[SharedConsumer], event: &ClassifiedEvent) {
    let deliveries = outputs.iter().map(|consumer| async move {
        if AssertUnwindSafe(consumer.deliver(event)).catch_unwind().await.is_err() {
            tracing::warn!(
                consumer = consumer.name(),
                category = %event.category(),
                "event consumer panicked; event dropped for this consumer"
            );
        }
    });
    join_all(deliveries).await;
}

/// Start the producer then every consumer. Returns the first failure.
/// Participants after a failed one are not started, but all are stopped.
async fn start_all(
    input: &mut dyn FrameProducer,
    outputs: &[SharedConsumer],
    ctx: &SessionContext,
) -> Option<RunOutcome> {
    if let Err(e) = input.start(ctx).await {
        tracing::warn!(participant = input.name(), error = %e, "start failed");
        return Some(RunOutcome::StartFailed {
            participant: input.name().to_string(),
            reason: e.to_string(),
        });
    }
    for consumer in outputs {
        if let Err(e) = consumer.start(ctx).await {
            tracing::warn!(participant = consumer.name(), error = %e, "start failed");
            return Some(RunOutcome::StartFailed {
                participant: consumer.name().to_string(),
                reason: e.to_string(),
            });
        }
    }
    None
}

async fn stop_all(input: &mut dyn FrameProducer, outputs: &[SharedConsumer]) {
    if let Err(e) = input.stop().await {
        tracing::warn!(participant = input.name(), error = %e, "stop failed");
    }
    for consumer in outputs {
        if let Err(e) = consumer.stop().await {
            tracing::warn!(participant = consumer.name(), error = %e, "stop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_input() {
        assert_eq!(
            normalize_input(&json!("{\"expression\": \"1 + 1\"}")),
            json!({"expression": "1 + 1"})
        );
        assert_eq!(normalize_input(&json!("plain")), json!("plain"));
        assert_eq!(normalize_input(&json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_builder_requires_model() {
        assert!(matches!(SessionBridge::builder().build(), Err(BidiError::ConfigError(_))));
    }

    #[test]
    fn test_outcome_display() {
        let outcome = RunOutcome::StartFailed { participant: "sink".into(), reason: "boom".into() };
        assert_eq!(outcome.to_string(), "sink failed to start: boom");
    }
}
