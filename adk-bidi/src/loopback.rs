//! In-process simulated agent backend.
//!
//! [`LoopbackModel`] detects user turns from input energy and answers each
//! one with a scripted response: lifecycle signals, transcripts and one audio
//! chunk per received input frame. Speaking while it answers interrupts it.
//! It needs no network access, so offline runs and tests use it in place of a
//! real backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::{AudioFormat, AudioFrame};
use crate::classify::ASSISTANT_ROLE;
use crate::config::SessionConfig;
use crate::error::{BidiError, Result};
use crate::events::{BidiOutputEvent, RawEvent, ToolResult, ToolUse};
use crate::model::BidiModel;
use crate::session::{BidiSession, BoxedSession};

const USER_ROLE: &str = "user";

/// A tool call the simulated agent makes at the start of every response.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedToolCall {
    /// Tool name.
    pub name: String,
    /// Tool input.
    pub input: Value,
}

/// Behaviour of the simulated agent.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackConfig {
    /// Quiet input frames that end a user turn.
    pub turn_silence_frames: usize,
    /// Peak amplitude above which an input frame counts as speech.
    pub speech_threshold: u16,
    /// Audio chunks in one full response.
    pub response_chunks: usize,
    /// What the assistant says.
    pub response_text: String,
    /// Optional tool call made before answering.
    pub tool_call: Option<ScriptedToolCall>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            turn_silence_frames: 25,
            speech_threshold: 500,
            response_chunks: 250,
            response_text: "はい、元気です。ありがとうございます。".to_string(),
            tool_call: None,
        }
    }
}

impl LoopbackConfig {
    /// Set the number of quiet frames that end a turn.
    pub fn with_turn_silence_frames(mut self, frames: usize) -> Self {
        self.turn_silence_frames = frames;
        self
    }

    /// Set the response length in audio chunks.
    pub fn with_response_chunks(mut self, chunks: usize) -> Self {
        self.response_chunks = chunks;
        self
    }

    /// Set the response text.
    pub fn with_response_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = text.into();
        self
    }

    /// Make a tool call at the start of every response.
    pub fn with_tool_call(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_call = Some(ScriptedToolCall { name: name.into(), input });
        self
    }
}

/// Factory for simulated sessions.
#[derive(Debug, Clone, Default)]
pub struct LoopbackModel {
    config: LoopbackConfig,
    tool_results: Arc<Mutex<Vec<ToolResult>>>,
}

impl LoopbackModel {
    /// A model with the given behaviour.
    pub fn new(config: LoopbackConfig) -> Self {
        Self { config, tool_results: Arc::default() }
    }

    /// Tool results received by every session of this model.
    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.tool_results.lock().clone()
    }
}

#[async_trait]
impl BidiModel for LoopbackModel {
    fn provider(&self) -> &str {
        "loopback"
    }

    fn model_id(&self) -> &str {
        "loopback"
    }

    async fn connect(&self, config: SessionConfig) -> Result<BoxedSession> {
        let session = LoopbackSession::open(self.config.clone(), config, self.tool_results.clone());
        Ok(Box::new(session))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Turn {
    Listening { heard_speech: bool, quiet_frames: usize },
    AwaitingTool { response_id: String, tool_use_id: String, waited: usize },
    Responding { response_id: String, chunks_sent: usize, text: String },
}

impl Turn {
    fn listening(heard_speech: bool) -> Self {
        Self::Listening { heard_speech, quiet_frames: 0 }
    }
}

/// Turn-taking state of one simulated session.
#[derive(Debug)]
struct Responder {
    config: LoopbackConfig,
    text_only: bool,
    output_format: AudioFormat,
    chunk: String,
    turn: Turn,
    responses: u64,
    user_turns: u64,
}

impl Responder {
    fn new(config: LoopbackConfig, session: &SessionConfig) -> Self {
        let frame_bytes = session.output_format.frame_bytes(crate::config::DEFAULT_FRAME_MS);
        let samples: Vec<u8> = (0..frame_bytes / 2)
            .flat_map(|i| (if i % 2 == 0 { 1000i16 } else { -1000i16 }).to_le_bytes())
            .collect();
        Self {
            config,
            text_only: session.text_only,
            output_format: session.output_format,
            chunk: base64::engine::general_purpose::STANDARD.encode(samples),
            turn: Turn::listening(false),
            responses: 0,
            user_turns: 0,
        }
    }

    fn audio_event(&self) -> BidiOutputEvent {
        BidiOutputEvent::AudioStream {
            audio: self.chunk.clone(),
            format: Some(self.output_format.encoding.to_string()),
            sample_rate: Some(self.output_format.sample_rate),
            channels: Some(self.output_format.channels),
        }
    }

    fn on_frame(&mut self, frame: &AudioFrame) -> Vec<BidiOutputEvent> {
        let speech = frame.peak_amplitude() >= self.config.speech_threshold;
        let mut out = Vec::new();
        match &mut self.turn {
            Turn::Listening { heard_speech, quiet_frames } => {
                if speech {
                    *heard_speech = true;
                    *quiet_frames = 0;
                } else if *heard_speech {
                    *quiet_frames += 1;
                    if *quiet_frames >= self.config.turn_silence_frames {
                        self.user_turns += 1;
                        let text = format!("（音声入力 {}）", self.user_turns);
                        self.begin_response(&text, &mut out);
                    }
                }
            }
            Turn::AwaitingTool { waited, .. } => {
                *waited += 1;
                if *waited >= self.config.turn_silence_frames {
                    tracing::debug!("no tool result arrived, answering without it");
                    self.resume_after_tool(None, &mut out);
                }
            }
            Turn::Responding { .. } if speech => {
                out.push(BidiOutputEvent::Interruption { reason: Some("user_speech".to_string()) });
                out.push(BidiOutputEvent::ResponseComplete {
                    response_id: self.response_id(),
                    stop_reason: Some("interrupted".to_string()),
                });
                self.turn = Turn::listening(true);
            }
            Turn::Responding { chunks_sent, .. } => {
                *chunks_sent += 1;
                out.push(self.audio_event());
                self.finish_if_done(&mut out);
            }
        }
        out
    }

    fn on_text(&mut self, text: &str) -> Vec<BidiOutputEvent> {
        let mut out = Vec::new();
        self.user_turns += 1;
        self.begin_response(text, &mut out);
        // Nothing paces a text turn, so any audio is sent in one burst.
        while matches!(self.turn, Turn::Responding { .. }) {
            if let Turn::Responding { chunks_sent, .. } = &mut self.turn {
                *chunks_sent += 1;
            }
            out.push(self.audio_event());
            self.finish_if_done(&mut out);
        }
        out
    }

    fn on_tool_result(&mut self, result: &ToolResult) -> Vec<BidiOutputEvent> {
        let mut out = Vec::new();
        let awaiting = matches!(
            &self.turn,
            Turn::AwaitingTool { tool_use_id, .. } if *tool_use_id == result.tool_use_id
        );
        if awaiting {
            let text = match &result.content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.resume_after_tool(Some(text), &mut out);
        }
        out
    }

    fn response_id(&self) -> Option<String> {
        match &self.turn {
            Turn::Responding { response_id, .. } | Turn::AwaitingTool { response_id, .. } => {
                Some(response_id.clone())
            }
            Turn::Listening { .. } => None,
        }
    }

    fn begin_response(&mut self, user_text: &str, out: &mut Vec<BidiOutputEvent>) {
        // User transcription block, then the assistant block.
        out.push(BidiOutputEvent::ResponseStart { response_id: None });
        out.push(BidiOutputEvent::transcript(USER_ROLE, user_text, true));

        self.responses += 1;
        let response_id = format!("resp-{}", self.responses);
        out.push(BidiOutputEvent::ResponseStart { response_id: Some(response_id.clone()) });

        if let Some(call) = self.config.tool_call.clone() {
            let tool_use_id = format!("tool-{}", self.responses);
            out.push(BidiOutputEvent::ToolUseStream {
                current_tool_use: ToolUse {
                    tool_use_id: Some(tool_use_id.clone()),
                    name: call.name,
                    input: call.input,
                },
            });
            self.turn = Turn::AwaitingTool { response_id, tool_use_id, waited: 0 };
            return;
        }
        self.start_speaking(response_id, self.config.response_text.clone(), out);
    }

    fn resume_after_tool(&mut self, tool_text: Option<String>, out: &mut Vec<BidiOutputEvent>) {
        let Turn::AwaitingTool { response_id, .. } = &self.turn else {
            return;
        };
        let response_id = response_id.clone();
        let text = tool_text.unwrap_or_else(|| self.config.response_text.clone());
        self.start_speaking(response_id, text, out);
    }

    fn start_speaking(
        &mut self,
        response_id: String,
        text: String,
        out: &mut Vec<BidiOutputEvent>,
    ) {
        out.push(BidiOutputEvent::transcript(ASSISTANT_ROLE, text.clone(), false));
        self.turn = Turn::Responding { response_id, chunks_sent: 0, text };
        if self.text_only {
            self.finish(out);
        } else {
            self.finish_if_done(out);
        }
    }

    fn finish_if_done(&mut self, out: &mut Vec<BidiOutputEvent>) {
        if let Turn::Responding { chunks_sent, .. } = &self.turn {
            if *chunks_sent >= self.config.response_chunks {
                self.finish(out);
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<BidiOutputEvent>) {
        let Turn::Responding { response_id, chunks_sent, text } =
            std::mem::replace(&mut self.turn, Turn::listening(false))
        else {
            return;
        };
        out.push(BidiOutputEvent::transcript(ASSISTANT_ROLE, text.clone(), true));
        out.push(BidiOutputEvent::ResponseComplete {
            response_id: Some(response_id),
            stop_reason: Some("complete".to_string()),
        });
        let input_tokens = self.user_turns * 8;
        let output_tokens = (text.chars().count() + chunks_sent) as u64;
        out.push(BidiOutputEvent::Usage {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        });
    }
}

/// One simulated session.
pub struct LoopbackSession {
    session_id: String,
    connected: AtomicBool,
    sender: Mutex<Option<mpsc::UnboundedSender<RawEvent>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawEvent>>,
    responder: Mutex<Responder>,
    tool_results: Arc<Mutex<Vec<ToolResult>>>,
}

impl LoopbackSession {
    fn open(
        config: LoopbackConfig,
        session: SessionConfig,
        tool_results: Arc<Mutex<Vec<ToolResult>>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = uuid::Uuid::new_v4().to_string();
        let _ = tx.send(RawEvent::Object(BidiOutputEvent::ConnectionStart {
            connection_id: Some(session_id.clone()),
            model: Some(session.model_id.clone()),
        }));
        tracing::debug!(%session_id, text_only = session.text_only, "loopback session opened");
        Self {
            session_id,
            connected: AtomicBool::new(true),
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            responder: Mutex::new(Responder::new(config, &session)),
            tool_results,
        }
    }

    fn emit(&self, events: Vec<BidiOutputEvent>) -> Result<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(BidiError::SessionClosed);
        };
        for event in events {
            tx.send(RawEvent::Object(event)).map_err(|_| BidiError::SessionClosed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BidiSession for LoopbackSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, frame: &AudioFrame) -> Result<()> {
        let events = self.responder.lock().on_frame(frame);
        self.emit(events)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let events = self.responder.lock().on_text(text);
        self.emit(events)
    }

    async fn send_tool_result(&self, result: ToolResult) -> Result<()> {
        let events = self.responder.lock().on_tool_result(&result);
        self.tool_results.lock().push(result);
        self.emit(events)
    }

    async fn next_event(&self) -> Option<Result<RawEvent>> {
        self.receiver.lock().await.recv().await.map(Ok)
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let close = BidiOutputEvent::ConnectionClose { reason: Some("closed".to_string()) };
        let _ = self.emit(vec![close]);
        self.sender.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAccessor;

    fn loud() -> AudioFrame {
        let data: Vec<u8> = std::iter::repeat(4000i16.to_le_bytes()).take(320).flatten().collect();
        AudioFrame::new(data, AudioFormat::default(), 0)
    }

    fn quiet() -> AudioFrame {
        AudioFrame::silence(640, AudioFormat::default(), 0)
    }

    fn tags(events: &[BidiOutputEvent]) -> Vec<&'static str> {
        events.iter().map(BidiOutputEvent::tag).collect()
    }

    fn responder(config: LoopbackConfig) -> Responder {
        Responder::new(config, &SessionConfig::default())
    }

    #[test]
    fn test_turn_ends_after_quiet_frames() {
        let mut r = responder(
            LoopbackConfig::default().with_turn_silence_frames(2).with_response_chunks(2),
        );
        assert!(r.on_frame(&quiet()).is_empty());
        assert!(r.on_frame(&loud()).is_empty());
        assert!(r.on_frame(&quiet()).is_empty());
        let events = r.on_frame(&quiet());
        assert_eq!(
            tags(&events),
            vec![
                "bidi_response_start",
                "bidi_transcript_stream",
                "bidi_response_start",
                "bidi_transcript_stream",
            ]
        );
        assert_eq!(tags(&r.on_frame(&quiet())), vec!["bidi_audio_stream"]);
        assert_eq!(
            tags(&r.on_frame(&quiet())),
            vec![
                "bidi_audio_stream",
                "bidi_transcript_stream",
                "bidi_response_complete",
                "bidi_usage",
            ]
        );
    }

    #[test]
    fn test_speech_interrupts_response() {
        let mut r = responder(LoopbackConfig::default().with_turn_silence_frames(1));
        r.on_frame(&loud());
        r.on_frame(&quiet());
        r.on_frame(&quiet());
        let events = r.on_frame(&loud());
        assert_eq!(tags(&events), vec!["bidi_interruption", "bidi_response_complete"]);
        assert_eq!(events[1].str_field("stop_reason").as_deref(), Some("interrupted"));
        assert!(r.on_frame(&loud()).is_empty());
        // the interrupting speech becomes the next turn
        let events = r.on_frame(&quiet());
        assert_eq!(events[2].str_field("response_id").as_deref(), Some("resp-2"));
    }

    #[test]
    fn test_text_only_answers_without_audio() {
        let text_only = SessionConfig::default().with_text_only(true);
        let mut r = Responder::new(LoopbackConfig::default(), &text_only);
        let events = r.on_text("こんにちは");
        assert!(!tags(&events).contains(&"bidi_audio_stream"));
        assert!(tags(&events).contains(&"bidi_response_complete"));
    }

    #[test]
    fn test_tool_call_waits_for_result() {
        let mut r = responder(
            LoopbackConfig::default()
                .with_turn_silence_frames(1)
                .with_response_chunks(1)
                .with_tool_call("simple_calculator", serde_json::json!({"expression": "2 + 3"})),
        );
        r.on_frame(&loud());
        let events = r.on_frame(&quiet());
        assert_eq!(events.last().map(BidiOutputEvent::tag), Some("tool_use_stream"));

        let events = r.on_tool_result(&ToolResult::success(
            "tool-1",
            "simple_calculator",
            Value::String("2 + 3 = 5".to_string()),
        ));
        assert_eq!(events[0].str_field("text").as_deref(), Some("2 + 3 = 5"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let model = LoopbackModel::default();
        let session = model.connect(SessionConfig::default()).await.unwrap();
        session.close().await.unwrap();
        let first = session.next_event().await.unwrap().unwrap();
        assert_eq!(first.event_type(), "bidi_connection_start");
        let second = session.next_event().await.unwrap().unwrap();
        assert_eq!(second.event_type(), "bidi_connection_close");
        assert!(session.next_event().await.is_none());
        assert!(matches!(session.send_audio(&quiet()).await, Err(BidiError::SessionClosed)));
    }
}
