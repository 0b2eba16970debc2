//! Consumers of classified backend events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::classify::{ClassifiedEvent, EventCategory, EventKind, LifecycleSignal};
use crate::error::Result;
use crate::session::SessionContext;

/// Push side of a run: receives every classified event in backend order.
///
/// `deliver` has no error channel. A consumer that fails to forward an event
/// logs the failure and returns, so one dropped message never ends a session.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Name used in logs and start failure reports.
    fn name(&self) -> &str;

    /// Acquire resources before the first event.
    async fn start(&self, _ctx: &SessionContext) -> Result<()> {
        Ok(())
    }

    /// Consume one event.
    async fn deliver(&self, event: &ClassifiedEvent);

    /// Release resources. Called once per run, even when `start` failed.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// A shared consumer for fan-out.
pub type SharedConsumer = Arc<dyn EventConsumer>;

/// Lock-free counter of delivered audio chunks.
#[derive(Debug, Clone, Default)]
pub struct AudioCounter(Arc<AtomicU64>);

impl AudioCounter {
    /// A counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Counts audio chunks for the barge-in scheduler.
#[derive(Debug, Clone, Default)]
pub struct CountingSink {
    counter: AudioCounter,
}

impl CountingSink {
    /// A sink with a fresh counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the shared counter.
    pub fn counter(&self) -> AudioCounter {
        self.counter.clone()
    }
}

#[async_trait]
impl EventConsumer for CountingSink {
    fn name(&self) -> &str {
        "counting_sink"
    }

    async fn deliver(&self, event: &ClassifiedEvent) {
        if event.category() == EventCategory::AudioChunk {
            self.counter.increment();
        }
    }
}

/// One transcript line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    /// Speaker.
    pub role: String,
    /// Text.
    pub text: String,
    /// Whether the text is final.
    pub is_final: bool,
}

/// Everything a [`RecordingSink`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Recording {
    /// Category of every event, in delivery order.
    pub categories: Vec<EventCategory>,
    /// Raw type tag of every event, in delivery order.
    pub source_types: Vec<String>,
    /// Transcripts in delivery order.
    pub transcripts: Vec<TranscriptEntry>,
    /// Audio chunk count.
    pub audio_chunks: u64,
    /// Decoded audio byte total.
    pub audio_bytes: usize,
    /// Interruption count.
    pub interruptions: u64,
    /// Response start count.
    pub response_starts: u64,
    /// Tool names, in call order.
    pub tool_invocations: Vec<String>,
    /// Error messages.
    pub errors: Vec<String>,
}

impl Recording {
    /// Number of events of `category`.
    pub fn count(&self, category: EventCategory) -> usize {
        self.categories.iter().filter(|c| **c == category).count()
    }

    /// Event counts per raw type tag.
    pub fn type_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for tag in &self.source_types {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Final transcripts spoken by `role`.
    pub fn final_transcripts(&self, role: &str) -> Vec<&str> {
        self.transcripts
            .iter()
            .filter(|t| t.is_final && t.role == role)
            .map(|t| t.text.as_str())
            .collect()
    }
}

/// Records every event for later assertions and reports.
#[derive(Debug, Default)]
pub struct RecordingSink {
    inner: Mutex<Recording>,
}

impl RecordingSink {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the recording so far.
    pub fn snapshot(&self) -> Recording {
        self.inner.lock().clone()
    }
}

/// Length of the data encoded by a base64 string, without decoding it.
fn decoded_len(encoded: &str) -> usize {
    let trimmed = encoded.trim_end_matches('=');
    trimmed.len() * 3 / 4
}

#[async_trait]
impl EventConsumer for RecordingSink {
    fn name(&self) -> &str {
        "recording_sink"
    }

    async fn deliver(&self, event: &ClassifiedEvent) {
        let mut rec = self.inner.lock();
        rec.categories.push(event.category());
        rec.source_types.push(event.source_type.clone());
        match &event.kind {
            EventKind::AudioChunk { audio } => {
                rec.audio_chunks += 1;
                rec.audio_bytes += decoded_len(audio);
            }
            EventKind::TranscriptDelta { role, text } => rec.transcripts.push(TranscriptEntry {
                role: role.clone(),
                text: text.clone(),
                is_final: false,
            }),
            EventKind::TranscriptFinal { role, text } => rec.transcripts.push(TranscriptEntry {
                role: role.clone(),
                text: text.clone(),
                is_final: true,
            }),
            EventKind::Interruption { .. } => rec.interruptions += 1,
            EventKind::ToolInvocation { name, .. } => rec.tool_invocations.push(name.clone()),
            EventKind::Error { message } => rec.errors.push(message.clone()),
            EventKind::Lifecycle { signal: LifecycleSignal::ResponseStart } => {
                rec.response_starts += 1
            }
            _ => {}
        }
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LoggingSink {
    verbose_audio: bool,
}

impl LoggingSink {
    /// A logger that summarises audio chunks at debug level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every audio chunk at info level.
    pub fn with_verbose_audio(mut self, verbose: bool) -> Self {
        self.verbose_audio = verbose;
        self
    }
}

#[async_trait]
impl EventConsumer for LoggingSink {
    fn name(&self) -> &str {
        "logging_sink"
    }

    async fn deliver(&self, event: &ClassifiedEvent) {
        match &event.kind {
            EventKind::AudioChunk { audio } => {
                if self.verbose_audio {
                    tracing::info!(bytes = decoded_len(audio), "audio chunk");
                } else {
                    tracing::debug!(bytes = decoded_len(audio), "audio chunk");
                }
            }
            EventKind::TranscriptDelta { role, text } => {
                tracing::debug!(%role, %text, "transcript delta");
            }
            EventKind::TranscriptFinal { role, text } => {
                tracing::info!(%role, %text, "transcript");
            }
            EventKind::Interruption { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or(""), "interruption");
            }
            EventKind::ToolInvocation { name, tool_use_id, .. } => {
                let tool_use_id = tool_use_id.as_deref().unwrap_or("");
                tracing::info!(%name, tool_use_id, "tool use");
            }
            EventKind::Error { message } => tracing::warn!(%message, "backend error"),
            EventKind::Lifecycle { signal } => tracing::info!(?signal, "lifecycle"),
            EventKind::Usage { input_tokens, output_tokens, total_tokens } => {
                tracing::debug!(input_tokens, output_tokens, total_tokens, "usage");
            }
            EventKind::Unknown => {
                tracing::debug!(source_type = %event.source_type, "unknown event")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use serde_json::json;

    #[tokio::test]
    async fn test_counting_sink_counts_audio_only() {
        let sink = CountingSink::new();
        let counter = sink.counter();
        sink.deliver(&classify(&json!({"type": "bidi_audio_stream", "audio": "AAAA"}))).await;
        sink.deliver(&classify(&json!({"type": "bidi_transcript_stream"}))).await;
        sink.deliver(&classify(&json!({"type": "bidi_audio_stream", "audio": "AAAA"}))).await;
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_recording_sink_accumulates() {
        let sink = RecordingSink::new();
        for event in [
            json!({"type": "bidi_response_start"}),
            json!({"type": "bidi_audio_stream", "audio": "AQID"}),
            json!({"type": "bidi_transcript_stream", "role": "assistant", "text": "はい", "is_final": true}),
            json!({"type": "bidi_interruption"}),
            json!({"type": "mystery"}),
        ] {
            sink.deliver(&classify(&event)).await;
        }
        let rec = sink.snapshot();
        assert_eq!(
            rec.categories,
            vec![
                EventCategory::Lifecycle,
                EventCategory::AudioChunk,
                EventCategory::TranscriptFinal,
                EventCategory::Interruption,
                EventCategory::Unknown,
            ]
        );
        assert_eq!(rec.audio_bytes, 3);
        assert_eq!(rec.interruptions, 1);
        assert_eq!(rec.response_starts, 1);
        assert_eq!(rec.final_transcripts("assistant"), vec!["はい"]);
        assert_eq!(rec.type_counts().get("mystery"), Some(&1));
    }

    #[test]
    fn test_decoded_len() {
        assert_eq!(decoded_len("AQID"), 3);
        assert_eq!(decoded_len("AQI="), 2);
        assert_eq!(decoded_len("AQ=="), 1);
        assert_eq!(decoded_len(""), 0);
    }
}
