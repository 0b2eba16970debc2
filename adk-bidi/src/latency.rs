//! Response latency measurement.
//!
//! A [`LatencyRecorder`] is registered as one more consumer of a run. It
//! stamps the first occurrence of each [`Milestone`]; after the run the
//! stamps are turned into millisecond offsets from a reference instant,
//! normally the moment the input source ran out of speech.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::classify::{ClassifiedEvent, EventKind, LifecycleSignal};
use crate::sink::EventConsumer;
use crate::source::SpeechEndMarker;

/// Points of interest in an assistant response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    /// A response start after the first one.
    ResponseStarted,
    /// First assistant transcript.
    FirstTranscript,
    /// First audio chunk.
    FirstAudio,
    /// First final assistant transcript.
    FinalTranscript,
}

impl Milestone {
    /// All milestones in report order.
    pub const ALL: [Milestone; 4] =
        [Self::ResponseStarted, Self::FirstTranscript, Self::FirstAudio, Self::FinalTranscript];

    /// Snake case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResponseStarted => "response_started",
            Self::FirstTranscript => "first_transcript",
            Self::FirstAudio => "first_audio",
            Self::FinalTranscript => "final_transcript",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Milestone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milestone offsets of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyMeasurement {
    /// Instant the offsets are measured from.
    pub reference: Instant,
    /// Offset in milliseconds, `None` when the milestone was not observed.
    pub milestones: BTreeMap<Milestone, Option<f64>>,
}

impl LatencyMeasurement {
    /// Offset of `milestone`.
    pub fn get(&self, milestone: Milestone) -> Option<f64> {
        self.milestones.get(&milestone).copied().flatten()
    }
}

/// First-occurrence timestamps of the response milestones.
///
/// Each milestone is set through a single `OnceLock::set`, so concurrent
/// deliveries cannot overwrite an earlier stamp.
#[derive(Debug, Default)]
pub struct LatencyRecorder {
    marks: [OnceLock<Instant>; 4],
    response_starts: AtomicU32,
    final_text: OnceLock<String>,
}

impl LatencyRecorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `milestone` at `at` unless it already has a stamp.
    pub fn record(&self, milestone: Milestone, at: Instant) -> bool {
        self.marks[milestone.slot()].set(at).is_ok()
    }

    /// Stamp of `milestone`.
    pub fn timestamp(&self, milestone: Milestone) -> Option<Instant> {
        self.marks[milestone.slot()].get().copied()
    }

    /// Response starts seen so far.
    pub fn response_starts(&self) -> u32 {
        self.response_starts.load(Ordering::Acquire)
    }

    /// Text of the first final assistant transcript.
    pub fn final_transcript(&self) -> Option<&str> {
        self.final_text.get().map(String::as_str)
    }

    /// Offsets of every milestone from `reference`, in milliseconds.
    ///
    /// A stamp earlier than `reference` yields a negative offset.
    pub fn latencies(&self, reference: Instant) -> LatencyMeasurement {
        let milestones = Milestone::ALL
            .into_iter()
            .map(|m| (m, self.timestamp(m).map(|t| offset_ms(reference, t))))
            .collect();
        LatencyMeasurement { reference, milestones }
    }

    /// Offsets from the instant recorded by `marker`, if it was set.
    pub fn latencies_from(&self, marker: &SpeechEndMarker) -> Option<LatencyMeasurement> {
        marker.get().map(|reference| self.latencies(reference))
    }
}

fn offset_ms(reference: Instant, at: Instant) -> f64 {
    if at >= reference {
        (at - reference).as_nanos() as f64 / 1_000_000.0
    } else {
        -((reference - at).as_nanos() as f64 / 1_000_000.0)
    }
}

#[async_trait]
impl EventConsumer for LatencyRecorder {
    fn name(&self) -> &str {
        "latency_recorder"
    }

    async fn deliver(&self, event: &ClassifiedEvent) {
        let at = event.received_at;
        match &event.kind {
            // The first start answers the original turn; only later ones count.
            EventKind::Lifecycle { signal: LifecycleSignal::ResponseStart } => {
                let seen = self.response_starts.fetch_add(1, Ordering::AcqRel) + 1;
                if seen >= 2 {
                    self.record(Milestone::ResponseStarted, at);
                }
            }
            EventKind::AudioChunk { .. } => {
                self.record(Milestone::FirstAudio, at);
            }
            EventKind::TranscriptDelta { .. } if event.is_assistant_transcript() => {
                self.record(Milestone::FirstTranscript, at);
            }
            EventKind::TranscriptFinal { text, .. } if event.is_assistant_transcript() => {
                self.record(Milestone::FirstTranscript, at);
                if self.record(Milestone::FinalTranscript, at) {
                    let _ = self.final_text.set(text.clone());
                }
            }
            _ => {}
        }
    }
}

/// Mean, min and max of one milestone across runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MilestoneStats {
    /// Mean offset.
    pub mean_ms: f64,
    /// Smallest offset.
    pub min_ms: f64,
    /// Largest offset.
    pub max_ms: f64,
    /// Runs in which the milestone was observed.
    pub samples: usize,
}

/// Per-milestone statistics over several runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Number of runs aggregated.
    pub runs: usize,
    /// Statistics, `None` when no run observed the milestone.
    pub stats: BTreeMap<Milestone, Option<MilestoneStats>>,
}

impl LatencySummary {
    /// Aggregate `measurements`, counting only runs that observed each
    /// milestone.
    pub fn aggregate(measurements: &[LatencyMeasurement]) -> Self {
        let stats = Milestone::ALL
            .into_iter()
            .map(|m| {
                let values: Vec<f64> = measurements.iter().filter_map(|r| r.get(m)).collect();
                (m, stats_of(&values))
            })
            .collect();
        Self { runs: measurements.len(), stats }
    }

    /// Statistics of `milestone`.
    pub fn get(&self, milestone: Milestone) -> Option<MilestoneStats> {
        self.stats.get(&milestone).copied().flatten()
    }
}

fn stats_of(values: &[f64]) -> Option<MilestoneStats> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(MilestoneStats {
        mean_ms: sum / values.len() as f64,
        min_ms: min,
        max_ms: max,
        samples: values.len(),
    })
}
