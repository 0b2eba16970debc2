//! Barge-in input scheduling.
//!
//! [`InterruptionScheduler`] plays a question, pauses long enough for the
//! backend to take its turn, waits until the assistant has audibly started
//! answering, then talks over it with a second buffer.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;

use crate::audio::AudioFrame;
use crate::config::BargeInConfig;
use crate::error::Result;
use crate::sink::AudioCounter;
use crate::source::{FrameClock, FrameProducer, load_pcm};

/// Phase of a barge-in run. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionPhase {
    /// Sending the question.
    Speaking,
    /// Silence after the question.
    TrailingSilence,
    /// Polling the audio counter.
    AwaitingResponse,
    /// Sending the interrupting speech.
    Interrupting,
    /// Silence after the interruption.
    InterruptTrailingSilence,
    /// Nothing left but silence.
    Done,
}

impl std::fmt::Display for InterruptionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Speaking => "speaking",
            Self::TrailingSilence => "trailing_silence",
            Self::AwaitingResponse => "awaiting_response",
            Self::Interrupting => "interrupting",
            Self::InterruptTrailingSilence => "interrupt_trailing_silence",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Frame producer that drives one barge-in episode.
#[derive(Debug)]
pub struct InterruptionScheduler {
    clock: FrameClock,
    config: BargeInConfig,
    question: Vec<Bytes>,
    interrupt: Vec<Bytes>,
    counter: AudioCounter,
    phase: InterruptionPhase,
    index: usize,
    phase_tx: watch::Sender<InterruptionPhase>,
}

impl InterruptionScheduler {
    /// Schedule `question` then `interrupt`, gated on `counter` reaching the
    /// configured response threshold.
    pub fn new(
        question: impl Into<Bytes>,
        interrupt: impl Into<Bytes>,
        counter: AudioCounter,
        config: BargeInConfig,
    ) -> Result<Self> {
        let clock = FrameClock::new(config.frame)?;
        let question = clock.split(&question.into());
        let interrupt = clock.split(&interrupt.into());
        let (phase_tx, _) = watch::channel(InterruptionPhase::Speaking);
        tracing::debug!(
            question_frames = question.len(),
            interrupt_frames = interrupt.len(),
            threshold = config.response_threshold,
            "barge-in schedule prepared"
        );
        Ok(Self {
            clock,
            config,
            question,
            interrupt,
            counter,
            phase: InterruptionPhase::Speaking,
            index: 0,
            phase_tx,
        })
    }

    /// Load both buffers from raw PCM files.
    pub async fn from_files(
        question: impl AsRef<Path>,
        interrupt: impl AsRef<Path>,
        counter: AudioCounter,
        config: BargeInConfig,
    ) -> Result<Self> {
        let question = load_pcm(question).await?;
        let interrupt = load_pcm(interrupt).await?;
        Self::new(question, interrupt, counter, config)
    }

    /// Current phase.
    pub fn phase(&self) -> InterruptionPhase {
        self.phase
    }

    /// Receiver notified on every phase change.
    pub fn subscribe(&self) -> watch::Receiver<InterruptionPhase> {
        self.phase_tx.subscribe()
    }

    /// Frames handed out so far.
    pub fn frames_emitted(&self) -> u64 {
        self.clock.emitted()
    }

    fn enter(&mut self, next: InterruptionPhase) {
        tracing::info!(from = %self.phase, to = %next, "barge-in phase");
        self.phase = next;
        self.index = 0;
        self.phase_tx.send_replace(next);
    }

    fn take(buffer: &[Bytes], index: &mut usize) -> Option<Bytes> {
        let data = buffer.get(*index).cloned()?;
        *index += 1;
        Some(data)
    }

    fn take_silence(&mut self, silence_ms: u32) -> Option<Bytes> {
        if self.index < self.clock.config().frames_for(silence_ms) {
            self.index += 1;
            Some(self.clock.silence())
        } else {
            None
        }
    }

    /// Step the state machine until a phase yields data or has none to give.
    fn advance(&mut self) -> Option<Bytes> {
        loop {
            match self.phase {
                InterruptionPhase::Speaking => match Self::take(&self.question, &mut self.index) {
                    Some(data) => return Some(data),
                    None => self.enter(InterruptionPhase::TrailingSilence),
                },
                InterruptionPhase::TrailingSilence => {
                    match self.take_silence(self.config.silence_ms) {
                        Some(data) => return Some(data),
                        None => self.enter(InterruptionPhase::AwaitingResponse),
                    }
                }
                InterruptionPhase::AwaitingResponse => {
                    if self.counter.get() >= self.config.response_threshold {
                        self.enter(InterruptionPhase::Interrupting);
                    } else {
                        return None;
                    }
                }
                InterruptionPhase::Interrupting => {
                    match Self::take(&self.interrupt, &mut self.index) {
                        Some(data) => return Some(data),
                        None => self.enter(InterruptionPhase::InterruptTrailingSilence),
                    }
                }
                InterruptionPhase::InterruptTrailingSilence => {
                    match self.take_silence(self.config.interrupt_silence_ms) {
                        Some(data) => return Some(data),
                        None => self.enter(InterruptionPhase::Done),
                    }
                }
                InterruptionPhase::Done => return None,
            }
        }
    }
}

#[async_trait]
impl FrameProducer for InterruptionScheduler {
    fn name(&self) -> &str {
        "interruption_scheduler"
    }

    async fn next_frame(&mut self) -> Result<AudioFrame> {
        let data = self.advance().unwrap_or_else(|| self.clock.silence());
        Ok(self.clock.emit(data).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameConfig;

    fn config() -> BargeInConfig {
        BargeInConfig::default().with_silence_ms(40).with_response_threshold(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_threshold() {
        let counter = AudioCounter::new();
        let mut scheduler = InterruptionScheduler::new(
            vec![1u8; 640],
            vec![2u8; 1280],
            counter.clone(),
            config(),
        )
        .unwrap();

        // question frame, then two silence frames
        for _ in 0..3 {
            scheduler.next_frame().await.unwrap();
        }
        assert_eq!(scheduler.phase(), InterruptionPhase::TrailingSilence);

        for _ in 0..5 {
            let frame = scheduler.next_frame().await.unwrap();
            assert!(frame.is_silent());
            assert_eq!(scheduler.phase(), InterruptionPhase::AwaitingResponse);
        }

        counter.increment();
        counter.increment();
        scheduler.next_frame().await.unwrap();
        assert_eq!(scheduler.phase(), InterruptionPhase::AwaitingResponse);

        counter.increment();
        let frame = scheduler.next_frame().await.unwrap();
        assert_eq!(scheduler.phase(), InterruptionPhase::Interrupting);
        assert_eq!(frame.data.as_ref(), &[2u8; 640][..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_done_and_stays_silent() {
        let counter = AudioCounter::new();
        for _ in 0..10 {
            counter.increment();
        }
        let mut scheduler =
            InterruptionScheduler::new(vec![1u8; 640], vec![2u8; 640], counter, config()).unwrap();
        let mut phases = scheduler.subscribe();

        let mut seen = vec![*phases.borrow()];
        for _ in 0..12 {
            scheduler.next_frame().await.unwrap();
            if phases.has_changed().unwrap() {
                seen.push(*phases.borrow_and_update());
            }
        }
        assert_eq!(scheduler.phase(), InterruptionPhase::Done);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), InterruptionPhase::Done);
        assert!(scheduler.next_frame().await.unwrap().is_silent());
        assert_eq!(scheduler.frames_emitted(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_is_gap_free() {
        let frame = FrameConfig::default().with_trailing_silence_ms(0);
        let cfg = BargeInConfig::default().with_frame(frame).with_silence_ms(20);
        let mut scheduler =
            InterruptionScheduler::new(vec![1u8; 1280], Vec::new(), AudioCounter::new(), cfg)
                .unwrap();
        for expected in 0..6u64 {
            assert_eq!(scheduler.next_frame().await.unwrap().sequence, expected);
        }
    }

    #[tokio::test]
    async fn test_missing_question_file() {
        let err = InterruptionScheduler::from_files(
            "/nope/question.pcm",
            "/nope/interrupt.pcm",
            AudioCounter::new(),
            BargeInConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_missing_resource());
    }
}
