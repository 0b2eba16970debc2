//! Real-time paced audio input.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::audio::{AudioFrame, split_frames};
use crate::config::FrameConfig;
use crate::error::{BidiError, Result};
use crate::session::SessionContext;

/// Pull side of a run: yields the next input frame, possibly after waiting.
#[async_trait]
pub trait FrameProducer: Send {
    /// Name used in logs and start failure reports.
    fn name(&self) -> &str;

    /// Acquire resources before the first frame.
    async fn start(&mut self, _ctx: &SessionContext) -> Result<()> {
        Ok(())
    }

    /// Produce the next frame. An error ends the run.
    async fn next_frame(&mut self) -> Result<AudioFrame>;

    /// Release resources. Called once per run, even when `start` failed.
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Instant at which a source ran out of speech, written once.
#[derive(Debug, Clone, Default)]
pub struct SpeechEndMarker(Arc<OnceLock<Instant>>);

impl SpeechEndMarker {
    /// A fresh, unset marker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `now` unless a time was already recorded.
    pub fn mark(&self) {
        let _ = self.0.set(Instant::now());
    }

    /// The recorded instant.
    pub fn get(&self) -> Option<Instant> {
        self.0.get().copied()
    }
}

/// Read a raw PCM16LE file, reporting an absent file as
/// [`BidiError::MissingResource`].
pub async fn load_pcm(path: impl AsRef<Path>) -> Result<Bytes> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Bytes::from(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BidiError::missing(path)),
        Err(e) => Err(e.into()),
    }
}

/// Stamps sequence numbers and paces frames at the configured cadence.
#[derive(Debug, Clone)]
pub(crate) struct FrameClock {
    config: FrameConfig,
    silence: Bytes,
    sequence: u64,
}

impl FrameClock {
    pub(crate) fn new(config: FrameConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, silence: Bytes::from(vec![0u8; config.frame_bytes()]), sequence: 0 })
    }

    pub(crate) fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub(crate) fn silence(&self) -> Bytes {
        self.silence.clone()
    }

    pub(crate) fn split(&self, pcm: &Bytes) -> Vec<Bytes> {
        split_frames(pcm, self.config.frame_bytes())
    }

    pub(crate) fn emitted(&self) -> u64 {
        self.sequence
    }

    /// Sleep one frame duration, then wrap `data` as the next frame.
    pub(crate) async fn emit(&mut self, data: Bytes) -> AudioFrame {
        tokio::time::sleep(self.config.frame_duration()).await;
        let frame = AudioFrame::new(data, self.config.format, self.sequence);
        self.sequence += 1;
        frame
    }
}

/// Splits a PCM buffer into paced frames, then trailing silence, then
/// silence forever.
///
/// # Example
///
/// ```rust,ignore
/// let mut source = PcmFrameSource::from_file("/tmp/question.pcm", FrameConfig::default()).await?;
/// let speech_end = source.speech_end();
/// let frame = source.next_frame().await?;
/// ```
#[derive(Debug)]
pub struct PcmFrameSource {
    clock: FrameClock,
    frames: Vec<Bytes>,
    index: usize,
    silence_remaining: usize,
    speech_end: SpeechEndMarker,
}

impl PcmFrameSource {
    /// Frame `pcm` according to `config`.
    pub fn new(pcm: impl Into<Bytes>, config: FrameConfig) -> Result<Self> {
        let clock = FrameClock::new(config)?;
        let frames = clock.split(&pcm.into());
        tracing::debug!(
            speech_frames = frames.len(),
            silence_frames = config.silence_frames(),
            frame_ms = config.frame_ms,
            "framed pcm buffer"
        );
        Ok(Self {
            clock,
            frames,
            index: 0,
            silence_remaining: config.silence_frames(),
            speech_end: SpeechEndMarker::new(),
        })
    }

    /// Load and frame a raw PCM file.
    pub async fn from_file(path: impl AsRef<Path>, config: FrameConfig) -> Result<Self> {
        Self::new(load_pcm(path).await?, config)
    }

    /// Marker set when the last speech frame is handed out.
    pub fn speech_end(&self) -> SpeechEndMarker {
        self.speech_end.clone()
    }

    /// Number of speech frames in the buffer.
    pub fn speech_frames(&self) -> usize {
        self.frames.len()
    }

    /// Duration of the speech buffer in milliseconds.
    pub fn speech_ms(&self) -> f64 {
        let bytes: usize = self.frames.iter().map(Bytes::len).sum();
        self.clock.config().format.duration_ms(bytes)
    }

    /// Whether the speech buffer and the trailing silence are both used up.
    pub fn is_exhausted(&self) -> bool {
        self.index >= self.frames.len() && self.silence_remaining == 0
    }

    fn next_data(&mut self) -> Bytes {
        if let Some(data) = self.frames.get(self.index).cloned() {
            self.index += 1;
            if self.index == self.frames.len() {
                self.speech_end.mark();
            }
            return data;
        }
        self.speech_end.mark();
        self.silence_remaining = self.silence_remaining.saturating_sub(1);
        self.clock.silence()
    }
}

#[async_trait]
impl FrameProducer for PcmFrameSource {
    fn name(&self) -> &str {
        "pcm_source"
    }

    async fn next_frame(&mut self) -> Result<AudioFrame> {
        let data = self.next_data();
        Ok(self.clock.emit(data).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn speech(frames: usize) -> Vec<u8> {
        vec![0x11; frames * 640]
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_then_silence_forever() {
        let config = FrameConfig::default().with_trailing_silence_ms(60);
        let mut source = PcmFrameSource::new(speech(2), config).unwrap();
        assert_eq!(source.speech_frames(), 2);

        let mut frames = Vec::new();
        for _ in 0..8 {
            frames.push(source.next_frame().await.unwrap());
        }
        assert!(!frames[0].is_silent());
        assert!(!frames[1].is_silent());
        assert!(frames[2..].iter().all(|f| f.is_silent() && f.data.len() == 640));
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, (0..8).collect::<Vec<_>>());
        assert!(source.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_frame_waits_one_duration() {
        let mut source = PcmFrameSource::new(speech(1), FrameConfig::default()).unwrap();
        let started = Instant::now();
        source.next_frame().await.unwrap();
        source.next_frame().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_end_marked_on_last_speech_frame() {
        let mut source = PcmFrameSource::new(speech(3), FrameConfig::default()).unwrap();
        let marker = source.speech_end();
        let started = Instant::now();
        source.next_frame().await.unwrap();
        source.next_frame().await.unwrap();
        assert!(marker.get().is_none());
        source.next_frame().await.unwrap();
        assert_eq!(marker.get(), Some(started + Duration::from_millis(40)));
        source.next_frame().await.unwrap();
        assert_eq!(marker.get(), Some(started + Duration::from_millis(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_marks_at_first_silence() {
        let mut source = PcmFrameSource::new(Vec::new(), FrameConfig::default()).unwrap();
        let frame = source.next_frame().await.unwrap();
        assert!(frame.is_silent());
        assert!(source.speech_end().get().is_some());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = PcmFrameSource::from_file("/definitely/not/here.pcm", FrameConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_missing_resource());
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &speech(5)).unwrap();
        let source = PcmFrameSource::from_file(file.path(), FrameConfig::default()).await.unwrap();
        assert_eq!(source.speech_frames(), 5);
        assert!((source.speech_ms() - 100.0).abs() < 1e-9);
    }
}
