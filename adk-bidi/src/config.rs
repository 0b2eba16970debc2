//! Configuration types for bidi sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::AudioFormat;
use crate::error::{BidiError, Result};

/// Backend model used when none is configured.
pub const DEFAULT_MODEL_ID: &str = "amazon.nova-sonic-v1:0";
/// Backend region used when `NOVA_SONIC_REGION` is unset.
pub const DEFAULT_REGION: &str = "us-east-1";
/// Output voice used when `NOVA_SONIC_VOICE` is unset.
pub const DEFAULT_VOICE: &str = "tiffany";
/// Credential profile used by the command line harnesses.
pub const DEFAULT_PROFILE: &str = "sandbox";
/// Duration of one streamed frame.
pub const DEFAULT_FRAME_MS: u32 = 20;
/// Silence appended after speech so the backend detects the end of the turn.
pub const DEFAULT_SILENCE_MS: u32 = 3000;
/// Assistant audio chunks that must be seen before a barge-in starts.
pub const DEFAULT_RESPONSE_THRESHOLD: u64 = 5;

/// Environment variable overriding the backend region.
pub const REGION_ENV: &str = "NOVA_SONIC_REGION";
/// Environment variable overriding the output voice.
pub const VOICE_ENV: &str = "NOVA_SONIC_VOICE";

const DEFAULT_INSTRUCTION: &str = "あなたは親切な日本語アシスタントです。簡潔に、自然な話し言葉で答えてください。\
時刻を聞かれたら get_current_time を、計算を頼まれたら simple_calculator を使ってください。\
会話の終了を求められたら stop_conversation を呼んでください。";

/// Tool definition advertised to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, parameters: None }
    }

    /// Set the tool description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Set the parameters schema.
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }
}

/// Configuration for one backend session.
///
/// Built per connection; nothing here is process-global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backend model identifier.
    pub model_id: String,
    /// Backend region.
    pub region: String,
    /// Voice used for audio output.
    pub voice: String,
    /// Credential profile name.
    pub profile: String,
    /// System instruction for the agent.
    pub instruction: String,
    /// Request text-only output instead of audio.
    pub text_only: bool,
    /// Format of audio sent to the backend.
    pub input_format: AudioFormat,
    /// Format of audio received from the backend.
    pub output_format: AudioFormat,
    /// Tools advertised to the backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            profile: DEFAULT_PROFILE.to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            text_only: false,
            input_format: AudioFormat::pcm16_16khz(),
            output_format: AudioFormat::pcm16_16khz(),
            tools: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `NOVA_SONIC_REGION` and `NOVA_SONIC_VOICE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SessionConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(region) = lookup(REGION_ENV).filter(|v| !v.is_empty()) {
            config.region = region;
        }
        if let Some(voice) = lookup(VOICE_ENV).filter(|v| !v.is_empty()) {
            config.voice = voice;
        }
        config
    }

    /// Set the model identifier.
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Set the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the voice.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// Set the credential profile.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Set the system instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Request text-only output.
    pub fn with_text_only(mut self, text_only: bool) -> Self {
        self.text_only = text_only;
        self
    }

    /// Replace the advertised tools.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Output modalities requested from the backend.
    pub fn modalities(&self) -> Vec<&'static str> {
        if self.text_only { vec!["text"] } else { vec!["text", "audio"] }
    }
}

/// Framing parameters for an audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Audio format of every frame.
    pub format: AudioFormat,
    /// Duration of each frame.
    pub frame_ms: u32,
    /// Silence appended after the speech buffer.
    pub trailing_silence_ms: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::pcm16_16khz(),
            frame_ms: DEFAULT_FRAME_MS,
            trailing_silence_ms: DEFAULT_SILENCE_MS,
        }
    }
}

impl FrameConfig {
    /// Set the frame duration.
    pub fn with_frame_ms(mut self, frame_ms: u32) -> Self {
        self.frame_ms = frame_ms;
        self
    }

    /// Set the trailing silence duration.
    pub fn with_trailing_silence_ms(mut self, ms: u32) -> Self {
        self.trailing_silence_ms = ms;
        self
    }

    /// Set the audio format.
    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    /// Bytes in one frame.
    pub fn frame_bytes(&self) -> usize {
        self.format.frame_bytes(self.frame_ms)
    }

    /// Number of frames needed to cover `silence_ms`.
    pub fn frames_for(&self, silence_ms: u32) -> usize {
        if self.frame_ms == 0 { 0 } else { (silence_ms / self.frame_ms) as usize }
    }

    /// Number of trailing silence frames.
    pub fn silence_frames(&self) -> usize {
        self.frames_for(self.trailing_silence_ms)
    }

    /// Wall-clock duration of one frame.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_ms))
    }

    /// Reject framings that cannot produce non-empty frames of whole samples.
    pub fn validate(&self) -> Result<()> {
        if self.frame_ms == 0 {
            return Err(BidiError::config("frame duration must be positive"));
        }
        if self.format.bits_per_sample != 16 {
            return Err(BidiError::config(format!(
                "only 16-bit PCM is supported, got {} bits",
                self.format.bits_per_sample
            )));
        }
        if self.format.channels == 0 || self.format.sample_rate == 0 {
            return Err(BidiError::config("sample rate and channel count must be positive"));
        }
        let exact = self.format.bytes_per_second() * self.frame_ms as usize;
        let block = self.format.channels as usize * self.format.bytes_per_sample();
        if exact % 1000 != 0 || (exact / 1000) % block != 0 {
            return Err(BidiError::config(format!(
                "{} ms frames at {} Hz x {} channels do not hold a whole number of samples",
                self.frame_ms, self.format.sample_rate, self.format.channels
            )));
        }
        if self.frame_bytes() == 0 {
            return Err(BidiError::config(format!(
                "{} ms frames at {} Hz are empty",
                self.frame_ms, self.format.sample_rate
            )));
        }
        Ok(())
    }
}

/// Parameters of a barge-in run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BargeInConfig {
    /// Framing shared by both speech buffers.
    pub frame: FrameConfig,
    /// Silence after the question before waiting for a response.
    pub silence_ms: u32,
    /// Assistant audio chunks to observe before interrupting.
    pub response_threshold: u64,
    /// Silence after the interrupting speech.
    pub interrupt_silence_ms: u32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            silence_ms: DEFAULT_SILENCE_MS,
            response_threshold: DEFAULT_RESPONSE_THRESHOLD,
            interrupt_silence_ms: DEFAULT_SILENCE_MS,
        }
    }
}

impl BargeInConfig {
    /// Set the response threshold.
    pub fn with_response_threshold(mut self, threshold: u64) -> Self {
        self.response_threshold = threshold;
        self
    }

    /// Set both silence durations.
    pub fn with_silence_ms(mut self, ms: u32) -> Self {
        self.silence_ms = ms;
        self.interrupt_silence_ms = ms;
        self
    }

    /// Set the frame configuration.
    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }
}
