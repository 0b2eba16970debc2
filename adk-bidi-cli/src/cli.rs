use std::path::PathBuf;
use std::sync::Arc;

use adk_bidi::{BoxedModel, LoopbackModel, SessionConfig, WsBidiModel};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};

#[derive(Parser, Debug)]
#[command(name = "bidi-bridge")]
#[command(
    about = "Duplex voice agent bridge: WebSocket server and test harnesses",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Agent backend to connect to
    #[arg(long, global = true, value_enum, default_value_t = Backend::Loopback)]
    pub backend: Backend,

    /// Endpoint of the `ws` backend
    #[arg(
        long,
        global = true,
        env = "BIDI_BACKEND_URL",
        default_value = "ws://127.0.0.1:9000/bidi"
    )]
    pub endpoint: String,

    /// Backend region (defaults to NOVA_SONIC_REGION, then us-east-1)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Output voice (defaults to NOVA_SONIC_VOICE, then tiffany)
    #[arg(long, global = true)]
    pub voice: Option<String>,

    /// Credential profile passed to the backend
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Request text-only output
    #[arg(long, global = true)]
    pub text_only: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the bridge to browser clients over WebSocket
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },

    /// Send one recorded utterance and report what came back
    Connect {
        /// Raw PCM16LE 16 kHz mono file
        #[arg(long, default_value = "/tmp/test_speech_ja.pcm")]
        pcm: PathBuf,

        /// Run timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Measure response latency over several runs
    Latency {
        /// Raw PCM16LE 16 kHz mono file
        #[arg(long, default_value = "/tmp/test_simple.pcm")]
        pcm: PathBuf,

        /// Number of runs
        #[arg(long, default_value_t = 3)]
        runs: usize,

        /// Per-run timeout in seconds
        #[arg(long, default_value_t = 20)]
        timeout_secs: u64,
    },

    /// Talk over the assistant and check that it yields
    BargeIn {
        /// Question played first
        #[arg(long, default_value = "/tmp/test_long.pcm")]
        question: PathBuf,

        /// Speech played over the assistant's answer
        #[arg(long, default_value = "/tmp/test_interrupt.pcm")]
        interrupt: PathBuf,

        /// Assistant audio chunks to wait for before interrupting
        #[arg(long, default_value_t = adk_bidi::config::DEFAULT_RESPONSE_THRESHOLD)]
        threshold: u64,

        /// Run timeout in seconds
        #[arg(long, default_value_t = 45)]
        timeout_secs: u64,
    },

    /// Ask questions that should trigger tool calls
    Tools {
        /// Scenario to run
        #[arg(long = "test", value_enum, default_value_t = ToolTest::Both)]
        test: ToolTest,

        /// Question asking for the time
        #[arg(long, default_value = "/tmp/test_time.pcm")]
        time_pcm: PathBuf,

        /// Question asking for a calculation
        #[arg(long, default_value = "/tmp/test_calc.pcm")]
        calc_pcm: PathBuf,

        /// Per-scenario timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// In-process simulated agent
    Loopback,
    /// JSON-over-WebSocket agent backend
    Ws,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolTest {
    Time,
    Calc,
    Both,
}

/// One tool scenario: its name, and the call a simulated agent makes for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolScenario {
    Time,
    Calc,
}

impl ToolTest {
    pub fn scenarios(self) -> Vec<ToolScenario> {
        match self {
            Self::Time => vec![ToolScenario::Time],
            Self::Calc => vec![ToolScenario::Calc],
            Self::Both => vec![ToolScenario::Time, ToolScenario::Calc],
        }
    }
}

impl ToolScenario {
    pub fn name(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Calc => "calc",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Time => "current time (get_current_time)",
            Self::Calc => "arithmetic (simple_calculator)",
        }
    }

    /// Tool call scripted into the loopback backend.
    pub fn scripted_call(self) -> (&'static str, Value) {
        match self {
            Self::Time => ("get_current_time", json!({})),
            Self::Calc => ("simple_calculator", json!({"expression": "123 * 456"})),
        }
    }
}

impl Cli {
    /// Session configuration from the environment with flag overrides.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::from_env().with_text_only(self.text_only);
        if let Some(region) = &self.region {
            config = config.with_region(region.clone());
        }
        if let Some(voice) = &self.voice {
            config = config.with_voice(voice.clone());
        }
        if let Some(profile) = &self.profile {
            config = config.with_profile(profile.clone());
        }
        config
    }

    /// The selected backend.
    pub fn model(&self) -> BoxedModel {
        match self.backend {
            Backend::Loopback => Arc::new(LoopbackModel::default()),
            Backend::Ws => Arc::new(WsBidiModel::new(self.endpoint.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_before_subcommand() {
        let cli = Cli::try_parse_from([
            "bidi-bridge",
            "--backend",
            "ws",
            "--region",
            "ap-northeast-1",
            "--text-only",
            "latency",
            "--runs",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::Ws);
        assert!(matches!(cli.command, Commands::Latency { runs: 5, timeout_secs: 20, .. }));

        let config = cli.session_config();
        assert_eq!(config.region, "ap-northeast-1");
        assert_eq!(config.modalities(), vec!["text"]);
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["bidi-bridge", "serve"]).unwrap();
        assert_eq!(cli.backend, Backend::Loopback);
        assert!(matches!(
            cli.command,
            Commands::Serve { port: 8080, ref host } if host == "0.0.0.0"
        ));
    }

    #[test]
    fn test_tool_scenarios() {
        let cli = Cli::try_parse_from(["bidi-bridge", "tools", "--test", "calc"]).unwrap();
        let Commands::Tools { test, .. } = cli.command else {
            panic!("expected tools command");
        };
        assert_eq!(test.scenarios(), vec![ToolScenario::Calc]);
        assert_eq!(ToolTest::Both.scenarios().len(), 2);
    }
}
