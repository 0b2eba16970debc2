//! Offline harnesses that drive the bridge from recorded PCM files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adk_bidi::classify::ASSISTANT_ROLE;
use adk_bidi::tools::default_tools;
use adk_bidi::{
    BargeInConfig, BoxedModel, CountingSink, FrameConfig, InterruptionScheduler, LatencyRecorder,
    LatencySummary, LoggingSink, LoopbackConfig, LoopbackModel, PcmFrameSource, RecordingSink,
    SessionBridge, SessionConfig, SharedConsumer,
};
use anyhow::{Context, Result};

use crate::cli::{Backend, Cli, ToolScenario, ToolTest};
use crate::report;

/// Backend and session settings shared by every harness.
pub struct Settings {
    pub backend: Backend,
    pub model: BoxedModel,
    pub config: SessionConfig,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Self {
        Self { backend: cli.backend, model: cli.model(), config: cli.session_config() }
    }

    fn bridge(&self) -> Result<SessionBridge> {
        self.bridge_with(self.model.clone())
    }

    fn bridge_with(&self, model: BoxedModel) -> Result<SessionBridge> {
        SessionBridge::builder()
            .model(model)
            .config(self.config.clone())
            .tools(default_tools())
            .build()
            .context("building session bridge")
    }
}

/// Open a PCM source, or report the missing file and return `None`.
async fn open_pcm(path: &Path) -> Result<Option<PcmFrameSource>> {
    match PcmFrameSource::from_file(path, FrameConfig::default()).await {
        Ok(source) => {
            println!(
                "  input: {} ({:.0}ms speech + {}ms silence)",
                path.display(),
                source.speech_ms(),
                adk_bidi::config::DEFAULT_SILENCE_MS
            );
            Ok(Some(source))
        }
        Err(e) if e.is_missing_resource() => {
            println!("  audio file not found: {} (skipped)", path.display());
            println!(
                "  convert a recording with: \
                 ffmpeg -i in.aiff -f s16le -acodec pcm_s16le -ar 16000 -ac 1 out.pcm"
            );
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
    }
}

/// Send one utterance and print everything that came back.
pub async fn run_connect(settings: &Settings, pcm: &Path, timeout: Duration) -> Result<()> {
    let Some(mut source) = open_pcm(pcm).await? else {
        return Ok(());
    };
    let recorder = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> = vec![Arc::new(LoggingSink::new()), recorder.clone()];

    let report = settings.bridge()?.run(&mut source, &outputs, Some(timeout)).await?;
    println!("{}", report::recording_summary(&recorder.snapshot(), &report));
    Ok(())
}

/// Run the same utterance `runs` times and summarise response latency.
pub async fn run_latency(
    settings: &Settings,
    pcm: &Path,
    runs: usize,
    timeout: Duration,
) -> Result<()> {
    println!("latency test: {} run(s) of {}", runs, pcm.display());
    let bridge = settings.bridge()?;
    let mut measurements = Vec::with_capacity(runs);

    for run in 1..=runs {
        let Some(mut source) = open_pcm(pcm).await? else {
            return Ok(());
        };
        let speech_end = source.speech_end();
        let latency = Arc::new(LatencyRecorder::new());
        let outputs: Vec<SharedConsumer> = vec![Arc::new(LoggingSink::new()), latency.clone()];

        let report = bridge.run(&mut source, &outputs, Some(timeout)).await?;
        tracing::debug!(run, outcome = %report.outcome, "latency run finished");

        let measurement = latency.latencies_from(&speech_end);
        println!("{}", report::latency_run(run, measurement.as_ref(), latency.final_transcript()));
        measurements.extend(measurement);
    }

    println!("{}", report::latency_summary(&LatencySummary::aggregate(&measurements)));
    Ok(())
}

/// Ask a question, then talk over the answer.
pub async fn run_barge_in(
    settings: &Settings,
    question: &Path,
    interrupt: &Path,
    threshold: u64,
    timeout: Duration,
) -> Result<()> {
    let counting = CountingSink::new();
    let config = BargeInConfig::default().with_response_threshold(threshold);
    let loaded =
        InterruptionScheduler::from_files(question, interrupt, counting.counter(), config).await;
    let mut scheduler = match loaded {
        Ok(scheduler) => scheduler,
        Err(e) if e.is_missing_resource() => {
            println!("  {e} (skipped)");
            return Ok(());
        }
        Err(e) => return Err(e).context("loading barge-in audio"),
    };

    let mut phases = scheduler.subscribe();
    let watcher = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            println!("  [phase] {}", *phases.borrow_and_update());
        }
    });

    let recorder = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> =
        vec![Arc::new(counting), Arc::new(LoggingSink::new()), recorder.clone()];
    let report = settings.bridge()?.run(&mut scheduler, &outputs, Some(timeout)).await?;
    watcher.abort();

    println!("{}", report::run_summary(&report));
    println!("{}", report::barge_in_verdict(&recorder.snapshot(), scheduler.phase()));
    Ok(())
}

/// Ask questions that need the clock and calculator tools.
pub async fn run_tools(
    settings: &Settings,
    test: ToolTest,
    time_pcm: &Path,
    calc_pcm: &Path,
    timeout: Duration,
) -> Result<()> {
    let mut results = Vec::new();
    for scenario in test.scenarios() {
        println!("test: {}", scenario.description());
        let pcm = match scenario {
            ToolScenario::Time => time_pcm,
            ToolScenario::Calc => calc_pcm,
        };
        let Some(mut source) = open_pcm(pcm).await? else {
            results.push((scenario.name(), None));
            continue;
        };

        let bridge = match settings.backend {
            // The simulated agent has no language model; script the call instead.
            Backend::Loopback => {
                let (name, input) = scenario.scripted_call();
                let model =
                    LoopbackModel::new(LoopbackConfig::default().with_tool_call(name, input));
                settings.bridge_with(Arc::new(model))?
            }
            Backend::Ws => settings.bridge()?,
        };

        let recorder = Arc::new(RecordingSink::new());
        let outputs: Vec<SharedConsumer> = vec![Arc::new(LoggingSink::new()), recorder.clone()];
        let report = bridge.run(&mut source, &outputs, Some(timeout)).await?;

        let rec = recorder.snapshot();
        println!("{}", report::recording_summary(&rec, &report));
        let replies = rec.final_transcripts(ASSISTANT_ROLE);
        results.push((scenario.name(), (!replies.is_empty()).then(|| replies.join(" "))));
    }

    println!("{}", report::tools_summary(&results));
    Ok(())
}
