//! Plain-text harness reports.

use adk_bidi::classify::ASSISTANT_ROLE;
use adk_bidi::{
    InterruptionPhase, LatencyMeasurement, LatencySummary, Milestone, Recording, RunReport,
};

fn ms(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.0}ms"),
        None => "N/A".to_string(),
    }
}

fn header(title: &str) -> Vec<String> {
    vec!["=".repeat(60), title.to_string(), "=".repeat(60)]
}

/// Outcome and counters of one run.
pub fn run_summary(report: &RunReport) -> String {
    format!(
        "session {} ended: {} ({} frames sent, {} events received, {:.1}s)",
        report.session_id,
        report.outcome,
        report.frames_sent,
        report.events_received,
        report.elapsed.as_secs_f64()
    )
}

/// What a recording sink saw during one run.
pub fn recording_summary(rec: &Recording, report: &RunReport) -> String {
    let mut lines = vec!["--- result ---".to_string(), run_summary(report)];
    lines.push(format!("  events received: {}", rec.categories.len()));
    let types: Vec<String> =
        rec.type_counts().into_iter().map(|(tag, n)| format!("{tag}={n}")).collect();
    lines.push(format!("  event types: {}", types.join(", ")));
    lines.push(format!("  audio output: {} bytes in {} chunks", rec.audio_bytes, rec.audio_chunks));
    if !rec.tool_invocations.is_empty() {
        lines.push(format!("  tools called: {}", rec.tool_invocations.join(", ")));
    }
    for error in &rec.errors {
        lines.push(format!("  error: {error}"));
    }
    let replies = rec.final_transcripts(ASSISTANT_ROLE);
    if !replies.is_empty() {
        lines.push("  response text:".to_string());
        lines.extend(replies.iter().map(|text| format!("    -> {text}")));
    }
    lines.join("\n")
}

/// Milestones of one latency run.
pub fn latency_run(
    run: usize,
    measurement: Option<&LatencyMeasurement>,
    transcript: Option<&str>,
) -> String {
    let mut lines = vec![format!("--- Run #{run} ---")];
    lines.push(format!("  response text: {}", transcript.unwrap_or("(none)")));
    match measurement {
        Some(m) => {
            lines.push("  latency:".to_string());
            lines.extend(
                Milestone::ALL
                    .iter()
                    .map(|&milestone| format!("    {milestone}: {}", ms(m.get(milestone)))),
            );
        }
        None => lines.push("  latency: speech never finished, run not measured".to_string()),
    }
    lines.join("\n")
}

/// Mean, min and max per milestone across runs.
pub fn latency_summary(summary: &LatencySummary) -> String {
    let mut lines = header(&format!("Summary ({} runs)", summary.runs));
    for milestone in Milestone::ALL {
        match summary.get(milestone) {
            Some(stats) => lines.push(format!(
                "  {milestone}: mean {:.0}ms  min {:.0}ms  max {:.0}ms  (n={})",
                stats.mean_ms, stats.min_ms, stats.max_ms, stats.samples
            )),
            None => lines.push(format!("  {milestone}: no data")),
        }
    }
    lines.join("\n")
}

/// Whether a barge-in run produced an interruption.
pub fn barge_in_verdict(rec: &Recording, phase: InterruptionPhase) -> String {
    let mut lines = header("Barge-in result");
    let verdict = match rec.interruptions {
        0 => "FAIL: no interruption detected".to_string(),
        1 => "PASS: interruption detected".to_string(),
        n => format!("WARN: {n} interruptions detected, expected one"),
    };
    lines.push(format!("  {verdict}"));
    lines.push(format!("  final phase: {phase}"));
    lines.push(format!("  audio chunks received: {}", rec.audio_chunks));
    let types: Vec<String> = rec.type_counts().into_keys().collect();
    lines.push(format!("  event types: {}", types.join(", ")));
    for entry in rec.transcripts.iter().filter(|t| t.is_final) {
        lines.push(format!("  [{}] {}", entry.role, entry.text));
    }
    lines.join("\n")
}

/// One line per tool scenario.
pub fn tools_summary(results: &[(&str, Option<String>)]) -> String {
    let mut lines = header("Tool test summary");
    for (name, transcript) in results {
        let status = if transcript.is_some() { "OK" } else { "NG" };
        let text = transcript.as_deref().unwrap_or("(no response)");
        lines.push(format!("  {status} {name}: {text}"));
    }
    lines.join("\n")
}
