//! End-to-end tests of [`SessionBridge`] against the loopback backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use adk_bidi::tools::{STOP_CONVERSATION, default_tools};
use adk_bidi::{
    AudioFormat, AudioFrame, BargeInConfig, BidiError, BidiModel, BoxedSession, ClassifiedEvent,
    CountingSink, EventCategory, EventConsumer, FrameConfig, FrameProducer, InterruptionPhase,
    InterruptionScheduler, LatencyRecorder, LoopbackConfig, LoopbackModel, Milestone,
    OutboundMessage, PcmFrameSource, RecordingSink, Result, RunOutcome, SessionBridge,
    SessionConfig, SessionContext, SessionState, SharedConsumer, ToolResultStatus, Transport,
    TransportFrameSource, TransportSink,
};
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// `frames` frames of 20 ms, 16 kHz speech-level PCM.
fn speech(frames: usize) -> Vec<u8> {
    std::iter::repeat(4000i16.to_le_bytes()).take(320 * frames).flatten().collect()
}

fn bridge(model: LoopbackModel) -> SessionBridge {
    SessionBridge::builder().model(Arc::new(model)).tools(default_tools()).build().unwrap()
}

/// Transport that records outbound messages and replays queued inbound ones.
struct MockTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    closed: AtomicBool,
    fail_sends: bool,
}

impl MockTransport {
    fn new(fail_sends: bool) -> (Arc<Self>, mpsc::UnboundedSender<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            fail_sends,
        });
        (transport, tx)
    }

    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        if self.fail_sends {
            return Err(BidiError::transport("client went away"));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn recv(&self) -> Option<Result<Value>> {
        self.inbound.lock().await.recv().await.map(Ok)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Consumer that counts lifecycle calls and can misbehave on request.
#[derive(Default)]
struct Tracker {
    name: &'static str,
    starts: AtomicUsize,
    stops: AtomicUsize,
    delivered: AtomicUsize,
    fail_start: bool,
    panic_on_deliver: bool,
}

impl Tracker {
    fn named(name: &'static str) -> Self {
        Self { name, ..Default::default() }
    }
}

#[async_trait]
impl EventConsumer for Tracker {
    fn name(&self) -> &str {
        self.name
    }

    async fn start(&self, _ctx: &SessionContext) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(BidiError::transport("cannot open channel"));
        }
        Ok(())
    }

    async fn deliver(&self, _event: &ClassifiedEvent) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_deliver {
            panic!("consumer exploded");
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Backend that refuses every connection.
struct UnreachableModel;

#[async_trait]
impl BidiModel for UnreachableModel {
    fn provider(&self) -> &str {
        "unreachable"
    }

    fn model_id(&self) -> &str {
        "none"
    }

    async fn connect(&self, _config: SessionConfig) -> Result<BoxedSession> {
        Err(BidiError::connection("connection refused"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_turn_forwards_and_measures() {
    let model = LoopbackModel::new(LoopbackConfig::default().with_response_chunks(20));
    let bridge = bridge(model);

    let mut source = PcmFrameSource::new(speech(10), FrameConfig::default()).unwrap();
    let speech_end = source.speech_end();
    let (transport, _inbound) = MockTransport::new(false);
    let recorder = Arc::new(RecordingSink::new());
    let latency = Arc::new(LatencyRecorder::new());
    let tracker = Arc::new(Tracker::named("tracker"));
    let outputs: Vec<SharedConsumer> = vec![
        Arc::new(TransportSink::new(transport.clone())),
        recorder.clone(),
        latency.clone(),
        tracker.clone(),
    ];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(2))).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert_eq!(report.final_state, SessionState::Closed);
    assert!(report.frames_sent >= 90, "frames sent: {}", report.frames_sent);
    assert_eq!(tracker.starts.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.stops.load(Ordering::SeqCst), 1);
    assert!(!bridge.is_active());

    let rec = recorder.snapshot();
    assert_eq!(rec.audio_chunks, 20);
    assert_eq!(rec.interruptions, 0);
    assert_eq!(rec.response_starts, 2);
    assert_eq!(rec.final_transcripts("user"), vec!["（音声入力 1）"]);
    assert_eq!(rec.final_transcripts("assistant"), vec!["はい、元気です。ありがとうございます。"]);
    assert_eq!(rec.count(EventCategory::Lifecycle), 4);

    // lifecycle and usage stay on the backend side
    let sent = transport.sent();
    assert_eq!(sent.iter().filter(|m| m.kind() == "audio").count(), 20);
    assert_eq!(sent.iter().filter(|m| m.kind() == "transcript").count(), 3);
    assert_eq!(sent.len(), 23);

    let measurement = latency.latencies_from(&speech_end).unwrap();
    let started = measurement.get(Milestone::ResponseStarted).unwrap();
    let first_text = measurement.get(Milestone::FirstTranscript).unwrap();
    let first_audio = measurement.get(Milestone::FirstAudio).unwrap();
    let final_text = measurement.get(Milestone::FinalTranscript).unwrap();
    assert!(started > 0.0);
    assert!(first_text >= started);
    assert!(first_audio >= first_text);
    assert!(final_text >= first_audio + 19.0 * 20.0);
    assert_eq!(latency.final_transcript(), Some("はい、元気です。ありがとうございます。"));
}

/// Category a forwarded wire message was produced from.
fn forwarded_category(message: &OutboundMessage) -> EventCategory {
    match message {
        OutboundMessage::Audio { .. } => EventCategory::AudioChunk,
        OutboundMessage::Transcript { is_final: true, .. } => EventCategory::TranscriptFinal,
        OutboundMessage::Transcript { is_final: false, .. } => EventCategory::TranscriptDelta,
        OutboundMessage::Interruption => EventCategory::Interruption,
        OutboundMessage::ToolUse { .. } => EventCategory::ToolInvocation,
        OutboundMessage::Error { .. } => EventCategory::Error,
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_sink_sees_backend_order() {
    use EventCategory::*;

    let bridge = bridge(LoopbackModel::new(LoopbackConfig::default().with_response_chunks(20)));
    let mut source = PcmFrameSource::new(speech(10), FrameConfig::default()).unwrap();
    let (transport, _inbound) = MockTransport::new(false);
    let first = Arc::new(RecordingSink::new());
    let second = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> =
        vec![first.clone(), Arc::new(TransportSink::new(transport.clone())), second.clone()];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(3))).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::TimedOut);

    // connection start, user block, assistant block, then the response tail
    let mut expected = vec![Lifecycle, Lifecycle, TranscriptFinal, Lifecycle, TranscriptDelta];
    expected.extend(std::iter::repeat_n(AudioChunk, 20));
    expected.extend([TranscriptFinal, Lifecycle, Usage]);

    let seen_first = first.snapshot().categories;
    let seen_second = second.snapshot().categories;
    assert_eq!(seen_first, expected);
    assert_eq!(seen_second, seen_first);
    assert_eq!(report.events_received, expected.len() as u64);

    let forwardable: Vec<EventCategory> =
        seen_first.iter().copied().filter(EventCategory::is_forwardable).collect();
    let forwarded: Vec<EventCategory> = transport.sent().iter().map(forwarded_category).collect();
    assert_eq!(forwarded, forwardable);
}

/// Producer that yields a few silent frames and then panics.
struct PanickingSource {
    frames_before_panic: u64,
    produced: u64,
    stops: usize,
}

#[async_trait]
impl FrameProducer for PanickingSource {
    fn name(&self) -> &str {
        "panicking_source"
    }

    async fn next_frame(&mut self) -> Result<AudioFrame> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.produced == self.frames_before_panic {
            panic!("microphone driver crashed");
        }
        self.produced += 1;
        Ok(AudioFrame::new(vec![0u8; 640], AudioFormat::default(), self.produced))
    }

    async fn stop(&mut self) -> Result<()> {
        self.stops += 1;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_producer_ends_input() {
    let bridge = bridge(LoopbackModel::default());
    let mut source = PanickingSource { frames_before_panic: 3, produced: 0, stops: 0 };
    let tracker = Arc::new(Tracker::named("tracker"));
    let outputs: Vec<SharedConsumer> = vec![tracker.clone()];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(5))).await.unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::InputEnded { ref reason } if reason.contains("panicked")
    ));
    assert_eq!(report.frames_sent, 3);
    assert_eq!(report.final_state, SessionState::Closed);
    assert_eq!(source.stops, 1);
    assert_eq!(tracker.stops.load(Ordering::SeqCst), 1);
    assert!(!bridge.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_failing_transport_does_not_end_session() {
    let bridge = bridge(LoopbackModel::new(LoopbackConfig::default().with_response_chunks(5)));
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let (transport, _inbound) = MockTransport::new(true);
    let recorder = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> =
        vec![Arc::new(TransportSink::new(transport)), recorder.clone()];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(1))).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert_eq!(recorder.snapshot().audio_chunks, 5);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_consumer_is_isolated() {
    let bridge = bridge(LoopbackModel::new(LoopbackConfig::default().with_response_chunks(5)));
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let bad = Arc::new(Tracker { panic_on_deliver: true, ..Tracker::named("bad") });
    let recorder = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> = vec![bad.clone(), recorder.clone()];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(1))).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    let rec = recorder.snapshot();
    assert_eq!(rec.categories.len() as u64, report.events_received);
    assert_eq!(bad.delivered.load(Ordering::SeqCst) as u64, report.events_received);
    assert_eq!(bad.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_raises_one_interruption() {
    let bridge = bridge(LoopbackModel::default());
    let counting = CountingSink::new();
    let mut scheduler = InterruptionScheduler::new(
        speech(10),
        speech(5),
        counting.counter(),
        BargeInConfig::default(),
    )
    .unwrap();
    let recorder = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> = vec![Arc::new(counting), recorder.clone()];

    let report = bridge.run(&mut scheduler, &outputs, Some(Duration::from_secs(8))).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    assert_eq!(scheduler.phase(), InterruptionPhase::Done);
    let rec = recorder.snapshot();
    assert_eq!(rec.interruptions, 1);
    // the interrupting speech becomes a second user turn
    assert_eq!(rec.final_transcripts("user").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_waits_without_response() {
    // A backend that never answers leaves the scheduler waiting.
    let config = LoopbackConfig { speech_threshold: u16::MAX, ..LoopbackConfig::default() };
    let bridge = bridge(LoopbackModel::new(config));
    let counting = CountingSink::new();
    let counter = counting.counter();
    let mut scheduler = InterruptionScheduler::new(
        speech(10),
        speech(5),
        counter.clone(),
        BargeInConfig::default().with_silence_ms(200),
    )
    .unwrap();
    let outputs: Vec<SharedConsumer> = vec![Arc::new(counting)];

    bridge.run(&mut scheduler, &outputs, Some(Duration::from_secs(2))).await.unwrap();

    assert_eq!(counter.get(), 0);
    assert_eq!(scheduler.phase(), InterruptionPhase::AwaitingResponse);
}

#[tokio::test(start_paused = true)]
async fn test_tool_result_feeds_response() {
    let model = LoopbackModel::new(
        LoopbackConfig::default()
            .with_response_chunks(5)
            .with_tool_call("simple_calculator", json!({"expression": "2 + 3"})),
    );
    let bridge = bridge(model.clone());
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let recorder = Arc::new(RecordingSink::new());
    let outputs: Vec<SharedConsumer> = vec![recorder.clone()];

    bridge.run(&mut source, &outputs, Some(Duration::from_secs(1))).await.unwrap();

    let results = model.tool_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ToolResultStatus::Success);
    assert_eq!(results[0].content, json!("2 + 3 = 5"));
    let rec = recorder.snapshot();
    assert_eq!(rec.tool_invocations, vec!["simple_calculator"]);
    assert_eq!(rec.final_transcripts("assistant"), vec!["2 + 3 = 5"]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_tool_gets_error_result() {
    let model = LoopbackModel::new(
        LoopbackConfig::default()
            .with_response_chunks(5)
            .with_tool_call("rss_feed", json!({"url": "x"})),
    );
    let bridge = bridge(model.clone());
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();

    let report = bridge.run(&mut source, &[], Some(Duration::from_secs(1))).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::TimedOut);
    let results = model.tool_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ToolResultStatus::Error);
    assert_eq!(results[0].content, json!("Unknown tool: rss_feed"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_conversation_ends_run() {
    let model =
        LoopbackModel::new(LoopbackConfig::default().with_tool_call(STOP_CONVERSATION, json!({})));
    let bridge = bridge(model.clone());
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let tracker = Arc::new(Tracker::named("tracker"));
    let outputs: Vec<SharedConsumer> = vec![tracker.clone()];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(10))).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert!(report.elapsed < Duration::from_secs(1));
    assert_eq!(model.tool_results().len(), 1);
    assert_eq!(tracker.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_active_session_per_bridge() {
    let bridge = bridge(LoopbackModel::default());
    let mut first = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let mut second = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();

    let (a, b) = tokio::join!(
        bridge.run(&mut first, &[], Some(Duration::from_millis(200))),
        bridge.run(&mut second, &[], Some(Duration::from_millis(200))),
    );

    assert_eq!(a.unwrap().outcome, RunOutcome::TimedOut);
    assert!(matches!(b, Err(BidiError::SessionActive)));

    // the guard is released once the first run ends
    let again = bridge.run(&mut second, &[], Some(Duration::from_millis(100))).await.unwrap();
    assert_eq!(again.outcome, RunOutcome::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_stops_everyone() {
    let bridge = bridge(LoopbackModel::default());
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let first = Arc::new(Tracker::named("first"));
    let broken = Arc::new(Tracker { fail_start: true, ..Tracker::named("broken") });
    let never = Arc::new(Tracker::named("never"));
    let outputs: Vec<SharedConsumer> = vec![first.clone(), broken.clone(), never.clone()];

    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(1))).await.unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::StartFailed { ref participant, .. } if participant == "broken"
    ));
    assert_eq!(report.frames_sent, 0);
    assert_eq!(report.events_received, 0);
    assert_eq!(never.starts.load(Ordering::SeqCst), 0);
    for tracker in [&first, &broken, &never] {
        assert_eq!(tracker.stops.load(Ordering::SeqCst), 1, "{}", tracker.name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_an_outcome() {
    let bridge = SessionBridge::builder().model(Arc::new(UnreachableModel)).build().unwrap();
    let mut source = PcmFrameSource::new(speech(5), FrameConfig::default()).unwrap();
    let tracker = Arc::new(Tracker::named("tracker"));
    let outputs: Vec<SharedConsumer> = vec![tracker.clone()];

    let report = bridge.run(&mut source, &outputs, None).await.unwrap();

    assert!(matches!(
        report.outcome,
        RunOutcome::BackendFailed { ref reason } if reason.contains("refused")
    ));
    assert_eq!(report.final_state, SessionState::Closed);
    assert_eq!(tracker.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_audio_until_disconnect() {
    let bridge = bridge(LoopbackModel::default());
    let (transport, inbound) = MockTransport::new(false);
    let encode = |pcm: Vec<u8>| base64::engine::general_purpose::STANDARD.encode(pcm);
    for _ in 0..5 {
        inbound.send(json!({"type": "audio", "audio": encode(speech(1))})).unwrap();
    }
    inbound.send(json!({"type": "ping"})).unwrap();
    inbound.send(json!({"type": "audio", "audio": "not base64!"})).unwrap();
    inbound.send(json!("garbage")).unwrap();
    for _ in 0..25 {
        inbound.send(json!({"type": "audio", "audio": encode(vec![0u8; 640])})).unwrap();
    }
    drop(inbound);

    let mut source = TransportFrameSource::new(transport.clone(), AudioFormat::default());
    let outputs: Vec<SharedConsumer> = vec![Arc::new(TransportSink::new(transport.clone()))];
    let report = bridge.run(&mut source, &outputs, Some(Duration::from_secs(5))).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::InputEnded { .. }));
    assert_eq!(report.frames_sent, 30);
    assert!(transport.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn test_text_only_session_sends_no_audio() {
    let model = LoopbackModel::default();
    let session = model.connect(SessionConfig::default().with_text_only(true)).await.unwrap();
    session.send_text("今何時？").await.unwrap();
    session.close().await.unwrap();

    let mut tags = Vec::new();
    while let Some(event) = session.next_event().await {
        tags.push(adk_bidi::classify(&event.unwrap()).category());
    }
    assert!(!tags.contains(&EventCategory::AudioChunk));
    assert!(tags.contains(&EventCategory::TranscriptFinal));
}

#[test]
fn test_frame_round_trips_through_wire_encoding() {
    let frame = AudioFrame::new(speech(1), AudioFormat::default(), 3);
    let decoded = AudioFrame::from_base64(&frame.to_base64(), AudioFormat::default(), 3).unwrap();
    assert_eq!(decoded, frame);
}
