//! JSON-over-WebSocket backend.
//!
//! The backend speaks the bidi event vocabulary directly: every inbound text
//! frame is one event mapping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::audio::AudioFrame;
use crate::config::SessionConfig;
use crate::error::{BidiError, Result};
use crate::events::{RawEvent, ToolResult};
use crate::model::BidiModel;
use crate::session::{BidiSession, BoxedSession};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

/// Connects to a backend at a fixed WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsBidiModel {
    endpoint: String,
    model_id: String,
}

impl WsBidiModel {
    /// Backend at `endpoint` (`ws://` or `wss://`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), model_id: crate::config::DEFAULT_MODEL_ID.to_string() }
    }

    /// Endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BidiModel for WsBidiModel {
    fn provider(&self) -> &str {
        "websocket"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn connect(&self, config: SessionConfig) -> Result<BoxedSession> {
        let session = WsBidiSession::connect(&self.endpoint, config).await?;
        Ok(Box::new(session))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage<'a> {
    BidiSessionStart {
        model_id: &'a str,
        region: &'a str,
        voice: &'a str,
        instruction: &'a str,
        modalities: Vec<&'static str>,
        input_sample_rate: u32,
        output_sample_rate: u32,
        tools: Vec<Value>,
    },
    BidiAudioInput {
        audio: String,
        format: String,
        sample_rate: u32,
        channels: u16,
    },
    BidiTextInput {
        text: &'a str,
    },
    BidiToolResult {
        tool_result: &'a ToolResult,
    },
}

/// One backend session over a WebSocket.
pub struct WsBidiSession {
    session_id: String,
    connected: Arc<AtomicBool>,
    sender: Arc<Mutex<WsSink>>,
    receiver: Arc<Mutex<WsSource>>,
}

impl WsBidiSession {
    /// Open the socket and send the session start message.
    pub async fn connect(endpoint: &str, config: SessionConfig) -> Result<Self> {
        let request = endpoint.into_client_request().map_err(|e| {
            BidiError::connection(format!("Failed to create client request: {}", e))
        })?;
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| BidiError::connection(format!("WebSocket connect error: {}", e)))?;

        let (sink, source) = stream.split();
        let session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            connected: Arc::new(AtomicBool::new(true)),
            sender: Arc::new(Mutex::new(sink)),
            receiver: Arc::new(Mutex::new(source)),
        };
        session.send_start(&config).await?;
        Ok(session)
    }

    async fn send_start(&self, config: &SessionConfig) -> Result<()> {
        let tools = config
            .tools
            .iter()
            .map(|t| {
                let schema = t.parameters.clone().unwrap_or_else(|| json!({"type": "object"}));
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": schema,
                })
            })
            .collect();
        let start = ClientMessage::BidiSessionStart {
            model_id: &config.model_id,
            region: &config.region,
            voice: &config.voice,
            instruction: &config.instruction,
            modalities: config.modalities(),
            input_sample_rate: config.input_format.sample_rate,
            output_sample_rate: config.output_format.sample_rate,
            tools,
        };
        tracing::info!(
            model_id = %config.model_id,
            region = %config.region,
            "Sending session start"
        );
        self.send_raw(&start).await
    }

    async fn send_raw<T: Serialize>(&self, value: &T) -> Result<()> {
        let msg = serde_json::to_string(value)
            .map_err(|e| BidiError::protocol(format!("JSON serialize error: {}", e)))?;

        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(msg.into()))
            .await
            .map_err(|e| BidiError::connection(format!("Send error: {}", e)))?;
        Ok(())
    }

    fn disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BidiSession for WsBidiSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, frame: &AudioFrame) -> Result<()> {
        self.send_raw(&ClientMessage::BidiAudioInput {
            audio: frame.to_base64(),
            format: frame.format.encoding.to_string(),
            sample_rate: frame.format.sample_rate,
            channels: frame.format.channels,
        })
        .await
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_raw(&ClientMessage::BidiTextInput { text }).await
    }

    async fn send_tool_result(&self, result: ToolResult) -> Result<()> {
        self.send_raw(&ClientMessage::BidiToolResult { tool_result: &result }).await
    }

    async fn next_event(&self) -> Option<Result<RawEvent>> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(RawEvent::parse(&text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => RawEvent::parse(&text),
                        Err(e) => Err(BidiError::protocol(format!(
                            "Invalid UTF-8 in binary message: {}",
                            e
                        ))),
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.disconnected();
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.disconnected();
                    return Some(Err(BidiError::connection(format!("Receive error: {}", e))));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sender = self.sender.lock().await;
        sender
            .close()
            .await
            .map_err(|e| BidiError::connection(format!("Close error: {}", e)))?;
        Ok(())
    }
}
