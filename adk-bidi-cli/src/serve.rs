//! WebSocket server bridging browser clients to the agent backend.

use std::sync::Arc;

use adk_bidi::tools::default_tools;
use adk_bidi::{
    BidiError, BoxedModel, LoggingSink, OutboundMessage, SessionBridge, SessionConfig,
    SharedConsumer, Transport, TransportFrameSource, TransportSink,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::Mutex;

#[derive(Clone)]
struct AppState {
    model: BoxedModel,
    config: SessionConfig,
}

/// [`Transport`] over an axum WebSocket.
pub struct WebSocketTransport {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    receiver: Mutex<SplitStream<WebSocket>>,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sender, receiver) = socket.split();
        Self { sender: Mutex::new(sender), receiver: Mutex::new(receiver) }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: &OutboundMessage) -> adk_bidi::Result<()> {
        let json = serde_json::to_string(message)?;
        self.sender
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BidiError::transport(format!("WebSocket send error: {}", e)))
    }

    async fn recv(&self) -> Option<adk_bidi::Result<Value>> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(value) => return Some(Ok(value)),
                    Err(e) => tracing::debug!(error = %e, "ignoring non-JSON client message"),
                },
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let message = format!("WebSocket receive error: {}", e);
                    return Some(Err(BidiError::transport(message)));
                }
            }
        }
    }

    async fn close(&self) -> adk_bidi::Result<()> {
        self.sender
            .lock()
            .await
            .close()
            .await
            .map_err(|e| BidiError::transport(format!("WebSocket close error: {}", e)))
    }
}

/// Routes: `GET /ws` upgrades to a bridge session, `GET /ping` is a health
/// check.
pub fn router(model: BoxedModel, config: SessionConfig) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ping", get(ping))
        .with_state(Arc::new(AppState { model, config }))
}

async fn ping() -> Json<Value> {
    Json(json!({"status": "Healthy"}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection, one bridge, one backend session.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let bridge = match SessionBridge::builder()
        .model(state.model.clone())
        .config(state.config.clone())
        .tools(default_tools())
        .build()
    {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!(error = %e, "failed to build session bridge");
            return;
        }
    };

    let transport = Arc::new(WebSocketTransport::new(socket));
    let mut source = TransportFrameSource::new(transport.clone(), state.config.input_format);
    let outputs: Vec<SharedConsumer> =
        vec![Arc::new(TransportSink::new(transport)), Arc::new(LoggingSink::new())];

    tracing::info!("client connected");
    match bridge.run(&mut source, &outputs, None).await {
        Ok(report) => tracing::info!(
            session_id = %report.session_id,
            outcome = %report.outcome,
            frames_sent = report.frames_sent,
            "client session finished"
        ),
        Err(e) => tracing::warn!(error = %e, "client session failed"),
    }
}

pub async fn run_serve(
    model: BoxedModel,
    config: SessionConfig,
    host: &str,
    port: u16,
) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener =
        tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {}", addr))?;

    println!("Voice bridge listening on ws://{}/ws", addr);
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router(model, config)).await?;
    Ok(())
}
