//! WebSocket gateway for Murmur.
//!
//! One WebSocket connection per client at `/v1/ws/{user_id}`. The client
//! authenticates, sends structured events (wake word, requests, module
//! payloads, clear), and receives the orchestrator's notifications as JSON
//! frames. A small embedded chat page at `/chat` exercises the protocol
//! from a browser.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    response::{Html, IntoResponse},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use murmur_core::error::TransportError;
use murmur_core::message::Message;
use murmur_core::module::ModuleTuning;
use murmur_core::settings::SettingsStore;
use murmur_core::transport::{InboundEvent, OutboundEvent, Transport};
use murmur_session::{SessionDeps, SessionRegistry};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub sessions: Arc<SessionRegistry>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/ws/{user_id}", get(ws_handler))
        .route("/chat", get(chat_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway server.
pub async fn start(config: murmur_config::AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let client = murmur_providers::build_from_config(&config);
    let sessions = SessionRegistry::new(SessionDeps {
        settings: SettingsStore::new(&config.storage.settings_dir),
        client,
        session_cache_dir: config.storage.session_cache_dir.clone(),
        system_prompt_override: config.identity.system_prompt_override.clone(),
        tuning: ModuleTuning {
            activation_timeout_ms: config.activation.timeout_ms,
            activation_settle_ms: config.activation.settle_ms,
            token_refresh_margin_secs: config.activation.token_refresh_margin_secs,
        },
    });
    let state = Arc::new(GatewayState { sessions });

    let app = build_router(state);
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn chat_handler() -> Html<&'static str> {
    Html(include_str!("chat.html"))
}

async fn ws_handler(
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

/// Outbound half of one WebSocket connection.
///
/// Events are pushed through a channel to a single writer task, so the
/// session and its modules can hold the transport without contending for
/// the socket sink.
struct WsTransport {
    tx: mpsc::Sender<OutboundEvent>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, event: OutboundEvent) -> Result<(), TransportError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| TransportError::Closed("client connection closed".into()))
    }
}

async fn handle_socket(socket: WebSocket, user_id: String, state: SharedState) {
    info!(user = %user_id, "WebSocket connected");
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<OutboundEvent>(64);
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = event.to_json().to_string();
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });
    let transport: Arc<dyn Transport> = Arc::new(WsTransport { tx });

    while let Some(incoming) = stream.next().await {
        let text = match incoming {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue, // ignore binary, ping, pong
            Err(e) => {
                warn!(user = %user_id, error = %e, "WebSocket receive error");
                break;
            }
        };

        let event: InboundEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Ignoring malformed client event");
                continue;
            }
        };

        match event {
            InboundEvent::Auth => {
                state.sessions.authenticate(&user_id, transport.clone()).await;
                let _ = transport.send(OutboundEvent::Authenticated).await;
            }
            InboundEvent::WakeWordDetected => {
                if let Some(session) = state.sessions.get(&user_id).await {
                    session.wake_word_detected().await;
                }
            }
            InboundEvent::Request { message } => {
                if message.is_empty() {
                    continue;
                }
                let Some(session) = state.sessions.get(&user_id).await else {
                    continue;
                };
                // Runs are driven off-loop so the connection keeps
                // receiving events while the model thinks.
                tokio::spawn(async move {
                    if let Err(e) = session.run(vec![Message::user(message)]).await {
                        error!(error = %e, "Run failed");
                    }
                });
            }
            InboundEvent::ToolClientMessage { tool, data } => {
                if let Some(session) = state.sessions.get(&user_id).await {
                    session.handle_transport_message(&tool, data).await;
                }
            }
            InboundEvent::Clear => {
                state.sessions.remove(&user_id).await;
                let _ = transport.send(OutboundEvent::SessionCleared).await;
            }
        }
    }

    // Disconnect tears the session down with best-effort persistence.
    if state.sessions.remove(&user_id).await {
        info!(user = %user_id, "Session closed on disconnect");
    }
    writer.abort();
}
