//! axum HTTP server with a WebSocket endpoint per repository conversation.

use std::sync::Arc;

use agent::{CommandReceipt, Delivery};
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade, ws},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use proto::{
    ApprovalDecision, ApprovalSignal, Checkpoint, ConversationError, GatewayError, LoopState,
    Message, StreamEvent, TurnInput,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tools::RepoScope;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::session::{ConversationFactory, DEFAULT_SESSION, SessionLease, SessionManager};

// ─── WsMessage envelope ────────────────────────────────────

/// WebSocket message envelope for client-server communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    /// Client sends a chat message (`clear` resets the conversation).
    Message { text: String },
    /// Client resets the conversation.
    Clear,
    /// Client decides on a tool call awaiting approval.
    #[serde(rename_all = "camelCase")]
    Approval {
        tool_call_id: String,
        decision: ApprovalDecision,
    },
    /// Heartbeat ping from client.
    Ping,
    /// Server sends the conversation as of `seq`, sent once on connect.
    Snapshot {
        seq: u64,
        state: LoopState,
        messages: Vec<Message>,
    },
    /// Server forwards one stream event.
    Event { seq: u64, event: StreamEvent },
    /// Heartbeat pong from server.
    Pong,
    /// Server reports a request it could not handle.
    Error { message: String },
}

// ─── Query parameters ──────────────────────────────────────

/// Query parameters for WebSocket upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub owner: Option<String>,
    pub repo: Option<String>,
    /// Session name; clients sharing it share the conversation.
    pub session: Option<String>,
    /// Authentication token (passed as `?token=xxx`).
    pub token: Option<String>,
}

impl WsConnectParams {
    fn scope(&self) -> Option<RepoScope> {
        let owner = self.owner.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let repo = self.repo.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some(RepoScope::new(owner, repo))
    }
}

// ─── Shared state ──────────────────────────────────────────

struct WebState {
    /// Expected authentication token.
    auth_token: String,
    sessions: Arc<SessionManager>,
}

// ─── WebServer ─────────────────────────────────────────────

/// Runs the axum HTTP server with WebSocket support.
pub struct WebServer {
    port: u16,
    auth_token: String,
    cors_origins: String,
    sessions: Arc<SessionManager>,
}

impl WebServer {
    pub fn new(
        port: u16,
        auth_token: String,
        cors_origins: String,
        factory: Arc<dyn ConversationFactory>,
    ) -> Self {
        Self {
            port,
            auth_token,
            cors_origins,
            sessions: Arc::new(SessionManager::new(factory)),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Builds the CORS layer from the configured origins string.
    fn build_cors(&self) -> CorsLayer {
        if self.cors_origins == "*" {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            // Parse comma-separated origins
            let origins: Vec<_> = self
                .cors_origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }

    /// The application router: `/health` and `/ws`.
    pub fn router(&self) -> Router {
        let state = Arc::new(WebState {
            auth_token: self.auth_token.clone(),
            sessions: Arc::clone(&self.sessions),
        });
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(self.build_cors())
    }

    /// Serves until Ctrl-C.
    pub async fn run(self) -> Result<(), GatewayError> {
        info!(port = self.port, "Web gateway starting");
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .map_err(|e| GatewayError::Connection(format!("bind failed: {e}")))?;

        info!(port = self.port, "Web gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|e| GatewayError::Connection(format!("server error: {e}")))?;

        info!("Web gateway stopped");
        Ok(())
    }
}

// ─── Axum handlers ─────────────────────────────────────────

/// Health check endpoint.
async fn health_handler() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
    State(state): State<Arc<WebState>>,
) -> Response {
    // Validate token from query parameter
    let token_valid = params
        .token
        .as_deref()
        .is_some_and(|t| validate_token(t, &state.auth_token));

    if !token_valid && !state.auth_token.is_empty() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(scope) = params.scope() else {
        let err = GatewayError::BadRequest("owner and repo are required".to_string());
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    };
    let session = params
        .session
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());

    let lease = state.sessions.connect(scope, &session);
    ws.on_upgrade(move |socket| handle_ws(socket, lease))
}

type WsSink = SplitSink<ws::WebSocket, ws::Message>;

async fn send_ws(ws_tx: &mut WsSink, msg: &WsMessage) -> bool {
    let Ok(json) = serde_json::to_string(msg) else {
        return true;
    };
    ws_tx.send(ws::Message::Text(json.into())).await.is_ok()
}

/// Reports a command's failure to the client that sent it.
fn forward_failure(receipt: CommandReceipt, replies: mpsc::Sender<WsMessage>, session: String) {
    tokio::spawn(async move {
        match receipt.outcome().await {
            // Model failures already went out as `error` events.
            Ok(_) | Err(ConversationError::Llm(_)) => {}
            Err(e) => {
                debug!(session = %session, error = %e, "Command rejected");
                let _ = replies
                    .send(WsMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    });
}

/// Manages a single WebSocket connection lifecycle.
async fn handle_ws(socket: ws::WebSocket, lease: SessionLease) {
    let key = lease.key().to_string();
    let handle = lease.handle().clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (checkpoint, mut events) = handle.attach();

    info!(session = %key, seq = checkpoint.seq, "WebSocket client connected");

    if !send_ws(&mut ws_tx, &snapshot(checkpoint)).await {
        return;
    }

    // Replies produced by the read task (pong, errors).
    let (reply_tx, mut reply_rx) = mpsc::channel::<WsMessage>(16);
    let key_read = key.clone();

    // Read task: client -> conversation
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let ws::Message::Text(text) = msg else {
                continue;
            };
            let ws_msg = match serde_json::from_str::<WsMessage>(&text) {
                Ok(m) => m,
                Err(e) => {
                    warn!(session = %key_read, error = %e, "Invalid WS message");
                    let _ = reply_tx
                        .send(WsMessage::Error {
                            message: format!("invalid message: {e}"),
                        })
                        .await;
                    continue;
                }
            };
            let sent = match ws_msg {
                WsMessage::Message { text } => handle.submit(TurnInput::from_text(text)).await,
                WsMessage::Clear => handle.submit(TurnInput::Clear).await,
                WsMessage::Approval {
                    tool_call_id,
                    decision,
                } => {
                    handle
                        .decide(ApprovalSignal::new(tool_call_id, decision))
                        .await
                }
                WsMessage::Ping => {
                    debug!(session = %key_read, "Ping received");
                    let _ = reply_tx.send(WsMessage::Pong).await;
                    continue;
                }
                _ => {
                    debug!(session = %key_read, "Ignoring server-bound WS message");
                    continue;
                }
            };
            match sent {
                Ok(receipt) => forward_failure(receipt, reply_tx.clone(), key_read.clone()),
                Err(e) => {
                    warn!(session = %key_read, error = %e, "Conversation unavailable");
                    let _ = reply_tx
                        .send(WsMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    });

    // Write task: conversation events and replies -> client
    let key_write = key.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                delivery = events.recv() => match delivery {
                    Some(Delivery::Event(e)) => WsMessage::Event { seq: e.seq, event: e.event },
                    Some(Delivery::Resync(checkpoint)) => {
                        warn!(session = %key_write, seq = checkpoint.seq, "Client fell behind, resending snapshot");
                        snapshot(checkpoint)
                    }
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(r) => r,
                    None => break,
                },
            };
            if !send_ws(&mut ws_tx, &msg).await {
                break;
            }
        }
    });

    // Whichever side ends first takes the other down.
    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    info!(session = %key, "WebSocket client disconnected");
    drop(lease);
}

fn snapshot(checkpoint: Checkpoint) -> WsMessage {
    WsMessage::Snapshot {
        seq: checkpoint.seq,
        state: checkpoint.state,
        messages: checkpoint.messages,
    }
}

// ─── Helpers ───────────────────────────────────────────────

/// Token comparison for authentication.
fn validate_token(given: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return true; // no auth required
    }
    given == expected
}

// ─── Tests ─────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_message_client_messages_parse() {
        let msg: WsMessage =
            serde_json::from_str(r#"{"type":"message","text":"hello"}"#).expect("message");
        assert!(matches!(msg, WsMessage::Message { text } if text == "hello"));

        let msg: WsMessage = serde_json::from_str(r#"{"type":"clear"}"#).expect("clear");
        assert!(matches!(msg, WsMessage::Clear));

        let msg: WsMessage = serde_json::from_str(
            r#"{"type":"approval","toolCallId":"call_1","decision":"Yes, confirmed."}"#,
        )
        .expect("approval");
        assert!(matches!(
            msg,
            WsMessage::Approval { tool_call_id, decision: ApprovalDecision::Yes } if tool_call_id == "call_1"
        ));
    }

    #[test]
    fn ws_message_event_nests_stream_event() {
        let msg = WsMessage::Event {
            seq: 7,
            event: StreamEvent::TextDelta {
                delta: "hi".to_string(),
            },
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "event");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"]["type"], "text-delta");
        assert_eq!(json["event"]["delta"], "hi");
    }

    #[test]
    fn ws_message_snapshot_serializes_state() {
        let msg = WsMessage::Snapshot {
            seq: 3,
            state: LoopState::ToolsPending,
            messages: vec![Message::user("hi")],
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["state"], "tools-pending");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn ws_message_ping_pong_roundtrip() {
        let ping = serde_json::to_string(&WsMessage::Ping).expect("serialize ping");
        let parsed: WsMessage = serde_json::from_str(&ping).expect("deserialize ping");
        assert!(matches!(parsed, WsMessage::Ping));

        let pong = serde_json::to_string(&WsMessage::Pong).expect("serialize pong");
        let parsed: WsMessage = serde_json::from_str(&pong).expect("deserialize pong");
        assert!(matches!(parsed, WsMessage::Pong));
    }

    #[test]
    fn connect_params_require_owner_and_repo() {
        let params = WsConnectParams {
            owner: Some(" octo ".to_string()),
            repo: Some("hello".to_string()),
            session: None,
            token: None,
        };
        assert_eq!(params.scope(), Some(RepoScope::new("octo", "hello")));

        let missing = WsConnectParams {
            owner: Some("octo".to_string()),
            repo: Some("  ".to_string()),
            session: None,
            token: None,
        };
        assert_eq!(missing.scope(), None);
    }

    #[test]
    fn validate_token_allows_empty_expected() {
        assert!(validate_token("anything", ""));
        assert!(validate_token("", ""));
    }

    #[test]
    fn validate_token_checks_exact_match() {
        assert!(validate_token("secret", "secret"));
        assert!(!validate_token("wrong", "secret"));
        assert!(!validate_token("", "secret"));
    }
}
