//! HTTP/websocket transport (§4.7, §6.3), wired the way the teacher wires
//! its own dev server.
//!
//! Grounded directly on `engine/runner/http.rs`: a background OS thread
//! running a `tokio::runtime::Builder::new_current_thread` runtime, inside
//! which an axum `Router` is served. We generalize the single `ServeDir`
//! fallback into two handwritten routes: the websocket upgrade (`/`) and a
//! plain GET for the compiled artifact/proxy stub the patch-runtime's
//! `<script>` tag loads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::Sender as StdSender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::session::{self, ConnectParams};

/// What the supervisor needs to know per accepted websocket connection.
/// `session_id` is handed back so the supervisor can register it in its
/// `SessionTable` and address later `ServerMessage`s to it.
pub enum ServerEvent {
    Connected {
        session_id: u64,
        params: ConnectParams,
        outbox: tokio::sync::mpsc::UnboundedSender<session::ServerMessage>,
    },
    ClientMessage {
        session_id: u64,
        message: session::ClientMessage,
    },
    Disconnected {
        session_id: u64,
    },
    HandshakeRejected {
        error: crate::error::SessionError,
    },
}

/// Artifact bytes by target name, mirrored from the supervisor's own
/// `artifacts` map after every successful delivery (§4.7) so this thread can
/// serve the first-load GET without reaching into the supervisor's state.
pub type ArtifactSnapshot = Arc<Mutex<HashMap<String, Vec<u8>>>>;

#[derive(Clone)]
struct AppState {
    to_supervisor: StdSender<ServerEvent>,
    next_session_id: std::sync::Arc<std::sync::atomic::AtomicU64>,
    artifacts: ArtifactSnapshot,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "targetName")]
    target_name: Option<String>,
    #[serde(rename = "compiledAt")]
    compiled_at: Option<String>,
    #[serde(rename = "toolVersion")]
    tool_version: Option<String>,
}

/// Spawns the background thread the teacher's `http::start` spawns, here
/// driving both the websocket upgrade route and a static artifact route
/// instead of a single `ServeDir` fallback. The returned [`ArtifactSnapshot`]
/// is the caller's handle for keeping `/artifact/{target}` in sync with
/// whatever the supervisor last delivered.
pub fn start(
    port: u16,
    to_supervisor: StdSender<ServerEvent>,
) -> (JoinHandle<anyhow::Result<()>>, ArtifactSnapshot) {
    let artifacts: ArtifactSnapshot = Arc::new(Mutex::new(HashMap::new()));
    let handle = {
        let artifacts = artifacts.clone();
        thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(serve(port, to_supervisor, artifacts))
        })
    };
    (handle, artifacts)
}

async fn serve(
    port: u16,
    to_supervisor: StdSender<ServerEvent>,
    artifacts: ArtifactSnapshot,
) -> anyhow::Result<()> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(address).await?;

    let state = AppState {
        to_supervisor,
        next_session_id: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(1)),
        artifacts,
    };

    let router = Router::new()
        .route("/", get(connect_handler))
        .route("/artifact/{target}", get(artifact_handler))
        .with_state(state);

    tracing::info!(port, "serving websocket/http");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn connect_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let params = ConnectParams::decode(query.target_name, query.compiled_at, query.tool_version);

    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    params: Result<ConnectParams, crate::error::SessionError>,
) {
    let params = match params {
        Ok(params) => params,
        Err(error) => {
            let _ = state
                .to_supervisor
                .send(ServerEvent::HandshakeRejected { error });
            let _ = socket.close().await;
            return;
        }
    };

    let session_id = state
        .next_session_id
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel();

    let _ = state.to_supervisor.send(ServerEvent::Connected {
        session_id,
        params,
        outbox: outbox_tx,
    });

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        let Ok(json) = serde_json::to_string(&message) else { continue };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match session::parse_client_message(&text) {
                            Ok(message) => {
                                let _ = state.to_supervisor.send(ServerEvent::ClientMessage {
                                    session_id,
                                    message,
                                });
                            }
                            Err(_) => continue,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = state
        .to_supervisor
        .send(ServerEvent::Disconnected { session_id });
}

/// Serves the most recently delivered artifact bytes for `target` (the
/// patch-runtime's `<script src="/artifact/NAME">` tag). The websocket
/// channel is this system's actual update path (§4.7) — this route only
/// needs to answer the very first load, before any session exists.
async fn artifact_handler(
    State(state): State<AppState>,
    axum::extract::Path(target): axum::extract::Path<String>,
) -> impl IntoResponse {
    let bytes = state
        .artifacts
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&target)
        .cloned();

    match bytes {
        Some(bytes) => (axum::http::StatusCode::OK, bytes).into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}
