//! WebSocket endpoint exposing the terminal registry and file service.
//!
//! The agent serves exactly one upstream proxy connection at a time: every
//! accepted upgrade bumps a connection epoch, and the previous connection
//! observes the change, kills its terminal registry and bows out. This makes
//! a proxy crash-reconnect safe; the stale connection's PTYs never outlive
//! it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use cubby_protocol::{AgentEvent, SessionCommand};

use crate::files::SandboxedFiles;
use crate::terminal::{default_shell, TerminalRegistry};

/// Shared agent state.
#[derive(Clone)]
pub struct AppState {
    /// Sandbox root all sessions and file operations are scoped to.
    pub root: PathBuf,
    /// Shell spawned for terminal sessions.
    pub shell: String,
    /// Monotonic connection counter; the watch carries the latest epoch.
    conn_seq: Arc<AtomicU64>,
    epoch_tx: Arc<watch::Sender<u64>>,
}

impl AppState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            root: root.into(),
            shell: default_shell(),
            conn_seq: Arc::new(AtomicU64::new(0)),
            epoch_tx: Arc::new(epoch_tx),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Total upstream connections accepted over this agent's lifetime.
    pub fn connections_seen(&self) -> u64 {
        self.conn_seq.load(Ordering::SeqCst)
    }
}

/// Build the agent router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "root": state.root.display().to_string(),
        "connections": state.connections_seen(),
    }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    // Claim the connection slot; any previous connection sees the epoch
    // change and shuts down its registry. Only ever moves forward, so a
    // slow older upgrade can never unseat a newer one.
    let my_epoch = state.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
    state.epoch_tx.send_if_modified(|current| {
        if my_epoch > *current {
            *current = my_epoch;
            true
        } else {
            false
        }
    });
    let mut epoch_rx = state.epoch_tx.subscribe();
    if *epoch_rx.borrow() != my_epoch {
        info!(epoch = my_epoch, "superseded before start");
        return;
    }
    info!(epoch = my_epoch, "proxy connected");

    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AgentEvent>();

    let registry = TerminalRegistry::new(&state.root, &state.shell, events_tx.clone());
    let files = SandboxedFiles::new(&state.root);

    loop {
        tokio::select! {
            // Outbound: registry output and file results.
            Some(event) = events_rx.recv() => {
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize agent event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            // Inbound: commands from the proxy.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SessionCommand>(&text) {
                            Ok(cmd) => dispatch(cmd, &registry, &files, &events_tx).await,
                            Err(e) => warn!(error = %e, frame = %text, "unparseable command frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket error");
                        break;
                    }
                }
            }

            // A newer connection claimed the slot.
            changed = epoch_rx.changed() => {
                if changed.is_err() || *epoch_rx.borrow() != my_epoch {
                    info!(epoch = my_epoch, "superseded by a newer proxy connection");
                    break;
                }
            }
        }
    }

    // No session outlives its connection.
    registry.shutdown().await;
    info!(epoch = my_epoch, "proxy disconnected, sessions cleared");
}

/// Route one command to the terminal registry or the file service.
async fn dispatch(
    cmd: SessionCommand,
    registry: &TerminalRegistry,
    files: &SandboxedFiles,
    events: &mpsc::UnboundedSender<AgentEvent>,
) {
    match cmd {
        SessionCommand::TerminalCreate { session_id } => registry.create(&session_id).await,
        SessionCommand::TerminalInput { session_id, data } => {
            registry.write(&session_id, &data).await
        }
        SessionCommand::TerminalResize {
            session_id,
            cols,
            rows,
        } => registry.resize(&session_id, cols, rows).await,
        SessionCommand::TerminalKill { session_id } => registry.kill(&session_id).await,

        SessionCommand::FsList { dir } => {
            debug!(dir = %dir, "fs:list");
            let event = match files.list(&dir).await {
                Ok(entries) => AgentEvent::FsListResult { entries },
                Err(e) => AgentEvent::FsError {
                    message: e.to_string(),
                },
            };
            let _ = events.send(event);
        }
        SessionCommand::FsRead { path } => {
            let event = match files.read(&path).await {
                Ok(content) => AgentEvent::FsReadResult { content, path },
                Err(e) => AgentEvent::FsError {
                    message: e.to_string(),
                },
            };
            let _ = events.send(event);
        }
        SessionCommand::FsWrite { path, content } => {
            let event = match files.write(&path, &content).await {
                Ok(()) => AgentEvent::FsWriteSuccess { path },
                Err(e) => AgentEvent::FsError {
                    message: e.to_string(),
                },
            };
            let _ = events.send(event);
        }
    }
}
