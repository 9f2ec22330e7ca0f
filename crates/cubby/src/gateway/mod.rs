//! Session proxy gateway.
//!
//! Authenticates client WebSocket connections, resolves workspace containers
//! through the lifecycle manager, and relays terminal and filesystem traffic
//! between clients and the per-workspace agent links.
//!
//! Per-connection state machine:
//! connecting -> authenticated -> workspace-requested -> agent-linked -> relaying -> closed

mod hub;
mod link;

pub use hub::{ClientSender, Hub};
pub use link::{AgentLink, AgentLinkCache, LinkState};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use tokio::task::JoinHandle;

use cubby_protocol::{
    AgentEvent, ClientCommand, ControlCommand, ControlEvent, GatewayEvent, SessionCommand,
};

use crate::auth::AuthVerifier;
use crate::broker::{MessageBroker, TOPIC_MESSAGES, TOPIC_PRESENCE};
use crate::lifecycle::LifecycleManager;

/// Keepalive interval for client connections.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared gateway state, constructed once at startup.
pub struct GatewayState {
    pub lifecycle: Arc<LifecycleManager>,
    pub links: AgentLinkCache,
    pub hub: Hub,
    pub broker: Arc<dyn MessageBroker>,
    pub auth: AuthVerifier,
    pub join_timeout: Duration,
}

impl GatewayState {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        broker: Arc<dyn MessageBroker>,
        auth: AuthVerifier,
        join_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            links: AgentLinkCache::new(),
            hub: Hub::new(),
            broker,
            auth,
            join_timeout,
        })
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
        "links": state.links.len(),
    }))
}

/// WebSocket upgrade: authenticate before accepting the socket.
async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match state.auth.authenticate(&headers) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("rejected websocket upgrade: {e}");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    ws.protocols(["cubby"])
        .on_upgrade(move |socket| handle_connection(socket, state, user_id))
}

/// Drops its forwarding task with it, so replacing the handle structurally
/// guarantees a connection never has two live relay registrations.
struct RelayHandle {
    workspace_id: String,
    task: JoinHandle<()>,
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (mut events_rx, tx, conn_id, came_online) = state.hub.register(&user_id);

    if let Err(e) = sender
        .send(control_frame(&ControlEvent::Connected))
        .await
    {
        warn!("failed to greet user {user_id}: {e}");
        state.hub.unregister(&user_id, conn_id);
        return;
    }

    if came_online {
        publish_presence(&state, &user_id, true).await;
    }

    // The relay subscription for the currently joined workspace, if any.
    let mut relay: Option<RelayHandle> = None;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            // Outbound: control events, relayed agent events, broadcasts.
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("failed to serialize event for user {user_id}: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            // Inbound: commands from the client.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(cmd) => {
                                handle_command(&state, &user_id, &tx, &mut relay, cmd).await;
                            }
                            Err(e) => {
                                warn!("unparseable frame from user {user_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket error for user {user_id}: {e}");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if sender.send(control_frame(&ControlEvent::Ping)).await.is_err() {
                    break;
                }
            }
        }
    }

    // Releasing the relay handle detaches this client from the workspace;
    // the container and its sessions stay up for other clients.
    drop(relay);
    let went_offline = state.hub.unregister(&user_id, conn_id);
    if went_offline {
        publish_presence(&state, &user_id, false).await;
    }
    info!("connection closed for user {user_id}");
}

async fn handle_command(
    state: &Arc<GatewayState>,
    user_id: &str,
    tx: &ClientSender,
    relay: &mut Option<RelayHandle>,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::Control(ControlCommand::WorkspaceJoin { workspace_id }) => {
            handle_join(state, user_id, tx, relay, workspace_id).await;
        }

        ClientCommand::Control(ControlCommand::Publish { payload }) => {
            if let Err(e) = state.broker.publish(TOPIC_MESSAGES, payload).await {
                warn!("failed to publish message from user {user_id}: {e}");
            }
        }

        ClientCommand::Control(ControlCommand::Pong) => {}

        ClientCommand::Session(cmd) => {
            let Some(handle) = relay.as_ref() else {
                debug!("session command from user {user_id} before workspace:join");
                send_event(
                    tx,
                    ControlEvent::WorkspaceError {
                        message: "no workspace joined".to_string(),
                    }
                    .into(),
                )
                .await;
                return;
            };
            forward_command(state, &handle.workspace_id, cmd).await;
        }
    }
}

/// Resolve the workspace container and attach this connection to its agent.
async fn handle_join(
    state: &Arc<GatewayState>,
    user_id: &str,
    tx: &ClientSender,
    relay: &mut Option<RelayHandle>,
    workspace_id: String,
) {
    info!("user {user_id} joining workspace {workspace_id}");

    // Unsubscribe-then-subscribe: the old relay task dies before any new
    // wiring exists, so a re-join can never double-deliver.
    *relay = None;

    match attach_workspace(state, &workspace_id).await {
        Ok(link) => {
            let mut events = link.subscribe();
            let relay_tx = tx.clone();
            let task = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            if relay_tx.send(GatewayEvent::Session(event)).await.is_err() {
                                break;
                            }
                        }
                        // Fell behind; skip to the live edge rather than die.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("relay lagged by {n} agent events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            *relay = Some(RelayHandle {
                workspace_id: workspace_id.clone(),
                task,
            });
            send_event(tx, ControlEvent::WorkspaceReady { workspace_id }.into()).await;
        }
        Err(e) => {
            warn!("join failed for user {user_id} on workspace {workspace_id}: {e:#}");
            send_event(
                tx,
                ControlEvent::WorkspaceError {
                    message: format!("{e:#}"),
                }
                .into(),
            )
            .await;
        }
    }
}

/// Container resolution + agent link attach, shared by every join.
///
/// Both phases are individually bounded by the join timeout, so no client
/// ever hangs on a join: the attempt ends in a link or an error.
async fn attach_workspace(
    state: &Arc<GatewayState>,
    workspace_id: &str,
) -> anyhow::Result<Arc<AgentLink>> {
    let endpoint = tokio::time::timeout(state.join_timeout, async {
        state
            .lifecycle
            .create_container(workspace_id)
            .await
            .context("creating workspace container")?;

        let info = state
            .lifecycle
            .container_info(workspace_id)
            .await
            .context("inspecting workspace container")?
            .ok_or_else(|| anyhow!("container missing after create"))?;

        state
            .lifecycle
            .agent_endpoint(&info)
            .ok_or_else(|| anyhow!("could not resolve an agent endpoint"))
    })
    .await
    .map_err(|_| anyhow!("timed out resolving workspace {workspace_id}"))??;

    let link = state.links.get_or_connect(workspace_id, &endpoint);
    if !link.wait_connected(state.join_timeout).await {
        return Err(anyhow!("agent at {endpoint} is unreachable"));
    }
    Ok(link)
}

/// Forward a session command to the joined workspace's cached link.
async fn forward_command(state: &Arc<GatewayState>, workspace_id: &str, cmd: SessionCommand) {
    match state.links.get(workspace_id) {
        Some(link) => link.send(cmd).await,
        None => warn!("no agent link for workspace {workspace_id}, dropping command"),
    }
}

async fn send_event(tx: &ClientSender, event: GatewayEvent) {
    if tx.send(event).await.is_err() {
        debug!("event dropped: connection channel closed");
    }
}

fn control_frame(event: &ControlEvent) -> Message {
    // Control events contain no non-serializable values.
    Message::Text(serde_json::to_string(event).unwrap_or_default().into())
}

/// Publish a presence transition and echo it to everyone on this instance.
async fn publish_presence(state: &Arc<GatewayState>, user_id: &str, is_online: bool) {
    let payload = json!({
        "userId": user_id,
        "isOnline": is_online,
        "lastOnlineAt": Utc::now().to_rfc3339(),
    });
    if let Err(e) = state.broker.publish(TOPIC_PRESENCE, payload).await {
        warn!("failed to publish presence for user {user_id}: {e}");
    }
}

/// Background task relaying broker traffic to this instance's clients.
///
/// Presence updates go to everyone; messages go to the users named in the
/// payload's `recipients` array, or to everyone when it is absent.
pub fn spawn_broker_relay(state: Arc<GatewayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut presence = state.broker.subscribe(TOPIC_PRESENCE);
        let mut messages = state.broker.subscribe(TOPIC_MESSAGES);

        loop {
            tokio::select! {
                msg = presence.recv() => {
                    let Ok(payload) = msg else { continue };
                    let event = ControlEvent::PresenceUpdate {
                        user_id: payload["userId"].as_str().unwrap_or_default().to_string(),
                        is_online: payload["isOnline"].as_bool().unwrap_or(false),
                        last_online_at: payload["lastOnlineAt"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    };
                    state.hub.broadcast(event.into()).await;
                }
                msg = messages.recv() => {
                    let Ok(payload) = msg else { continue };
                    let recipients: Option<Vec<String>> = payload["recipients"]
                        .as_array()
                        .map(|ids| {
                            ids.iter()
                                .filter_map(|v| v.as_str().map(String::from))
                                .collect()
                        });
                    let event: GatewayEvent = ControlEvent::Broadcast { payload }.into();
                    match recipients {
                        Some(ids) => {
                            for user_id in ids {
                                state.hub.send_to_user(&user_id, event.clone()).await;
                            }
                        }
                        None => state.hub.broadcast(event).await,
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_serialize() {
        let Message::Text(text) = control_frame(&ControlEvent::Ping) else {
            panic!("expected text frame");
        };
        assert_eq!(text.as_str(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn relayed_agent_event_matches_wire_format() {
        // What the relay sends to a client is exactly the agent's frame.
        let frame = r#"{"type":"terminal:data","sessionId":"t1","data":"hi"}"#;
        let event: AgentEvent = serde_json::from_str(frame).unwrap();
        let out = serde_json::to_string(&GatewayEvent::Session(event)).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&out).unwrap(),
            serde_json::from_str::<serde_json::Value>(frame).unwrap()
        );
    }
}
