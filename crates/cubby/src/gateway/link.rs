//! Cached upstream connections to workspace agents.
//!
//! The gateway holds at most one [`AgentLink`] per workspace regardless of
//! how many clients joined it. A link owns the upstream WebSocket and keeps
//! it alive: when the socket drops, the link reconnects in place with
//! backoff rather than being replaced, so clients never race each other into
//! duplicate upstream connections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use cubby_protocol::{AgentEvent, SessionCommand};

/// Outbound command queue depth per link.
const COMMAND_BUFFER_SIZE: usize = 256;

/// Inbound event fan-out depth per link.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Initial reconnect delay; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Connection state of an agent link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// One logical upstream connection to a workspace's agent.
pub struct AgentLink {
    workspace_id: String,
    endpoint: String,
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<AgentEvent>,
    state: watch::Receiver<LinkState>,
}

impl AgentLink {
    /// Open a link to `endpoint` and keep it connected in the background.
    pub fn connect(workspace_id: &str, endpoint: &str) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        let link = Arc::new(Self {
            workspace_id: workspace_id.to_string(),
            endpoint: endpoint.to_string(),
            commands: cmd_tx,
            events: event_tx.clone(),
            state: state_rx,
        });

        tokio::spawn(run_link(
            link.workspace_id.clone(),
            link.endpoint.clone(),
            cmd_rx,
            event_tx,
            state_tx,
        ));

        link
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Subscribe to the inbound event fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Forward a command upstream. Commands sent while the link is down are
    /// dropped with a warning; terminal input is not worth replaying against
    /// a shell that lost its PTYs anyway.
    pub async fn send(&self, command: SessionCommand) {
        if self.state() != LinkState::Connected {
            warn!(
                "dropping command for workspace {} (link {})",
                self.workspace_id,
                self.state()
            );
            return;
        }
        if self.commands.send(command).await.is_err() {
            warn!(
                "dropping command for workspace {}: link task gone",
                self.workspace_id
            );
        }
    }

    /// Wait until the link reports connected, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *state.borrow() == LinkState::Connected {
                    return true;
                }
                if state.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

/// Connection loop: connect, relay, reconnect with backoff. Ends when every
/// handle to the link is gone.
async fn run_link(
    workspace_id: String,
    endpoint: String,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<AgentEvent>,
    state: watch::Sender<LinkState>,
) {
    let url = format!("ws://{endpoint}/ws");
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            state.send_replace(LinkState::Reconnecting);
            debug!(
                "reconnecting agent link for workspace {workspace_id} (attempt {attempt}, {}ms)",
                backoff.as_millis()
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        attempt += 1;

        let socket = match connect_async(&url).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!("agent link for workspace {workspace_id} failed to connect: {e}");
                if commands.is_closed() {
                    break;
                }
                continue;
            }
        };

        info!("agent link up for workspace {workspace_id} ({endpoint})");
        state.send_replace(LinkState::Connected);
        backoff = INITIAL_BACKOFF;

        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        // All link handles dropped; shut the connection down.
                        let _ = sink.send(Message::Close(None)).await;
                        state.send_replace(LinkState::Closed);
                        return;
                    };
                    let json = match serde_json::to_string(&cmd) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("failed to serialize command: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<AgentEvent>(&text) {
                                // No subscribers is fine; send only reports it.
                                Ok(event) => { let _ = events.send(event); }
                                Err(e) => warn!(
                                    "unparseable agent frame for workspace {workspace_id}: {e}"
                                ),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("agent link error for workspace {workspace_id}: {e}");
                            break;
                        }
                    }
                }
            }
        }

        warn!("agent link lost for workspace {workspace_id}");
    }

    state.send_replace(LinkState::Closed);
}

/// Cache of agent links, keyed by workspace id.
///
/// The entry API makes the first-join insert atomic: concurrent joins for
/// the same workspace observe exactly one link.
#[derive(Default)]
pub struct AgentLinkCache {
    links: DashMap<String, Arc<AgentLink>>,
}

impl AgentLinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached link for a workspace, or open one to `endpoint`.
    ///
    /// A cached link that is currently down is returned as-is: its own
    /// reconnect loop is the recovery path, and replacing it would race
    /// other clients into a second upstream connection.
    pub fn get_or_connect(&self, workspace_id: &str, endpoint: &str) -> Arc<AgentLink> {
        self.links
            .entry(workspace_id.to_string())
            .or_insert_with(|| AgentLink::connect(workspace_id, endpoint))
            .clone()
    }

    /// Cached link for a workspace, if any.
    pub fn get(&self, workspace_id: &str) -> Option<Arc<AgentLink>> {
        self.links.get(workspace_id).map(|l| Arc::clone(l.value()))
    }

    /// Drop a workspace's link (e.g. after tearing its container down).
    pub fn remove(&self, workspace_id: &str) {
        self.links.remove(workspace_id);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
