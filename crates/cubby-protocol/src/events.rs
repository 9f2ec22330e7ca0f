//! Events flowing back toward the client (agent -> gateway -> client).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Any frame the gateway may send to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatewayEvent {
    /// Gateway-originated control traffic.
    Control(ControlEvent),
    /// Session traffic relayed verbatim from the workspace's agent.
    Session(AgentEvent),
}

impl From<AgentEvent> for GatewayEvent {
    fn from(event: AgentEvent) -> Self {
        GatewayEvent::Session(event)
    }
}

impl From<ControlEvent> for GatewayEvent {
    fn from(event: ControlEvent) -> Self {
        GatewayEvent::Control(event)
    }
}

/// Control events originated by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// Connection accepted and registered.
    #[serde(rename = "connected")]
    Connected,

    /// Keepalive; clients answer with `pong`.
    #[serde(rename = "ping")]
    Ping,

    /// The workspace's container is up and its agent link is connected.
    #[serde(rename = "workspace:ready", rename_all = "camelCase")]
    WorkspaceReady { workspace_id: String },

    /// Container or agent-link resolution failed for a join.
    #[serde(rename = "workspace:error")]
    WorkspaceError { message: String },

    /// A user came online or went offline.
    #[serde(rename = "presence:update", rename_all = "camelCase")]
    PresenceUpdate {
        user_id: String,
        is_online: bool,
        last_online_at: String,
    },

    /// Payload relayed from the cross-gateway broadcast channel.
    #[serde(rename = "message")]
    Broadcast { payload: Value },
}

/// Session-scoped events produced by the agent, tagged with the originating
/// session id where applicable so clients can demultiplex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    /// A chunk of PTY output.
    #[serde(rename = "terminal:data", rename_all = "camelCase")]
    TerminalData { session_id: String, data: String },

    /// The session's process exited; its registry entry is gone.
    #[serde(rename = "terminal:exit", rename_all = "camelCase")]
    TerminalExit { session_id: String },

    /// Recursive listing result for an `fs:list`.
    #[serde(rename = "fs:list:result")]
    FsListResult { entries: Vec<FileNode> },

    /// File content for an `fs:read`.
    #[serde(rename = "fs:read:result")]
    FsReadResult { content: String, path: String },

    /// Acknowledgement of an `fs:write`.
    #[serde(rename = "fs:write:success")]
    FsWriteSuccess { path: String },

    /// Any file operation failure, with a human-readable message.
    #[serde(rename = "fs:error")]
    FsError { message: String },
}

/// One entry in a recursive directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    /// Path relative to the sandbox root, `/`-separated.
    pub path: String,
    /// Byte size; best-effort, absent when stat fails or for directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Folder,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_event_wire_names() {
        let event = AgentEvent::TerminalData {
            session_id: "t1".to_string(),
            data: "hi\r\n".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "terminal:data");
        assert_eq!(json["sessionId"], "t1");

        let exit = AgentEvent::TerminalExit {
            session_id: "t1".to_string(),
        };
        assert_eq!(serde_json::to_value(&exit).unwrap()["type"], "terminal:exit");
    }

    #[test]
    fn agent_event_is_valid_gateway_event() {
        let raw = r#"{"type":"fs:read:result","content":"x","path":"a.txt"}"#;
        let event: GatewayEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            event,
            GatewayEvent::Session(AgentEvent::FsReadResult { .. })
        ));
    }

    #[test]
    fn file_node_listing_round_trips() {
        let listing = AgentEvent::FsListResult {
            entries: vec![FileNode {
                name: "src".to_string(),
                kind: FileKind::Folder,
                path: "src".to_string(),
                size: None,
                children: Some(vec![FileNode {
                    name: "app.ts".to_string(),
                    kind: FileKind::File,
                    path: "src/app.ts".to_string(),
                    size: Some(42),
                    children: None,
                }]),
            }],
        };
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["type"], "fs:list:result");
        assert_eq!(json["entries"][0]["type"], "folder");
        assert_eq!(json["entries"][0]["children"][0]["size"], 42);

        let back: AgentEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back, AgentEvent::FsListResult { ref entries } if entries.len() == 1));
    }

    #[test]
    fn control_event_wire_names() {
        let ready = ControlEvent::WorkspaceReady {
            workspace_id: "w1".to_string(),
        };
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["type"], "workspace:ready");
        assert_eq!(json["workspaceId"], "w1");

        let err = ControlEvent::WorkspaceError {
            message: "no container".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap()["type"],
            "workspace:error"
        );
    }
}
