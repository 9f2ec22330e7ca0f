//! Commands flowing toward the agent (client -> gateway -> agent).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Any frame a client may send to the gateway.
///
/// Untagged: the inner enums are each internally tagged by `type`, so the
/// variant names never collide and deserialization stays unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientCommand {
    /// Gateway-terminated control traffic.
    Control(ControlCommand),
    /// Session traffic relayed verbatim to the joined workspace's agent.
    Session(SessionCommand),
}

/// Control commands handled by the gateway itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlCommand {
    /// Attach this connection to a workspace, creating its container and
    /// agent link on demand.
    #[serde(rename = "workspace:join", rename_all = "camelCase")]
    WorkspaceJoin { workspace_id: String },

    /// Publish a payload on the cross-gateway broadcast channel.
    #[serde(rename = "event:message")]
    Publish { payload: Value },

    /// Keepalive reply to a gateway `ping`.
    #[serde(rename = "pong")]
    Pong,
}

/// Session-scoped commands, multiplexed by session id where applicable.
///
/// These are the frames the gateway forwards to the agent without
/// interpretation; the agent is the sole consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionCommand {
    /// Spawn a shell under the given session id, replacing any live process
    /// already registered under it.
    #[serde(rename = "terminal:create", rename_all = "camelCase")]
    TerminalCreate { session_id: String },

    /// Raw keystrokes for a session's PTY.
    #[serde(rename = "terminal:input", rename_all = "camelCase")]
    TerminalInput { session_id: String, data: String },

    /// New PTY dimensions.
    #[serde(rename = "terminal:resize", rename_all = "camelCase")]
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// Terminate a session and drop its registry entry.
    #[serde(rename = "terminal:kill", rename_all = "camelCase")]
    TerminalKill { session_id: String },

    /// Recursively list a directory under the sandbox root.
    #[serde(rename = "fs:list")]
    FsList { dir: String },

    /// Read a file's text content.
    #[serde(rename = "fs:read")]
    FsRead { path: String },

    /// Write (or create) a file, making intermediate directories as needed.
    #[serde(rename = "fs:write")]
    FsWrite { path: String, content: String },
}

impl SessionCommand {
    /// The session id this command targets, for terminal commands.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionCommand::TerminalCreate { session_id }
            | SessionCommand::TerminalInput { session_id, .. }
            | SessionCommand::TerminalResize { session_id, .. }
            | SessionCommand::TerminalKill { session_id } => Some(session_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_command_wire_names() {
        let cmd = SessionCommand::TerminalInput {
            session_id: "t1".to_string(),
            data: "ls\n".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "terminal:input");
        assert_eq!(json["sessionId"], "t1");
        assert_eq!(json["data"], "ls\n");
    }

    #[test]
    fn client_command_splits_control_from_session() {
        let join: ClientCommand =
            serde_json::from_str(r#"{"type":"workspace:join","workspaceId":"w1"}"#).unwrap();
        assert!(matches!(
            join,
            ClientCommand::Control(ControlCommand::WorkspaceJoin { ref workspace_id })
                if workspace_id == "w1"
        ));

        let create: ClientCommand =
            serde_json::from_str(r#"{"type":"terminal:create","sessionId":"t1"}"#).unwrap();
        assert!(matches!(
            create,
            ClientCommand::Session(SessionCommand::TerminalCreate { ref session_id })
                if session_id == "t1"
        ));
    }

    #[test]
    fn session_command_relays_verbatim() {
        // A relayed command must re-serialize to the same JSON the client sent.
        let raw = r#"{"type":"terminal:resize","sessionId":"t1","cols":120,"rows":40}"#;
        let parsed: ClientCommand = serde_json::from_str(raw).unwrap();
        let ClientCommand::Session(cmd) = parsed else {
            panic!("expected session command");
        };
        let reserialized: Value = serde_json::to_value(&cmd).unwrap();
        let original: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(reserialized, original);
    }

    #[test]
    fn fs_commands_round_trip() {
        for raw in [
            r#"{"type":"fs:list","dir":"."}"#,
            r#"{"type":"fs:read","path":"src/app.ts"}"#,
            r#"{"type":"fs:write","path":"a/b.txt","content":"hi"}"#,
        ] {
            let cmd: SessionCommand = serde_json::from_str(raw).unwrap();
            let back: Value = serde_json::to_value(&cmd).unwrap();
            assert_eq!(back, serde_json::from_str::<Value>(raw).unwrap());
        }
    }
}
