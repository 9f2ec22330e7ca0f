//! Canonical wire types for cubby workspace sessions.
//!
//! This crate defines the message vocabulary spoken across both hops of the
//! session pipeline:
//!
//! ```text
//! Client <--[WS: ClientCommand / GatewayEvent]--> Gateway <--[WS: SessionCommand / AgentEvent]--> Agent
//!                                                                                                  |
//!                                                                                             PTY + files
//! ```
//!
//! The gateway relays the session-scoped subset (`terminal:*`, `fs:*`)
//! verbatim between the two hops: a `SessionCommand` parsed from a client
//! frame re-serializes byte-for-byte identically when forwarded upstream, and
//! an `AgentEvent` coming back is a valid `GatewayEvent` as-is. Control
//! traffic (`workspace:join`, presence, keepalive) exists only on the client
//! hop.
//!
//! All frames are JSON text, tagged by a `type` field carrying the event
//! name (`"terminal:data"`, `"fs:list:result"`, ...).

mod commands;
mod events;

pub use commands::{ClientCommand, ControlCommand, SessionCommand};
pub use events::{AgentEvent, ControlEvent, FileKind, FileNode, GatewayEvent};
