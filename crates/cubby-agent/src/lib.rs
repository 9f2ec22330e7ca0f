//! cubby-agent: the in-container workspace agent.
//!
//! Runs inside each workspace container and exposes terminal sessions and
//! path-sandboxed file access to the gateway over a single-upstream
//! WebSocket. See `server` for the connection model.

pub mod error;
pub mod files;
pub mod server;
pub mod terminal;

pub use server::{router, AppState};
