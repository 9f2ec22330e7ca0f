//! cubby: workspace session server.
//!
//! Gives each logical workspace an isolated, ephemeral container sandbox
//! that remote clients attach to for interactive shells and sandboxed file
//! access. Three tiers:
//!
//! - [`lifecycle`] creates, reuses and tears down one container per
//!   workspace (durable volume, shared network, published ports);
//! - [`gateway`] authenticates clients and multiplexes their terminal and
//!   filesystem traffic onto cached per-workspace agent links;
//! - the `cubby-agent` crate runs inside each container and owns the PTYs
//!   and the path-sandboxed file service.

pub mod auth;
pub mod broker;
pub mod container;
pub mod gateway;
pub mod lifecycle;
pub mod settings;
