//! # beam-relay: the live TV relay engine
//!
//! `beam-relay` sits between upstream IPTV sources and downstream clients.
//! For every (channel, profile) pair it runs at most one upstream ingest,
//! decides per request whether bytes can be passed through, repackaged into
//! a different container, or must go through an external encoder, and fans
//! the result out to any number of clients through bounded per-variant
//! buffers.
//!
//! ## API
//!
//! The public surface is the [SessionManager]:
//! - [SessionManager::attach] to connect a client and get a byte stream.
//! - [SessionManager::detach] to disconnect one client.
//! - [SessionManager::list_sessions] / [SessionManager::session_info] for
//!   introspection.
//! - [SessionManager::kill_session] for the admin surface.
//!
//! HTTP framing, configuration files, persistence and the CLI are external
//! collaborators; this crate only exposes the engine.

mod error;

pub mod buffer;
pub mod config;
pub mod observability;
pub mod probe;
pub mod route;
pub mod session;
pub mod stats;
pub mod transcode;

pub use error::*;

pub use buffer::{StartPolicy, VariantBuffer};
pub use config::RelayConfig;
pub use probe::{Prober, SourceProbe};
pub use route::{Route, RouteType, TargetProfile};
pub use session::{
	AttachRequest, ClientStream, SessionHealth, SessionInfo, SessionManager, StreamEvent,
	TerminalStatus,
};
