//! Sessions: one upstream per (channel, profile), fanned out to clients.

mod ingest;
mod manager;
#[allow(clippy::module_inception)]
mod session;

pub use ingest::*;
pub use manager::*;
pub use session::*;

use bytes::Bytes;
use serde::Serialize;
use serde_with::{serde_as, DisplayFromStr};
use tokio::sync::{mpsc, OwnedSemaphorePermit};

use beam_media::registry::{Container, HwAccel};

use crate::route::RouteType;

/// The identity of a session: one per (channel, profile).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
	pub channel: String,
	pub profile: String,
}

impl std::fmt::Display for SessionKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.channel, self.profile)
	}
}

/// A client's request to join a stream.
///
/// The upstream URL is resolved by the caller (channel storage is not this
/// crate's business); everything else mirrors the public attach interface.
#[derive(Debug, Clone)]
pub struct AttachRequest {
	pub channel: String,
	pub profile: String,
	pub upstream_url: String,
	pub container: Container,
	/// Desired codecs; None keeps whatever the source has.
	pub video: Option<String>,
	pub audio: Option<String>,
	pub hwaccel: HwAccel,
	pub remote_addr: Option<String>,
	pub user_agent: Option<String>,
}

/// Why a client's stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
	/// The client could not keep up and was evicted.
	Lagged,
	/// The session failed underneath the client.
	Error(String),
	/// Orderly teardown (detach, kill, linger expiry).
	Shutdown,
}

/// One delivery to a client: bytes, or the reason there will be no more.
#[derive(Debug)]
pub enum StreamEvent {
	Data(Bytes),
	Terminal(TerminalStatus),
}

pub(crate) type StreamItem = (StreamEvent, Option<OwnedSemaphorePermit>);

/// The consuming end of a client attachment. The transport layer reads
/// events and writes the bytes to its socket; dropping the stream detaches
/// the client.
pub struct ClientStream {
	pub client_id: String,
	pub session_id: String,
	pub(crate) rx: mpsc::UnboundedReceiver<StreamItem>,
}

impl ClientStream {
	/// The next event. `None` after a terminal event or session teardown.
	pub async fn recv(&mut self) -> Option<StreamEvent> {
		self.rx.recv().await.map(|(event, _permit)| event)
	}
}

/// Point-in-time description of one client, §6's ClientInfo.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
	pub id: String,
	pub remote_addr: Option<String>,
	pub user_agent: Option<String>,
	#[serde_as(as = "DisplayFromStr")]
	pub container: Container,
	pub connected_secs: u64,
	pub bytes_sent: u64,
}

/// Point-in-time description of one session, §6's SessionInfo.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
	pub id: String,
	pub channel: String,
	pub profile: String,
	pub upstream_url: String,
	pub route: Option<RouteType>,
	/// The active (video, audio) pair, e.g. `h264+aac`.
	pub variant: Option<String>,
	#[serde_as(as = "DisplayFromStr")]
	pub container: Container,
	pub clients: Vec<ClientInfo>,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub ingress_rate: f64,
	pub egress_rate: f64,
	pub uptime_secs: u64,
	pub last_activity_secs: u64,
	pub in_fallback: bool,
	pub error: Option<String>,
	/// Transcoder snapshot when one is running.
	pub transcoder: Option<TranscoderInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscoderInfo {
	pub pid: Option<u32>,
	pub attempt: u32,
	pub cpu_percent: f32,
	pub rss_bytes: u64,
	pub bytes_written: u64,
	pub recent_stderr: Vec<String>,
}

/// The result of one health probe against a session.
///
/// `stalled` is set when ingress hasn't grown for the configured stall
/// threshold; the session's own watchdog uses this to tear down a pipeline
/// that is alive but no longer moving data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
	pub ingress_rate: f64,
	pub egress_rate: f64,
	pub last_activity_secs: u64,
	pub transcoder_running: bool,
	pub stalled: bool,
}

/// Opaque stable identifiers, in the `prefix-hex` shape.
pub(crate) fn generate_id(prefix: &str) -> String {
	let mut bytes = [0u8; 8];
	rand::fill(&mut bytes);
	format!("{}-{}", prefix, hex::encode(bytes))
}
