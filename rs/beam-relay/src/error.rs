use std::sync::Arc;

/// Everything that can go wrong between an upstream source and a client.
///
/// The session is the final adjudicator: component errors bubble up to it
/// and it decides between retry, fallback and teardown.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The probe subprocess exceeded its wall-clock budget.
	#[error("probe timeout after {0:?}")]
	ProbeTimeout(std::time::Duration),

	/// The probe ran but found no usable streams.
	#[error("no streams found by probe")]
	NoStreams,

	/// The probe produced output that could not be parsed.
	#[error("probe parse failure: {0}")]
	ProbeParse(String),

	/// The probe subprocess could not be spawned or exited abnormally.
	#[error("probe failed: {0}")]
	ProbeFailed(String),

	/// A demux-level failure from the media layer.
	#[error("demux error: {0}")]
	Demux(#[from] beam_media::Error),

	/// A reader fell behind eviction; it should resubscribe from the next
	/// keyframe at or after `oldest`.
	#[error("reader lagged; oldest available sequence is {oldest}")]
	BufferLagged { oldest: u64 },

	/// The buffer (or its session) shut down while a reader was waiting.
	#[error("buffer closed")]
	BufferClosed,

	/// The encoder subprocess died before proving itself viable.
	#[error("transcoder failed to start after {attempts} attempts: {reason}")]
	TranscoderStartup { attempts: u32, reason: String },

	/// The encoder subprocess died after running healthily; fatal for the
	/// session.
	#[error("transcoder exited after {runtime:?}: {reason}")]
	TranscoderRuntime {
		runtime: std::time::Duration,
		reason: String,
	},

	/// Reading from the upstream failed.
	#[error("upstream error: {0}")]
	Upstream(String),

	/// Writing to one downstream client failed; only that client dies.
	#[error("client write error: {0}")]
	ClientWrite(String),

	/// User-supplied encoder options were rejected before spawning.
	#[error("option validation failed: {0}")]
	Validation(String),

	/// The requested entity does not exist.
	#[error("not found: {0}")]
	NotFound(String),

	/// The session is gone (killed, errored, or lingered out).
	#[error("session closed")]
	SessionClosed,

	/// The requested codec/container combination cannot be produced.
	#[error("unsupported target: {0}")]
	UnsupportedTarget(String),

	/// An I/O error outside the categories above.
	#[error("io error: {0}")]
	Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(Arc::new(err))
	}
}

impl Error {
	/// The stable category name logged as `error_type`.
	pub fn error_type(&self) -> &'static str {
		match self {
			Self::ProbeTimeout(_) => "probe-timeout",
			Self::NoStreams => "no-streams",
			Self::ProbeParse(_) => "probe-parse",
			Self::ProbeFailed(_) => "probe-failed",
			Self::Demux(_) => "demux",
			Self::BufferLagged { .. } => "lagged",
			Self::BufferClosed => "buffer-closed",
			Self::TranscoderStartup { .. } => "transcoder-startup",
			Self::TranscoderRuntime { .. } => "transcoder-runtime",
			Self::Upstream(_) => "upstream",
			Self::ClientWrite(_) => "client-write",
			Self::Validation(_) => "validation",
			Self::NotFound(_) => "not-found",
			Self::SessionClosed => "session-closed",
			Self::UnsupportedTarget(_) => "unsupported-target",
			Self::Io(_) => "io",
		}
	}

	/// Whether the session may retry the operation once before giving up.
	pub fn is_recoverable(&self) -> bool {
		matches!(
			self,
			Self::ProbeTimeout(_) | Self::NoStreams | Self::ProbeParse(_) | Self::Upstream(_)
		)
	}
}

pub type Result<T> = std::result::Result<T, Error>;
