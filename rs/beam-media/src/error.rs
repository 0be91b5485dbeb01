use crate::model::Timestamp;

/// Errors produced while parsing or assembling media containers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// A sample payload was empty or too short to carry a valid access unit.
	#[error("malformed sample: {0}")]
	MalformedSample(&'static str),

	/// An Annex B byte stream did not start with a valid start code.
	#[error("missing Annex B start code")]
	MissingStartCode,

	/// A length-prefixed (AVCC) buffer declared more bytes than it holds.
	#[error("truncated length-prefixed NAL unit")]
	TruncatedNal,

	/// An ADTS buffer did not begin with the 0xFFF syncword.
	#[error("missing ADTS syncword")]
	MissingAdtsSync,

	/// An ADTS header referenced a reserved sampling frequency index.
	#[error("reserved ADTS sampling frequency index: {0}")]
	AdtsSampleRate(u8),

	/// An AV1 LEB128 length field was truncated or oversized.
	#[error("invalid LEB128 value")]
	InvalidLeb128,

	/// An OBU header failed validation (forbidden bit, reserved type).
	#[error("invalid OBU header")]
	InvalidObu,

	/// A VP9 uncompressed frame header failed validation.
	#[error("invalid VP9 frame header: {0}")]
	InvalidVp9(&'static str),

	/// A PES header was shorter than its declared length.
	#[error("malformed PES header on pid {pid}")]
	MalformedPes { pid: u16 },

	/// A PTS/DTS pair violated DTS <= PTS or the 33-bit range.
	#[error("invalid timestamp: dts {dts} > pts {pts}")]
	InvalidTimestamp { pts: Timestamp, dts: Timestamp },

	/// A keyframe sample had to be emitted before any parameter sets were seen.
	#[error("missing parameter sets for {0}")]
	MissingParameterSets(&'static str),

	/// The muxer was asked to emit a codec the container cannot carry.
	#[error("codec {codec} cannot be carried in {container}")]
	UnsupportedCodec {
		codec: &'static str,
		container: &'static str,
	},

	/// A fragmented MP4 stream referenced a track missing from its moov.
	#[error("unknown track id {0}")]
	UnknownTrack(u32),

	/// A fragmented MP4 stream was structurally invalid.
	#[error("invalid fMP4 structure: {0}")]
	InvalidFmp4(&'static str),

	/// The underlying ISOBMFF library rejected an atom.
	#[error("mp4 atom error: {0}")]
	Mp4(std::sync::Arc<mp4_atom::Error>),
}

impl From<mp4_atom::Error> for Error {
	fn from(err: mp4_atom::Error) -> Self {
		Self::Mp4(std::sync::Arc::new(err))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
