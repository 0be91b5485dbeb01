use bytes::Bytes;
use derive_more::Debug;

use crate::model::Timestamp;
use crate::registry::{AudioCodec, VideoCodec};

/// Which elementary stream a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
	Video,
	Audio,
}

impl std::fmt::Display for TrackKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Video => write!(f, "video"),
			Self::Audio => write!(f, "audio"),
		}
	}
}

/// The codec of a sample, as far as the demuxer could tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From)]
pub enum CodecHint {
	Video(VideoCodec),
	Audio(AudioCodec),
}

/// One elementary-stream access unit.
///
/// Video payloads are Annex B, audio payloads are ADTS (AAC) or raw frames.
/// The sequence number is assigned by the variant buffer on admission and is
/// strictly increasing within a track.
#[derive(Clone, Debug)]
pub struct Sample {
	pub kind: TrackKind,

	/// Best-effort codec identification from PMT stream types or the route
	/// decider's hint.
	pub codec: Option<CodecHint>,

	/// The encoded access unit.
	/// The debug implementation shows only the payload length for brevity.
	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,

	/// Presentation timestamp at 90 kHz.
	pub pts: Timestamp,

	/// Decode timestamp at 90 kHz. Equal to `pts` when the stream has no
	/// reordering.
	pub dts: Timestamp,

	/// Duration of this access unit, if the demuxer could derive one.
	pub duration: Option<Timestamp>,

	/// Whether this sample can be decoded independently (IDR / IRAP / key
	/// OBU / VP9 key frame; always true for audio).
	pub keyframe: bool,

	/// Position in the track's admission order. Zero until admitted.
	pub sequence: u64,
}

impl Sample {
	/// Bytes of payload held by this sample.
	pub fn size(&self) -> usize {
		self.payload.len()
	}
}

/// A sample converted into muxer-ready form by the adapter.
///
/// For fMP4 targets the payload is length-prefixed (AVCC) video or raw audio
/// frames with ADTS stripped; for MPEG-TS targets it stays Annex B with
/// parameter sets inline on keyframes.
#[derive(Clone, Debug)]
pub struct MuxSample {
	pub kind: TrackKind,

	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,

	pub pts: Timestamp,
	pub dts: Timestamp,

	/// Always present: the adapter fills gaps with the track default.
	pub duration: Timestamp,

	pub keyframe: bool,
}

impl MuxSample {
	/// Composition time offset (pts - dts) for trun entries.
	pub fn cts(&self) -> i64 {
		self.pts.as_ticks() as i64 - self.dts.as_ticks() as i64
	}
}

/// The (video codec, audio codec) pair identifying one parallel flavor of a
/// stream. Audio-only sources leave the video side empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Variant {
	pub video: Option<VideoCodec>,
	pub audio: Option<AudioCodec>,
}

impl Variant {
	pub const fn new(video: VideoCodec, audio: AudioCodec) -> Self {
		Self {
			video: Some(video),
			audio: Some(audio),
		}
	}

	/// Whether either side requires the fMP4 container.
	pub fn requires_fmp4(&self) -> bool {
		self.video.map(|v| v.requires_fmp4()).unwrap_or(false)
			|| self.audio.map(|a| a.requires_fmp4()).unwrap_or(false)
	}
}

impl std::fmt::Display for Variant {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match (self.video, self.audio) {
			(Some(v), Some(a)) => write!(f, "{}+{}", v, a),
			(Some(v), None) => write!(f, "{}", v),
			(None, Some(a)) => write!(f, "{}", a),
			(None, None) => write!(f, "none"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn variant_fmp4_promotion() {
		let ts_friendly = Variant::new(VideoCodec::H264, AudioCodec::Aac);
		assert!(!ts_friendly.requires_fmp4());

		let web = Variant::new(VideoCodec::Av1, AudioCodec::Opus);
		assert!(web.requires_fmp4());

		let mixed = Variant::new(VideoCodec::H264, AudioCodec::Opus);
		assert!(mixed.requires_fmp4());
	}

	#[test]
	fn variant_display() {
		assert_eq!(Variant::new(VideoCodec::H265, AudioCodec::Eac3).to_string(), "h265+eac3");
		let audio_only = Variant {
			video: None,
			audio: Some(AudioCodec::Aac),
		};
		assert_eq!(audio_only.to_string(), "aac");
	}
}
