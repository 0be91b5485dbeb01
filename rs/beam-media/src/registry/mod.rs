//! The codec registry: canonical codec identities and their container
//! properties.
//!
//! Normalization collapses every alias and encoder name to a single identity
//! so downstream comparisons are exact equality. The fMP4-only flag gates
//! the route decider; demuxability gates whether repackaging is attempted at
//! all. The table is static and read-only after process init.

mod audio;
mod container;
mod hwaccel;
mod video;

pub use audio::*;
pub use container::*;
pub use hwaccel::*;
pub use video::*;

/// Encoder-name suffixes that identify hardware or vendor encoders.
const ENCODER_SUFFIXES: &[&str] = &[
	"_nvenc",
	"_qsv",
	"_vaapi",
	"_videotoolbox",
	"_amf",
	"_mf",
	"_omx",
	"_v4l2m2m",
	"_cuvid",
	"_at",
	"_fixed",
];

/// Case-insensitive lookup over canonical ids, aliases and encoder names.
pub fn parse_video(s: &str) -> Option<VideoCodec> {
	let s = s.trim().to_ascii_lowercase();
	VideoCodec::ALL.iter().copied().find(|codec| codec.matches(&s))
}

/// Case-insensitive lookup over canonical ids, aliases and encoder names.
pub fn parse_audio(s: &str) -> Option<AudioCodec> {
	let s = s.trim().to_ascii_lowercase();
	AudioCodec::ALL.iter().copied().find(|codec| codec.matches(&s))
}

/// Collapse a codec name to its canonical id, or return it unchanged when it
/// isn't recognized.
pub fn normalize(s: &str) -> String {
	if let Some(video) = parse_video(s) {
		return video.id().to_string();
	}
	if let Some(audio) = parse_audio(s) {
		return audio.id().to_string();
	}
	s.to_string()
}

/// Like [normalize], but additionally recognizes RFC 6381 codec strings as
/// they appear in HLS playlists (`avc1.64001f`, `mp4a.40.2`, ...) by their
/// four-character prefix. Unknown fourcc strings come back unchanged, never
/// falsely canonicalized.
pub fn normalize_hls(s: &str) -> String {
	let lower = s.trim().to_ascii_lowercase();
	let prefix = lower.split('.').next().unwrap_or("");

	match prefix {
		"avc1" | "avc3" => VideoCodec::H264.id().to_string(),
		"hev1" | "hvc1" => VideoCodec::H265.id().to_string(),
		"vp09" => VideoCodec::Vp9.id().to_string(),
		"av01" => VideoCodec::Av1.id().to_string(),
		"mp4a" => AudioCodec::Aac.id().to_string(),
		"ac-3" => AudioCodec::Ac3.id().to_string(),
		"ec-3" => AudioCodec::Eac3.id().to_string(),
		_ => normalize(s),
	}
}

/// Whether a string names an encoder rather than a codec.
pub fn is_encoder(s: &str) -> bool {
	let s = s.trim().to_ascii_lowercase();
	s.starts_with("lib") || ENCODER_SUFFIXES.iter().any(|suffix| s.ends_with(suffix))
}
