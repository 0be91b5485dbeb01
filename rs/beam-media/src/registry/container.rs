use serde::{Deserialize, Serialize};

/// Output container formats a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
	#[serde(rename = "mpegts")]
	MpegTs,
	Hls,
	Flv,
	Mp4,
	Fmp4,
	Matroska,
	WebM,
}

impl Container {
	pub const fn id(self) -> &'static str {
		match self {
			Self::MpegTs => "mpegts",
			Self::Hls => "hls",
			Self::Flv => "flv",
			Self::Mp4 => "mp4",
			Self::Fmp4 => "fmp4",
			Self::Matroska => "matroska",
			Self::WebM => "webm",
		}
	}

	/// Whether video in this container must use Annex B start codes.
	/// MP4-family containers require length prefixes instead.
	pub const fn requires_annex_b(self) -> bool {
		matches!(self, Self::MpegTs | Self::Hls)
	}

	/// Whether this container is an MP4 flavor (length-prefixed NALs, no
	/// ADTS framing around AAC).
	pub const fn is_mp4(self) -> bool {
		matches!(self, Self::Mp4 | Self::Fmp4)
	}
}

impl std::fmt::Display for Container {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.id())
	}
}

impl std::str::FromStr for Container {
	type Err = UnknownContainer;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"mpegts" | "mpeg-ts" | "ts" | "m2ts" => Ok(Self::MpegTs),
			"hls" | "m3u8" => Ok(Self::Hls),
			"flv" => Ok(Self::Flv),
			"mp4" | "mov" => Ok(Self::Mp4),
			"fmp4" | "cmaf" | "dash" => Ok(Self::Fmp4),
			"matroska" | "mkv" => Ok(Self::Matroska),
			"webm" => Ok(Self::WebM),
			other => Err(UnknownContainer(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown container: {0}")]
pub struct UnknownContainer(pub String);
