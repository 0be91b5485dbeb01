use serde::{Deserialize, Serialize};

/// Every audio codec the relay can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
	Aac,
	Mp3,
	Ac3,
	Eac3,
	Opus,
	Vorbis,
	Flac,
	Dts,
	TrueHd,
	Pcm,
}

impl AudioCodec {
	pub const ALL: [Self; 10] = [
		Self::Aac,
		Self::Mp3,
		Self::Ac3,
		Self::Eac3,
		Self::Opus,
		Self::Vorbis,
		Self::Flac,
		Self::Dts,
		Self::TrueHd,
		Self::Pcm,
	];

	pub const fn id(self) -> &'static str {
		match self {
			Self::Aac => "aac",
			Self::Mp3 => "mp3",
			Self::Ac3 => "ac3",
			Self::Eac3 => "eac3",
			Self::Opus => "opus",
			Self::Vorbis => "vorbis",
			Self::Flac => "flac",
			Self::Dts => "dts",
			Self::TrueHd => "truehd",
			Self::Pcm => "pcm",
		}
	}

	pub const fn aliases(self) -> &'static [&'static str] {
		match self {
			Self::Aac => &["mp4a", "aac_latm", "he-aac"],
			Self::Mp3 => &["mp3float", "mpga", "mp2"],
			Self::Ac3 => &["ac-3", "dolby_digital"],
			Self::Eac3 => &["ec-3", "e-ac-3", "ddp", "dolby_digital_plus"],
			Self::Opus => &[],
			Self::Vorbis => &["ogg"],
			Self::Flac => &[],
			Self::Dts => &["dca", "dts-hd"],
			Self::TrueHd => &["mlp"],
			Self::Pcm => &["pcm_s16le", "pcm_s16be", "pcm_s24le", "lpcm"],
		}
	}

	/// ISO/IEC 13818-1 stream type, or 0 when the codec is not carried in
	/// MPEG-TS.
	pub const fn mpegts_stream_type(self) -> u8 {
		match self {
			Self::Aac => 0x0F,
			Self::Mp3 => 0x03,
			Self::Ac3 => 0x81,
			Self::Eac3 => 0x87,
			Self::Dts => 0x82,
			Self::TrueHd => 0x83,
			_ => 0,
		}
	}

	pub const fn requires_fmp4(self) -> bool {
		matches!(self, Self::Opus | Self::Vorbis | Self::Flac | Self::TrueHd | Self::Pcm)
	}

	/// Whether the elementary-stream demuxer can produce usable samples for
	/// this codec. Unknown or unparseable audio is NOT assumed to be AAC;
	/// the safe default is to force a transcode.
	pub const fn is_demuxable(self) -> bool {
		matches!(self, Self::Aac | Self::Mp3 | Self::Ac3 | Self::Eac3)
	}

	/// The canonical encoder, or empty for decode-only codecs.
	pub const fn encoder(self) -> &'static str {
		match self {
			Self::Aac => "aac",
			Self::Mp3 => "libmp3lame",
			Self::Ac3 => "ac3",
			Self::Eac3 => "eac3",
			Self::Opus => "libopus",
			Self::Vorbis => "libvorbis",
			Self::Flac => "flac",
			_ => "",
		}
	}

	const fn encoders(self) -> &'static [&'static str] {
		match self {
			Self::Aac => &["aac", "aac_at", "libfdk_aac", "aac_fixed"],
			Self::Mp3 => &["libmp3lame", "libshine"],
			Self::Ac3 => &["ac3", "ac3_fixed"],
			Self::Eac3 => &["eac3"],
			Self::Opus => &["libopus"],
			Self::Vorbis => &["libvorbis"],
			Self::Flac => &["flac"],
			_ => &[],
		}
	}

	pub(super) fn matches(self, lower: &str) -> bool {
		self.id() == lower
			|| self.aliases().contains(&lower)
			|| self.encoders().contains(&lower)
			|| (matches!(self, Self::Pcm) && lower.starts_with("pcm_"))
	}
}

impl std::fmt::Display for AudioCodec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.id())
	}
}

impl std::str::FromStr for AudioCodec {
	type Err = super::UnknownCodec;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		crate::registry::parse_audio(s).ok_or_else(|| super::UnknownCodec(s.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pcm_variants_collapse() {
		assert_eq!(crate::registry::parse_audio("pcm_s24le"), Some(AudioCodec::Pcm));
		assert_eq!(crate::registry::parse_audio("pcm_f32le"), Some(AudioCodec::Pcm));
	}

	#[test]
	fn decode_only_audio() {
		assert_eq!(AudioCodec::Dts.encoder(), "");
		assert_eq!(AudioCodec::TrueHd.encoder(), "");
		assert!(!AudioCodec::Dts.requires_fmp4());
		assert!(AudioCodec::TrueHd.requires_fmp4());
	}
}
