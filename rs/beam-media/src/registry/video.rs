use serde::{Deserialize, Serialize};

use crate::registry::HwAccel;

/// Every video codec the relay can identify.
///
/// Identity is by discriminant; aliases only affect lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
	H264,
	H265,
	Vp8,
	Vp9,
	Av1,
	Mpeg1,
	Mpeg2,
	Mpeg4,
	Vc1,
	ProRes,
	DnxHd,
	Theora,
}

impl VideoCodec {
	pub const ALL: [Self; 12] = [
		Self::H264,
		Self::H265,
		Self::Vp8,
		Self::Vp9,
		Self::Av1,
		Self::Mpeg1,
		Self::Mpeg2,
		Self::Mpeg4,
		Self::Vc1,
		Self::ProRes,
		Self::DnxHd,
		Self::Theora,
	];

	/// The canonical, lowercase identifier.
	pub const fn id(self) -> &'static str {
		match self {
			Self::H264 => "h264",
			Self::H265 => "h265",
			Self::Vp8 => "vp8",
			Self::Vp9 => "vp9",
			Self::Av1 => "av1",
			Self::Mpeg1 => "mpeg1video",
			Self::Mpeg2 => "mpeg2video",
			Self::Mpeg4 => "mpeg4",
			Self::Vc1 => "vc1",
			Self::ProRes => "prores",
			Self::DnxHd => "dnxhd",
			Self::Theora => "theora",
		}
	}

	pub const fn aliases(self) -> &'static [&'static str] {
		match self {
			Self::H264 => &["avc", "avc1", "avc3", "x264"],
			Self::H265 => &["hevc", "hev1", "hvc1", "x265"],
			Self::Vp8 => &["vp08"],
			Self::Vp9 => &["vp09"],
			Self::Av1 => &["av01", "aom"],
			Self::Mpeg1 => &["mpeg1"],
			Self::Mpeg2 => &["mpeg2", "m2v"],
			Self::Mpeg4 => &["divx", "xvid", "mp4v"],
			Self::Vc1 => &["wmv3", "wvc1"],
			Self::ProRes => &["apch", "apcn", "apcs", "apco"],
			Self::DnxHd => &["dnxhr", "avid"],
			Self::Theora => &[],
		}
	}

	/// ISO/IEC 13818-1 stream type, or 0 when the codec is not carried in
	/// MPEG-TS.
	pub const fn mpegts_stream_type(self) -> u8 {
		match self {
			Self::H264 => 0x1B,
			Self::H265 => 0x24,
			Self::Mpeg1 => 0x01,
			Self::Mpeg2 => 0x02,
			Self::Mpeg4 => 0x10,
			Self::Vc1 => 0xEA,
			_ => 0,
		}
	}

	/// Whether this codec can only be delivered in fragmented MP4.
	pub const fn requires_fmp4(self) -> bool {
		matches!(self, Self::Vp8 | Self::Vp9 | Self::Av1)
	}

	/// Whether the elementary-stream demuxer can produce usable samples for
	/// this codec. Anything else forces the route decider into transcode.
	pub const fn is_demuxable(self) -> bool {
		matches!(self, Self::H264 | Self::H265 | Self::Vp9 | Self::Av1)
	}

	/// The encoder for this codec under the given acceleration mode,
	/// falling back to software when the mode has no encoder. Empty for
	/// decode-only codecs.
	pub const fn encoder(self, accel: HwAccel) -> &'static str {
		let software = match self {
			Self::H264 => "libx264",
			Self::H265 => "libx265",
			Self::Vp9 => "libvpx-vp9",
			Self::Av1 => "libsvtav1",
			_ => return "",
		};

		let accelerated = match (self, accel) {
			(Self::H264, HwAccel::Cuda) => "h264_nvenc",
			(Self::H264, HwAccel::Qsv) => "h264_qsv",
			(Self::H264, HwAccel::Vaapi) => "h264_vaapi",
			(Self::H264, HwAccel::VideoToolbox) => "h264_videotoolbox",
			(Self::H265, HwAccel::Cuda) => "hevc_nvenc",
			(Self::H265, HwAccel::Qsv) => "hevc_qsv",
			(Self::H265, HwAccel::Vaapi) => "hevc_vaapi",
			(Self::H265, HwAccel::VideoToolbox) => "hevc_videotoolbox",
			(Self::Vp9, HwAccel::Qsv) => "vp9_qsv",
			(Self::Vp9, HwAccel::Vaapi) => "vp9_vaapi",
			(Self::Av1, HwAccel::Cuda) => "av1_nvenc",
			(Self::Av1, HwAccel::Qsv) => "av1_qsv",
			(Self::Av1, HwAccel::Vaapi) => "av1_vaapi",
			_ => "",
		};

		if accelerated.is_empty() { software } else { accelerated }
	}

	/// All encoder names this codec can appear under, for reverse lookup.
	const fn encoders(self) -> &'static [&'static str] {
		match self {
			Self::H264 => &[
				"libx264",
				"h264_nvenc",
				"h264_qsv",
				"h264_vaapi",
				"h264_videotoolbox",
				"h264_amf",
				"h264_v4l2m2m",
			],
			Self::H265 => &[
				"libx265",
				"hevc_nvenc",
				"hevc_qsv",
				"hevc_vaapi",
				"hevc_videotoolbox",
				"hevc_amf",
			],
			Self::Vp8 => &["libvpx"],
			Self::Vp9 => &["libvpx-vp9", "vp9_qsv", "vp9_vaapi"],
			Self::Av1 => &["libsvtav1", "libaom-av1", "librav1e", "av1_nvenc", "av1_qsv", "av1_vaapi"],
			_ => &[],
		}
	}

	pub(super) fn matches(self, lower: &str) -> bool {
		self.id() == lower
			|| self.aliases().contains(&lower)
			|| self.encoders().contains(&lower)
	}
}

impl std::fmt::Display for VideoCodec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.id())
	}
}

impl std::str::FromStr for VideoCodec {
	type Err = UnknownCodec;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		crate::registry::parse_video(s).ok_or_else(|| UnknownCodec(s.to_string()))
	}
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown codec: {0}")]
pub struct UnknownCodec(pub String);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encoder_selection_falls_back_to_software() {
		assert_eq!(VideoCodec::H264.encoder(HwAccel::Cuda), "h264_nvenc");
		assert_eq!(VideoCodec::H264.encoder(HwAccel::None), "libx264");
		// No NVENC for VP9: software fallback.
		assert_eq!(VideoCodec::Vp9.encoder(HwAccel::Cuda), "libvpx-vp9");
		assert_eq!(VideoCodec::Av1.encoder(HwAccel::Vaapi), "av1_vaapi");
	}

	#[test]
	fn decode_only_codecs_have_no_encoder() {
		assert_eq!(VideoCodec::Mpeg2.encoder(HwAccel::None), "");
		assert_eq!(VideoCodec::Vc1.encoder(HwAccel::Cuda), "");
		assert_eq!(VideoCodec::Theora.encoder(HwAccel::Auto), "");
	}

	#[test]
	fn stream_types() {
		assert_eq!(VideoCodec::H264.mpegts_stream_type(), 0x1B);
		assert_eq!(VideoCodec::H265.mpegts_stream_type(), 0x24);
		assert_eq!(VideoCodec::Av1.mpegts_stream_type(), 0);
	}
}
