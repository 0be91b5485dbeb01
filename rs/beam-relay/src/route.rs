//! The route decider: given a probed source and a target profile, choose
//! between passthrough, repackage and transcode.
//!
//! The decision is a pure function of (source probe, target profile,
//! available encoders): same inputs, same route, same encoder names.

use std::collections::HashSet;

use beam_media::registry::{self, AudioCodec, Container, HwAccel, VideoCodec};
use beam_media::Variant;

use crate::probe::SourceProbe;
use crate::{Error, Result};

/// What the engine will do between ingest and delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
	/// Bytes flow through unchanged.
	Passthrough,
	/// Elementary streams are re-containered without re-encoding.
	Repackage,
	/// An external encoder rewrites the streams.
	Transcode,
}

/// NAL framing conversion applied while copying video. Never applied when
/// transcoding; the encoder emits the right framing itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamFilter {
	AnnexBToAvcc,
	AvccToAnnexB,
}

/// What a client asked for.
#[derive(Debug, Clone)]
pub struct TargetProfile {
	pub container: Container,
	/// Desired video codec (any registry alias); None keeps the source's.
	pub video: Option<String>,
	/// Desired audio codec; None keeps the source's.
	pub audio: Option<String>,
	pub hwaccel: HwAccel,
}

/// The decision, with everything downstream components need derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
	pub kind: RouteType,
	/// The delivery container, auto-promoted to fMP4 when the codecs
	/// cannot ride anything else.
	pub container: Container,
	/// The codecs the client will receive.
	pub variant: Variant,
	/// Encoder names, present only when transcoding.
	pub video_encoder: Option<String>,
	pub audio_encoder: Option<String>,
	/// Framing conversion for copied video.
	pub video_bsf: Option<BitstreamFilter>,
	/// Strip ADTS framing when muxing copied AAC into an MP4 family
	/// container (the `aac_adtstoasc` equivalent).
	pub strip_adts: bool,
}

/// Which encoder binaries the host actually has. Built once by the outer
/// application (e.g. from `ffmpeg -encoders`) so route decisions stay
/// reproducible.
#[derive(Debug, Clone, Default)]
pub struct EncoderInventory {
	/// None = everything is assumed present.
	available: Option<HashSet<String>>,
}

const HW_SUFFIXES: &[&str] = &["_nvenc", "_qsv", "_vaapi", "_videotoolbox", "_amf"];

impl EncoderInventory {
	/// Assume every encoder exists.
	pub fn all() -> Self {
		Self { available: None }
	}

	/// Only software encoders: what a host without acceleration offers.
	pub fn software_only() -> Self {
		Self {
			available: Some(HashSet::new()),
		}
	}

	pub fn with<I: IntoIterator<Item = String>>(names: I) -> Self {
		Self {
			available: Some(names.into_iter().collect()),
		}
	}

	pub fn has(&self, name: &str) -> bool {
		match &self.available {
			None => true,
			Some(set) => {
				set.contains(name) || !HW_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
			}
		}
	}
}

/// Decide the route.
pub fn decide(probe: &SourceProbe, profile: &TargetProfile, encoders: &EncoderInventory) -> Result<Route> {
	let source_video = probe.primary_video();
	let source_audio = probe.primary_audio();
	if source_video.is_none() && source_audio.is_none() {
		return Err(Error::NoStreams);
	}

	// Parse what the source actually carries; unknown stays None.
	let src_video_codec = source_video.and_then(|t| registry::parse_video(&t.codec));
	let src_audio_codec = source_audio.and_then(|t| registry::parse_audio(&t.codec));

	// Resolve the target families. An explicit target we can't parse is a
	// hard error; absent targets track the source.
	let want_video = match &profile.video {
		Some(name) => Some(
			registry::parse_video(name)
				.ok_or_else(|| Error::UnsupportedTarget(format!("unknown video codec {name:?}")))?,
		),
		None => None,
	};
	let want_audio = match &profile.audio {
		Some(name) => Some(
			registry::parse_audio(name)
				.ok_or_else(|| Error::UnsupportedTarget(format!("unknown audio codec {name:?}")))?,
		),
		None => None,
	};

	let video_matches = match (source_video, src_video_codec, want_video) {
		(None, _, _) => true, // nothing to deliver, nothing to mismatch
		(Some(_), None, _) => false, // unknown source codec fails closed
		(Some(_), Some(src), Some(want)) => src == want,
		(Some(_), Some(_), None) => true,
	};
	let audio_matches = match (source_audio, src_audio_codec, want_audio) {
		(None, _, _) => true,
		(Some(_), None, _) => false,
		(Some(_), Some(src), Some(want)) => src == want,
		(Some(_), Some(_), None) => true,
	};

	let source_container = source_container(&probe.container);

	// Rule 1: identical container and codec families, nothing to rewrite.
	if video_matches && audio_matches && source_container == Some(profile.container) {
		let variant = Variant {
			video: src_video_codec,
			audio: src_audio_codec,
		};
		return Ok(Route {
			kind: RouteType::Passthrough,
			container: profile.container,
			variant,
			video_encoder: None,
			audio_encoder: None,
			video_bsf: None,
			strip_adts: false,
		});
	}

	// Rule 2: codecs survive, only the container changes.
	let video_carriable = src_video_codec
		.map(|c| container_carries_video(profile.container, c) && c.is_demuxable())
		.unwrap_or(source_video.is_none());
	let audio_carriable = src_audio_codec
		.map(|c| container_carries_audio(profile.container, c) && c.is_demuxable())
		.unwrap_or(source_audio.is_none());

	if video_matches && audio_matches && video_carriable && audio_carriable {
		let variant = Variant {
			video: src_video_codec,
			audio: src_audio_codec,
		};

		let from_annexb = source_container.map(|c| c.requires_annex_b()).unwrap_or(false);
		let to_annexb = profile.container.requires_annex_b();
		let video_bsf = match (src_video_codec, from_annexb, to_annexb) {
			(Some(VideoCodec::H264 | VideoCodec::H265), true, false) => {
				Some(BitstreamFilter::AnnexBToAvcc)
			}
			(Some(VideoCodec::H264 | VideoCodec::H265), false, true) => {
				Some(BitstreamFilter::AvccToAnnexB)
			}
			_ => None,
		};

		let strip_adts = src_audio_codec == Some(AudioCodec::Aac)
			&& from_annexb
			&& (profile.container.is_mp4() || profile.container == Container::Flv);

		return Ok(Route {
			kind: RouteType::Repackage,
			container: profile.container,
			variant,
			video_encoder: None,
			audio_encoder: None,
			video_bsf,
			strip_adts,
		});
	}

	// Rule 3: transcode. Unknown source codecs land here too (fail closed).
	let out_video = match (source_video, want_video, src_video_codec) {
		(None, _, _) => None,
		// Re-encoding to the same family when only the container/codec pair
		// forced a transcode.
		(Some(_), Some(want), _) => Some(want),
		(Some(_), None, Some(src)) if src.encoder(HwAccel::None) != "" => Some(src),
		// Unknown or decode-only source with no explicit target: the
		// default delivery codec.
		(Some(_), None, _) => Some(VideoCodec::H264),
	};
	let out_audio = match (source_audio, want_audio, src_audio_codec) {
		(None, _, _) => None,
		(Some(_), Some(want), _) => Some(want),
		(Some(_), None, Some(src)) if src.encoder() != "" => Some(src),
		(Some(_), None, _) => Some(AudioCodec::Aac),
	};

	let variant = Variant {
		video: out_video,
		audio: out_audio,
	};

	// fMP4-only codecs pull the whole delivery over to fMP4.
	let container = if variant.requires_fmp4() && !profile.container.is_mp4() {
		Container::Fmp4
	} else {
		profile.container
	};

	let video_encoder = out_video
		.map(|codec| {
			let encoder = resolve_video_encoder(codec, profile.hwaccel, encoders);
			if encoder.is_empty() {
				return Err(Error::UnsupportedTarget(format!("no encoder for {codec}")));
			}
			Ok(encoder)
		})
		.transpose()?;
	let audio_encoder = out_audio
		.map(|codec| {
			let encoder = codec.encoder();
			if encoder.is_empty() {
				return Err(Error::UnsupportedTarget(format!("no encoder for {codec}")));
			}
			Ok(encoder.to_string())
		})
		.transpose()?;

	Ok(Route {
		kind: RouteType::Transcode,
		container,
		variant,
		video_encoder,
		audio_encoder,
		video_bsf: None,
		strip_adts: false,
	})
}

/// Pick the accelerated encoder when the host has it, software otherwise.
fn resolve_video_encoder(codec: VideoCodec, hwaccel: HwAccel, encoders: &EncoderInventory) -> String {
	let software = codec.encoder(HwAccel::None);

	let candidates: &[HwAccel] = match hwaccel {
		HwAccel::None => &[],
		HwAccel::Auto => &[HwAccel::Cuda, HwAccel::Qsv, HwAccel::Vaapi, HwAccel::VideoToolbox],
		HwAccel::Cuda => &[HwAccel::Cuda],
		HwAccel::Qsv => &[HwAccel::Qsv],
		HwAccel::Vaapi => &[HwAccel::Vaapi],
		HwAccel::VideoToolbox => &[HwAccel::VideoToolbox],
	};

	for accel in candidates {
		let name = codec.encoder(*accel);
		if name != software && encoders.has(name) {
			return name.to_string();
		}
	}
	software.to_string()
}

fn source_container(format_name: &str) -> Option<Container> {
	format_name.split(',').find_map(|name| match name.trim() {
		"mpegts" => Some(Container::MpegTs),
		"hls" | "applehttp" => Some(Container::Hls),
		"flv" => Some(Container::Flv),
		"mov" | "mp4" | "m4a" | "3gp" => Some(Container::Mp4),
		"matroska" => Some(Container::Matroska),
		"webm" => Some(Container::WebM),
		_ => None,
	})
}

/// What a container can carry without re-encoding.
fn container_carries_video(container: Container, codec: VideoCodec) -> bool {
	match container {
		Container::MpegTs | Container::Hls => codec.mpegts_stream_type() != 0,
		Container::Mp4 | Container::Fmp4 => !matches!(codec, VideoCodec::ProRes | VideoCodec::DnxHd),
		Container::Flv => codec == VideoCodec::H264,
		Container::Matroska => true,
		Container::WebM => matches!(codec, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1),
	}
}

fn container_carries_audio(container: Container, codec: AudioCodec) -> bool {
	match container {
		Container::MpegTs | Container::Hls => codec.mpegts_stream_type() != 0,
		Container::Mp4 | Container::Fmp4 => !matches!(codec, AudioCodec::Dts | AudioCodec::TrueHd),
		Container::Flv => matches!(codec, AudioCodec::Aac | AudioCodec::Mp3),
		Container::Matroska => true,
		Container::WebM => matches!(codec, AudioCodec::Opus | AudioCodec::Vorbis),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use beam_media::{Disposition, StreamKind, TrackInfo};

	fn track(index: usize, kind: StreamKind, codec: &str) -> TrackInfo {
		TrackInfo {
			index,
			kind,
			codec: codec.to_string(),
			profile: None,
			level: None,
			width: None,
			height: None,
			channels: None,
			sample_rate: None,
			language: None,
			disposition: Disposition::default(),
		}
	}

	fn ts_source(video: &str, audio: &str) -> SourceProbe {
		SourceProbe {
			container: "mpegts".to_string(),
			duration_secs: 0.0,
			live: true,
			tracks: vec![
				track(0, StreamKind::Video, video),
				track(1, StreamKind::Audio, audio),
			],
		}
	}

	fn profile(container: Container, video: Option<&str>, audio: Option<&str>) -> TargetProfile {
		TargetProfile {
			container,
			video: video.map(String::from),
			audio: audio.map(String::from),
			hwaccel: HwAccel::None,
		}
	}

	#[test]
	fn same_container_same_codecs_passes_through() {
		let route = decide(
			&ts_source("h264", "aac"),
			&profile(Container::MpegTs, Some("h264"), Some("aac")),
			&EncoderInventory::software_only(),
		)
		.unwrap();

		assert_eq!(route.kind, RouteType::Passthrough);
		assert_eq!(route.container, Container::MpegTs);
		assert!(route.video_encoder.is_none());
		assert!(route.video_bsf.is_none());
	}

	#[test]
	fn ts_to_fmp4_repackages_with_bsf_and_adts_strip() {
		let route = decide(
			&ts_source("h264", "aac"),
			&profile(Container::Fmp4, Some("h264"), Some("aac")),
			&EncoderInventory::software_only(),
		)
		.unwrap();

		assert_eq!(route.kind, RouteType::Repackage);
		assert_eq!(route.video_bsf, Some(BitstreamFilter::AnnexBToAvcc));
		assert!(route.strip_adts);
		assert!(route.video_encoder.is_none());
	}

	#[test]
	fn hevc_to_h264_transcodes_with_software_encoder() {
		let route = decide(
			&ts_source("hevc", "ac3"),
			&TargetProfile {
				container: Container::MpegTs,
				video: Some("h264".to_string()),
				audio: Some("aac".to_string()),
				hwaccel: HwAccel::Auto,
			},
			&EncoderInventory::software_only(),
		)
		.unwrap();

		assert_eq!(route.kind, RouteType::Transcode);
		assert_eq!(route.video_encoder.as_deref(), Some("libx264"));
		assert_eq!(route.audio_encoder.as_deref(), Some("aac"));
		assert!(route.video_bsf.is_none(), "no BSF when transcoding");
	}

	#[test]
	fn auto_uses_acceleration_when_available() {
		let inventory = EncoderInventory::with(["h264_nvenc".to_string()]);
		let route = decide(
			&ts_source("hevc", "aac"),
			&TargetProfile {
				container: Container::MpegTs,
				video: Some("h264".to_string()),
				audio: Some("aac".to_string()),
				hwaccel: HwAccel::Auto,
			},
			&inventory,
		)
		.unwrap();
		assert_eq!(route.video_encoder.as_deref(), Some("h264_nvenc"));
	}

	#[test]
	fn explicit_accel_falls_back_to_software() {
		let route = decide(
			&ts_source("hevc", "aac"),
			&TargetProfile {
				container: Container::MpegTs,
				video: Some("h264".to_string()),
				audio: None,
				hwaccel: HwAccel::Cuda,
			},
			&EncoderInventory::software_only(),
		)
		.unwrap();
		assert_eq!(route.video_encoder.as_deref(), Some("libx264"));
	}

	#[test]
	fn unknown_source_codec_fails_closed_into_transcode() {
		let route = decide(
			&ts_source("some_experimental_codec", "aac"),
			&profile(Container::MpegTs, None, None),
			&EncoderInventory::software_only(),
		)
		.unwrap();
		assert_eq!(route.kind, RouteType::Transcode);
		assert_eq!(route.variant.video, Some(VideoCodec::H264));
	}

	#[test]
	fn fmp4_only_codecs_promote_the_container() {
		let route = decide(
			&ts_source("h264", "aac"),
			&TargetProfile {
				container: Container::MpegTs,
				video: Some("av1".to_string()),
				audio: Some("opus".to_string()),
				hwaccel: HwAccel::None,
			},
			&EncoderInventory::software_only(),
		)
		.unwrap();
		assert_eq!(route.kind, RouteType::Transcode);
		assert_eq!(route.container, Container::Fmp4);
		assert_eq!(route.video_encoder.as_deref(), Some("libsvtav1"));
		assert_eq!(route.audio_encoder.as_deref(), Some("libopus"));
	}

	#[test]
	fn non_demuxable_audio_forces_transcode() {
		// DTS rides MPEG-TS but this engine will not demux it.
		let route = decide(
			&ts_source("h264", "dts"),
			&profile(Container::Fmp4, Some("h264"), None),
			&EncoderInventory::software_only(),
		)
		.unwrap();
		assert_eq!(route.kind, RouteType::Transcode);
	}

	#[test]
	fn unknown_target_codec_is_an_error() {
		let err = decide(
			&ts_source("h264", "aac"),
			&profile(Container::MpegTs, Some("wavelet9000"), None),
			&EncoderInventory::software_only(),
		)
		.unwrap_err();
		assert!(matches!(err, Error::UnsupportedTarget(_)));
	}

	#[test]
	fn decision_is_deterministic() {
		let probe = ts_source("hevc", "ac3");
		let target = TargetProfile {
			container: Container::Fmp4,
			video: Some("h264".to_string()),
			audio: Some("aac".to_string()),
			hwaccel: HwAccel::Auto,
		};
		let inventory = EncoderInventory::software_only();
		let first = decide(&probe, &target, &inventory).unwrap();
		for _ in 0..5 {
			assert_eq!(decide(&probe, &target, &inventory).unwrap(), first);
		}
	}
}
