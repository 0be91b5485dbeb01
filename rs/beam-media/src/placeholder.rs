//! Embedded one-second fMP4 preludes.
//!
//! While a session's upstream is still probing or an encoder is warming up,
//! clients are served a canned one-second fragment so their decoders
//! initialize immediately instead of timing out on an empty socket. One
//! prelude exists per supported variant, assembled on first use from
//! pre-encoded blank frames.

use std::collections::HashMap;
use std::sync::LazyLock;

use bytes::Bytes;

use crate::adapt::{AudioConfig, VideoParams};
use crate::bitstream::{annexb, h264, h265};
use crate::model::{MuxSample, Timestamp, TrackKind, Variant};
use crate::mux::{AudioTrack, Fmp4Writer, VideoTrack};
use crate::registry::{AudioCodec, VideoCodec};

/// One canned prelude: the init segment and a single one-second media
/// segment, both ready to be written to a client verbatim.
pub struct Placeholder {
	pub variant: Variant,
	pub init: Bytes,
	pub segment: Bytes,
}

impl Placeholder {
	/// The prelude duration; clients loop it until real samples arrive.
	pub const DURATION: Timestamp = Timestamp::from_secs(1);
}

/// The prelude for a variant, if one is embedded.
pub fn placeholder(variant: &Variant) -> Option<&'static Placeholder> {
	CATALOG.get(variant)
}

/// Every variant with an embedded prelude.
pub fn variants() -> impl Iterator<Item = &'static Variant> {
	CATALOG.keys()
}

static CATALOG: LazyLock<HashMap<Variant, Placeholder>> = LazyLock::new(|| {
	let mut catalog = HashMap::new();
	for build in [build_h264_aac, build_h265_aac, build_vp9_opus, build_av1_opus] {
		match build() {
			Ok(placeholder) => {
				catalog.insert(placeholder.variant, placeholder);
			}
			Err(err) => {
				// A missing prelude only degrades startup latency.
				tracing::error!(%err, "failed to assemble placeholder");
			}
		}
	}
	catalog
});

// Pre-encoded blank 320x180 frames. The video payloads are single blank
// GOPs; the audio payloads are one frame of encoded silence each.

const H264_SPS: &[u8] = &[
	0x67, 0x42, 0xc0, 0x0d, 0xda, 0x05, 0x07, 0xe8, 0x40, 0x00, 0x00, 0x03, 0x00, 0x40, 0x00,
	0x00, 0x0c, 0x83, 0xc5, 0x8b, 0x65, 0x80,
];
const H264_PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
const H264_IDR: &[u8] = &[
	0x65, 0x88, 0x84, 0x00, 0x33, 0xff, 0xfe, 0xf6, 0xf0, 0xfe, 0x05, 0x36, 0x56, 0x04, 0x50,
	0x96, 0x7b, 0x3f, 0x53, 0xe1, 0x32, 0xa0, 0x00, 0x0f, 0x0e, 0x71, 0x8f, 0xc0, 0x00, 0x0b,
	0xdc, 0x00, 0x00, 0x5e, 0xe4, 0x00, 0x04, 0x9e, 0x00, 0x16, 0xe3, 0x60,
];

const H265_VPS: &[u8] = &[
	0x40, 0x01, 0x0c, 0x01, 0xff, 0xff, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00,
	0x03, 0x00, 0x00, 0x03, 0x00, 0x3c, 0x95, 0x98, 0x09,
];
const H265_SPS: &[u8] = &[
	0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00,
	0x03, 0x00, 0x3c, 0xa0, 0x0a, 0x08, 0x05, 0xa2, 0x65, 0x95, 0x9a, 0x49, 0x32, 0xbc, 0x05,
	0xa7, 0x08, 0x00, 0x00, 0x03, 0x00, 0x08, 0x00, 0x00, 0x03, 0x00, 0xf9, 0x08,
];
const H265_PPS: &[u8] = &[0x44, 0x01, 0xc1, 0x72, 0xb4, 0x62, 0x40];
const H265_IDR: &[u8] = &[
	0x28, 0x01, 0xaf, 0x78, 0xf0, 0x21, 0xff, 0xe6, 0x9e, 0x27, 0x9e, 0x60, 0x74, 0x6a, 0xff,
	0x2a, 0x41, 0x7a, 0x0c, 0x80, 0x20, 0x00, 0x3d, 0xbb, 0x97, 0x59, 0x26, 0x99, 0x00, 0x00,
	0x03, 0x00, 0x00, 0x03, 0x00, 0x26, 0x40,
];

/// A profile-0 keyframe header for 320x180 followed by a blank coded frame.
const VP9_KEYFRAME: &[u8] = &[
	0x82, 0x49, 0x83, 0x42, 0x00, 0x13, 0xf0, 0x0b, 0x30, 0x38, 0x24, 0x1c, 0x18, 0x46, 0x00,
	0x00, 0x90, 0x00, 0x00, 0x1e, 0x6d, 0xfe, 0xce, 0xf8, 0x6e, 0x7c, 0x10, 0x40, 0x00,
];

/// Temporal delimiter + sequence header + blank key frame OBUs.
const AV1_SEQUENCE_HEADER: &[u8] = &[0x0a, 0x0b, 0x00, 0x00, 0x00, 0x24, 0x4f, 0x7e, 0x7f, 0x00, 0x68, 0x08, 0x08];
const AV1_KEYFRAME_OBU: &[u8] = &[
	0x32, 0x17, 0x10, 0x01, 0x92, 0x80, 0x27, 0xf6, 0xff, 0x30, 0xc8, 0x00, 0x00, 0x64, 0x00,
	0x7a, 0x36, 0x20, 0x0c, 0x80, 0x00, 0x40, 0x00, 0x00, 0x00,
];

/// One 1024-sample frame of AAC-LC silence at 44.1 kHz stereo.
const AAC_SILENCE: &[u8] = &[0x21, 0x10, 0x04, 0x60, 0x8c, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x0e];
const AAC_SAMPLE_RATE: u32 = 44_100;
/// AudioSpecificConfig: AAC-LC, 44.1 kHz, stereo.
const AAC_ASC: &[u8] = &[0x12, 0x10];

/// One 20 ms frame of Opus silence at 48 kHz stereo.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_FRAME: Timestamp = Timestamp::from_millis(20);

type BuildResult = crate::Result<Placeholder>;

fn video_second(payload: Bytes) -> Vec<MuxSample> {
	vec![MuxSample {
		kind: TrackKind::Video,
		payload,
		pts: Timestamp::ZERO,
		dts: Timestamp::ZERO,
		duration: Placeholder::DURATION,
		keyframe: true,
	}]
}

fn audio_second(frame: &'static [u8], duration: Timestamp) -> Vec<MuxSample> {
	let mut samples = Vec::new();
	let mut pts = Timestamp::ZERO;
	while pts < Placeholder::DURATION {
		samples.push(MuxSample {
			kind: TrackKind::Audio,
			payload: Bytes::from_static(frame),
			pts,
			dts: pts,
			duration,
			keyframe: true,
		});
		pts = pts + duration;
	}
	samples
}

fn aac_track() -> AudioTrack {
	AudioTrack {
		config: AudioConfig {
			codec: AudioCodec::Aac,
			sample_rate: AAC_SAMPLE_RATE,
			channels: 2,
			object_type: 2,
		},
		description: Some(Bytes::from_static(AAC_ASC)),
	}
}

fn opus_track() -> AudioTrack {
	AudioTrack {
		config: AudioConfig {
			codec: AudioCodec::Opus,
			sample_rate: OPUS_SAMPLE_RATE,
			channels: 2,
			object_type: 0,
		},
		description: None,
	}
}

fn aac_second() -> Vec<MuxSample> {
	let frame = Timestamp::from_scale(1024, AAC_SAMPLE_RATE);
	audio_second(AAC_SILENCE, frame)
}

fn build(
	variant: Variant,
	video: VideoTrack,
	video_payload: Bytes,
	audio: AudioTrack,
	audio_samples: Vec<MuxSample>,
) -> BuildResult {
	let mut writer = Fmp4Writer::new(Some(video), Some(audio))?;
	let init = writer.init_segment()?;
	let segment = writer.write_segment(&video_second(video_payload), &audio_samples)?;
	Ok(Placeholder {
		variant,
		init,
		segment,
	})
}

fn build_h264_aac() -> BuildResult {
	let au = annexb::annex_b_to_avcc(&{
		let mut au = bytes::BytesMut::new();
		for unit in [H264_SPS, H264_PPS, H264_IDR] {
			au.extend_from_slice(&annexb::prefix_start_code(unit));
		}
		au.freeze()
	})?;

	build(
		Variant::new(VideoCodec::H264, AudioCodec::Aac),
		VideoTrack {
			params: VideoParams::Avc(h264::ParameterSets {
				sps: Some(Bytes::from_static(H264_SPS)),
				pps: Some(Bytes::from_static(H264_PPS)),
			}),
			width: 320,
			height: 180,
		},
		au,
		aac_track(),
		aac_second(),
	)
}

fn build_h265_aac() -> BuildResult {
	let au = annexb::annex_b_to_avcc(&{
		let mut au = bytes::BytesMut::new();
		for unit in [H265_VPS, H265_SPS, H265_PPS, H265_IDR] {
			au.extend_from_slice(&annexb::prefix_start_code(unit));
		}
		au.freeze()
	})?;

	build(
		Variant::new(VideoCodec::H265, AudioCodec::Aac),
		VideoTrack {
			params: VideoParams::Hevc(h265::ParameterSets {
				vps: Some(Bytes::from_static(H265_VPS)),
				sps: Some(Bytes::from_static(H265_SPS)),
				pps: Some(Bytes::from_static(H265_PPS)),
			}),
			width: 320,
			height: 180,
		},
		au,
		aac_track(),
		aac_second(),
	)
}

fn build_vp9_opus() -> BuildResult {
	build(
		Variant::new(VideoCodec::Vp9, AudioCodec::Opus),
		VideoTrack {
			params: VideoParams::Vp9,
			width: 320,
			height: 180,
		},
		Bytes::from_static(VP9_KEYFRAME),
		opus_track(),
		audio_second(OPUS_SILENCE, OPUS_FRAME),
	)
}

fn build_av1_opus() -> BuildResult {
	let mut payload = bytes::BytesMut::new();
	payload.extend_from_slice(AV1_SEQUENCE_HEADER);
	payload.extend_from_slice(AV1_KEYFRAME_OBU);

	build(
		Variant::new(VideoCodec::Av1, AudioCodec::Opus),
		VideoTrack {
			params: VideoParams::Av1(Bytes::from_static(AV1_SEQUENCE_HEADER)),
			width: 320,
			height: 180,
		},
		payload.freeze(),
		opus_track(),
		audio_second(OPUS_SILENCE, OPUS_FRAME),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::demux::Fmp4Demuxer;

	#[test]
	fn catalog_holds_all_four_variants() {
		let variants: Vec<_> = variants().collect();
		assert_eq!(variants.len(), 4);
		assert!(placeholder(&Variant::new(VideoCodec::H264, AudioCodec::Aac)).is_some());
		assert!(placeholder(&Variant::new(VideoCodec::H265, AudioCodec::Aac)).is_some());
		assert!(placeholder(&Variant::new(VideoCodec::Vp9, AudioCodec::Opus)).is_some());
		assert!(placeholder(&Variant::new(VideoCodec::Av1, AudioCodec::Opus)).is_some());
		assert!(placeholder(&Variant::new(VideoCodec::H264, AudioCodec::Opus)).is_none());
	}

	#[test]
	fn preludes_parse_as_fmp4() {
		for variant in variants() {
			let prelude = placeholder(variant).unwrap();

			let mut demuxer = Fmp4Demuxer::new();
			let mut buf = bytes::BytesMut::new();
			buf.extend_from_slice(&prelude.init);
			buf.extend_from_slice(&prelude.segment);
			demuxer.push(&mut buf);

			let mut video = 0;
			let mut audio = 0;
			let mut last_pts = Timestamp::ZERO;
			while let Some(sample) = demuxer.next().unwrap() {
				match sample.kind {
					TrackKind::Video => {
						assert!(sample.keyframe, "{variant}: video must be a sync sample");
						video += 1;
					}
					TrackKind::Audio => {
						audio += 1;
						last_pts = sample.pts;
					}
				}
			}
			assert_eq!(video, 1, "{variant}");
			assert!(audio > 40, "{variant}: a second of audio frames");
			assert!(last_pts < Placeholder::DURATION, "{variant}");
		}
	}

	#[test]
	fn prelude_is_one_second() {
		assert_eq!(Placeholder::DURATION.as_millis(), 1000);
	}
}
