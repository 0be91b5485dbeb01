//! The sample adapter: tracks codec parameter sets per variant and converts
//! demuxed samples into muxer-ready form.
//!
//! Every fMP4 sync sample leaving this module can be decoded standalone
//! given the most recent init segment: keyframes that arrive without their
//! parameter sets get the cached ones prepended first.

use bytes::{Bytes, BytesMut};

use crate::bitstream::adts::{self, AdtsHeader, AdtsIter, SAMPLES_PER_FRAME};
use crate::bitstream::{annexb, av1, h264, h265};
use crate::model::{MuxSample, Sample, Timestamp, TrackKind};
use crate::registry::{AudioCodec, VideoCodec};
use crate::{Error, Result};

/// Which NAL framing the target container needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalFormat {
	/// Start codes, parameter sets inline on keyframes (MPEG-TS, HLS/TS).
	AnnexB,
	/// 4-byte length prefixes, parameter sets in the init segment (fMP4).
	Avcc,
}

/// Cached codec configuration for a video track.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoParams {
	Avc(h264::ParameterSets),
	Hevc(h265::ParameterSets),
	/// The raw sequence header OBU.
	Av1(Bytes),
	/// VP9 needs no out-of-band configuration.
	Vp9,
}

/// Per-variant video parameter-set state.
///
/// The first consistent set is locked for the session; real streams
/// occasionally change parameters mid-stream (resolution switches), which is
/// ignored until [unlock](Self::unlock) to avoid corrupting decoders
/// mid-GOP.
pub struct VideoAdapter {
	codec: VideoCodec,
	params: Option<VideoParams>,
	locked: bool,
	/// Fallback duration when dts deltas are unavailable (90 kHz ticks).
	default_duration: Timestamp,
	last_dts: Option<Timestamp>,
}

impl VideoAdapter {
	pub fn new(codec: VideoCodec) -> Self {
		Self {
			codec,
			params: None,
			locked: false,
			default_duration: Timestamp::from_ticks(3600), // 25 fps until measured
			last_dts: None,
		}
	}

	pub fn codec(&self) -> VideoCodec {
		self.codec
	}

	pub fn params(&self) -> Option<&VideoParams> {
		self.params.as_ref()
	}

	pub fn is_ready(&self) -> bool {
		match &self.params {
			Some(VideoParams::Avc(sets)) => sets.is_complete(),
			Some(VideoParams::Hevc(sets)) => sets.is_complete(),
			Some(VideoParams::Av1(_)) | Some(VideoParams::Vp9) => true,
			// Only parameter-set codecs hold delivery back; everything else
			// is decodable from the samples alone.
			None => !matches!(self.codec, VideoCodec::H264 | VideoCodec::H265 | VideoCodec::Av1),
		}
	}

	/// Accept a new parameter set on the next keyframe that carries one.
	pub fn unlock(&mut self) {
		self.locked = false;
	}

	/// Inspect samples for parameter sets. Returns true when the cached
	/// configuration changed.
	pub fn update(&mut self, samples: &[Sample]) -> Result<bool> {
		let mut changed = false;
		for sample in samples {
			if sample.kind != TrackKind::Video {
				continue;
			}
			let new = match self.codec {
				VideoCodec::H264 => {
					let sets = h264::extract_parameter_sets(&sample.payload)?;
					sets.is_complete().then_some(VideoParams::Avc(sets))
				}
				VideoCodec::H265 => {
					let sets = h265::extract_parameter_sets(&sample.payload)?;
					sets.is_complete().then_some(VideoParams::Hevc(sets))
				}
				VideoCodec::Av1 => av1::extract_sequence_header(&sample.payload)?.map(VideoParams::Av1),
				VideoCodec::Vp9 => Some(VideoParams::Vp9),
				_ => None,
			};

			let Some(new) = new else { continue };
			match &self.params {
				None => {
					tracing::debug!(codec = %self.codec, "locked video parameter sets");
					self.params = Some(new);
					self.locked = true;
					changed = true;
				}
				Some(old) if !self.locked && old != &new && sample.keyframe => {
					tracing::info!(codec = %self.codec, "video parameter sets changed");
					self.params = Some(new);
					self.locked = true;
					changed = true;
				}
				_ => {}
			}
		}
		Ok(changed)
	}

	/// Convert demuxed video samples into muxer-ready form.
	pub fn convert(&mut self, samples: &[Sample], format: NalFormat) -> Result<Vec<MuxSample>> {
		let mut out = Vec::with_capacity(samples.len());

		for (i, sample) in samples.iter().enumerate() {
			if sample.payload.len() < 2 {
				return Err(Error::MalformedSample("video payload too short"));
			}

			let payload = match self.codec {
				VideoCodec::H264 | VideoCodec::H265 => {
					let annexb = self.repair_keyframe(sample)?;
					match format {
						NalFormat::AnnexB => annexb,
						NalFormat::Avcc => annexb::annex_b_to_avcc(&annexb)?,
					}
				}
				// AV1 and VP9 frames are already container-agnostic.
				_ => sample.payload.clone(),
			};

			// Durations from dts deltas within the batch; the last sample
			// reuses the previous delta.
			let duration = samples
				.get(i + 1)
				.map(|next| next.dts.saturating_sub(sample.dts))
				.filter(|d| !d.is_zero())
				.unwrap_or(self.default_duration);
			self.default_duration = duration;
			self.last_dts = Some(sample.dts);

			out.push(MuxSample {
				kind: TrackKind::Video,
				payload,
				pts: sample.pts,
				dts: sample.dts,
				duration,
				keyframe: sample.keyframe,
			});
		}

		Ok(out)
	}

	/// Ensure a keyframe access unit carries its parameter sets in-band.
	/// Present sets are left alone so the repair stays idempotent.
	fn repair_keyframe(&self, sample: &Sample) -> Result<Bytes> {
		if !sample.keyframe {
			return Ok(sample.payload.clone());
		}

		let has_sps = match self.codec {
			VideoCodec::H264 => h264::contains_sps(&sample.payload),
			VideoCodec::H265 => h265::contains_sps(&sample.payload),
			_ => true,
		};
		if has_sps {
			return Ok(sample.payload.clone());
		}

		let mut prefix = BytesMut::new();
		match &self.params {
			Some(VideoParams::Avc(sets)) => {
				let sps = sets.sps.as_ref().ok_or(Error::MissingParameterSets("h264"))?;
				let pps = sets.pps.as_ref().ok_or(Error::MissingParameterSets("h264"))?;
				prefix.extend_from_slice(&annexb::prefix_start_code(sps));
				prefix.extend_from_slice(&annexb::prefix_start_code(pps));
			}
			Some(VideoParams::Hevc(sets)) => {
				if let Some(vps) = &sets.vps {
					prefix.extend_from_slice(&annexb::prefix_start_code(vps));
				}
				let sps = sets.sps.as_ref().ok_or(Error::MissingParameterSets("h265"))?;
				let pps = sets.pps.as_ref().ok_or(Error::MissingParameterSets("h265"))?;
				prefix.extend_from_slice(&annexb::prefix_start_code(sps));
				prefix.extend_from_slice(&annexb::prefix_start_code(pps));
			}
			_ => return Err(Error::MissingParameterSets(self.codec.id())),
		}

		prefix.extend_from_slice(&sample.payload);
		Ok(prefix.freeze())
	}
}

/// Audio configuration the muxers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
	pub codec: AudioCodec,
	pub sample_rate: u32,
	pub channels: u8,
	/// MPEG-4 audio object type, for the esds box (AAC only).
	pub object_type: u8,
}

/// Per-variant audio state: ADTS configuration detection and header
/// stripping for AAC, pass-through for everything else.
pub struct AudioAdapter {
	codec: AudioCodec,
	config: Option<AudioConfig>,
}

impl AudioAdapter {
	pub fn new(codec: AudioCodec) -> Self {
		Self { codec, config: None }
	}

	/// For streams whose configuration cannot be derived from samples
	/// (non-ADTS codecs, or AAC already stripped by an MP4 container), the
	/// route decider supplies it out-of-band from the probe.
	pub fn with_config(codec: AudioCodec, sample_rate: u32, channels: u8) -> Self {
		Self {
			codec,
			config: Some(AudioConfig {
				codec,
				sample_rate,
				channels,
				// AAC-LC unless an ADTS header corrects it later.
				object_type: if codec == AudioCodec::Aac { 2 } else { 0 },
			}),
		}
	}

	pub fn codec(&self) -> AudioCodec {
		self.codec
	}

	pub fn config(&self) -> Option<AudioConfig> {
		self.config
	}

	pub fn is_ready(&self) -> bool {
		self.config.is_some()
	}

	/// The AudioSpecificConfig bytes for the esds box, when known.
	pub fn audio_specific_config(&self) -> Option<Bytes> {
		let config = self.config?;
		if self.codec != AudioCodec::Aac {
			return None;
		}
		let header = AdtsHeader {
			object_type: config.object_type,
			sample_rate_index: adts_sample_rate_index(config.sample_rate)?,
			sample_rate: config.sample_rate,
			channel_config: config.channels,
			header_len: 7,
			frame_len: 0,
		};
		Some(header.audio_specific_config())
	}

	/// Inspect samples for codec configuration. Returns true when the
	/// configuration was learned or changed.
	///
	/// Unknown audio stays unknown: a failed ADTS parse never falls back to
	/// assuming AAC, it just leaves the adapter not ready.
	pub fn update(&mut self, samples: &[Sample]) -> bool {
		if self.codec != AudioCodec::Aac {
			return false;
		}

		for sample in samples {
			if sample.kind != TrackKind::Audio {
				continue;
			}
			let Ok(header) = AdtsHeader::parse(&sample.payload) else { continue };
			let config = AudioConfig {
				codec: self.codec,
				sample_rate: header.sample_rate,
				channels: header.channel_config,
				object_type: header.object_type,
			};
			if self.config != Some(config) {
				tracing::debug!(
					sample_rate = config.sample_rate,
					channels = config.channels,
					"locked audio configuration"
				);
				self.config = Some(config);
				return true;
			}
		}
		false
	}

	/// Convert demuxed audio into muxer-ready samples.
	///
	/// For AAC a single PES payload may carry several ADTS frames; each
	/// becomes its own sample with the default frame duration of 1024
	/// samples at the stream's rate. `strip_adts` is set for MP4-family
	/// targets and clear for MPEG-TS.
	pub fn convert(&mut self, samples: &[Sample], strip_adts: bool) -> Result<Vec<MuxSample>> {
		let mut out = Vec::with_capacity(samples.len());

		for sample in samples {
			if sample.payload.is_empty() {
				return Err(Error::MalformedSample("empty audio payload"));
			}

			if self.codec == AudioCodec::Aac && strip_adts && adts::is_adts(&sample.payload) {
				let mut pts = sample.pts;
				for frame in AdtsIter::new(sample.payload.clone()) {
					let frame = frame?;
					let duration =
						Timestamp::from_scale(SAMPLES_PER_FRAME as u64, frame.header.sample_rate);
					out.push(MuxSample {
						kind: TrackKind::Audio,
						payload: frame.payload,
						pts,
						dts: pts,
						duration,
						keyframe: true,
					});
					pts = pts + duration;
				}
				continue;
			}

			let duration = sample.duration.unwrap_or_else(|| {
				let rate = self.config.map(|c| c.sample_rate).unwrap_or(48_000);
				Timestamp::from_scale(SAMPLES_PER_FRAME as u64, rate)
			});
			out.push(MuxSample {
				kind: TrackKind::Audio,
				payload: sample.payload.clone(),
				pts: sample.pts,
				dts: sample.dts,
				duration,
				keyframe: true,
			});
		}

		Ok(out)
	}
}

fn adts_sample_rate_index(rate: u32) -> Option<u8> {
	[
		96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
		8_000, 7_350,
	]
	.iter()
	.position(|&r| r == rate)
	.map(|i| i as u8)
}
