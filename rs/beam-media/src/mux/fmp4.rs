//! Fragmented MP4 (CMAF) assembly: one init segment, then moof/mdat pairs.

use bytes::{Bytes, BytesMut};
use mp4_atom::{Atom, DecodeAtom, Encode};

use crate::adapt::{AudioConfig, VideoParams};
use crate::bitstream::{h264, h265};
use crate::model::{MuxSample, Timestamp};
use crate::registry::AudioCodec;
use crate::{Error, Result};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// The video timescale: PTS-derived samples keep their 90 kHz clock.
const VIDEO_TIMESCALE: u32 = 90_000;

/// Sample flags per ISO/IEC 14496-12 §8.8.3.1.
const FLAG_SYNC: u32 = 0x0200_0000; // sample_depends_on = no other
const FLAG_NON_SYNC: u32 = 0x0101_0000; // sample_depends_on = other + non-sync

/// Description of the video track going into the init segment.
#[derive(Clone)]
pub struct VideoTrack {
	pub params: VideoParams,
	pub width: u16,
	pub height: u16,
}

/// Description of the audio track going into the init segment.
#[derive(Clone)]
pub struct AudioTrack {
	pub config: AudioConfig,
	/// AudioSpecificConfig for AAC; None for Opus.
	pub description: Option<Bytes>,
}

/// Decode a hand-assembled configuration record into its mp4-atom form.
fn decode_atom<T: Atom + DecodeAtom>(payload: &[u8]) -> Result<T> {
	let header = mp4_atom::Header {
		kind: T::KIND,
		size: Some(payload.len()),
	};
	let mut cursor = std::io::Cursor::new(payload);
	Ok(T::decode_atom(&header, &mut cursor)?)
}

/// Stateful fMP4 writer for one variant.
///
/// [init_segment](Self::init_segment) must be delivered to a client before
/// any output of [write_segment](Self::write_segment); both are plain byte
/// blobs so they can be fanned out to any number of clients.
pub struct Fmp4Writer {
	video: Option<VideoTrack>,
	audio: Option<AudioTrack>,
	sequence: u32,
}

impl Fmp4Writer {
	pub fn new(video: Option<VideoTrack>, audio: Option<AudioTrack>) -> Result<Self> {
		if video.is_none() && audio.is_none() {
			return Err(Error::InvalidFmp4("no tracks"));
		}
		Ok(Self {
			video,
			audio,
			sequence: 0,
		})
	}

	fn audio_timescale(&self) -> u32 {
		self.audio.as_ref().map(|a| a.config.sample_rate).unwrap_or(VIDEO_TIMESCALE)
	}

	/// Build the `ftyp` + `moov` init segment from the cached parameter sets
	/// and track metadata.
	pub fn init_segment(&self) -> Result<Bytes> {
		let ftyp = mp4_atom::Ftyp {
			major_brand: b"iso6".into(),
			minor_version: 512,
			compatible_brands: vec![b"iso6".into(), b"cmfc".into(), b"mp41".into()],
		};

		let mut trak = Vec::new();
		let mut trex = Vec::new();

		if let Some(video) = &self.video {
			trak.push(self.video_trak(video)?);
			trex.push(mp4_atom::Trex {
				track_id: VIDEO_TRACK_ID,
				default_sample_description_index: 1,
				default_sample_duration: 0,
				default_sample_size: 0,
				default_sample_flags: 0,
			});
		}
		if let Some(audio) = &self.audio {
			trak.push(self.audio_trak(audio)?);
			trex.push(mp4_atom::Trex {
				track_id: AUDIO_TRACK_ID,
				default_sample_description_index: 1,
				default_sample_duration: 0,
				default_sample_size: 0,
				default_sample_flags: 0,
			});
		}

		let moov = mp4_atom::Moov {
			mvhd: mp4_atom::Mvhd {
				timescale: 1000,
				duration: 0,
				next_track_id: trak.len() as u32 + 1,
				..Default::default()
			},
			trak,
			mvex: Some(mp4_atom::Mvex {
				mehd: None,
				trex,
			}),
			..Default::default()
		};

		let mut out = BytesMut::new();
		ftyp.encode(&mut out)?;
		moov.encode(&mut out)?;
		Ok(out.freeze())
	}

	fn video_trak(&self, video: &VideoTrack) -> Result<mp4_atom::Trak> {
		let visual = mp4_atom::Visual {
			width: video.width,
			height: video.height,
			..Default::default()
		};

		let codec = match &video.params {
			VideoParams::Avc(sets) => {
				let sps = sets.sps.as_ref().ok_or(Error::MissingParameterSets("h264"))?;
				let pps = sets.pps.as_ref().ok_or(Error::MissingParameterSets("h264"))?;
				let avcc = decode_atom::<mp4_atom::Avcc>(&h264::build_avcc(sps, pps)?)?;
				mp4_atom::Codec::Avc1(mp4_atom::Avc1 {
					visual,
					avcc,
					..Default::default()
				})
			}
			VideoParams::Hevc(sets) => {
				let sps = sets.sps.as_ref().ok_or(Error::MissingParameterSets("h265"))?;
				let pps = sets.pps.as_ref().ok_or(Error::MissingParameterSets("h265"))?;
				let hvcc = decode_atom::<mp4_atom::Hvcc>(&h265::build_hvcc(
					sets.vps.as_deref(),
					sps,
					pps,
				)?)?;
				// hvc1: parameter sets live in the sample entry, which is
				// what the adapter guarantees for fMP4 output.
				mp4_atom::Codec::Hvc1(mp4_atom::Hvc1 {
					visual,
					hvcc,
					..Default::default()
				})
			}
			VideoParams::Av1(seq) => {
				let av1c = decode_atom::<mp4_atom::Av1c>(&build_av1c(seq)?)?;
				mp4_atom::Codec::Av01(mp4_atom::Av01 {
					visual,
					av1c,
					..Default::default()
				})
			}
			VideoParams::Vp9 => {
				// VP9 keyframes are self-describing; the vpcc carries the
				// common 8-bit 4:2:0 defaults.
				mp4_atom::Codec::Vp09(mp4_atom::Vp09 {
					visual,
					vpcc: mp4_atom::VpcC {
						profile: 0,
						level: 10,
						bit_depth: 8,
						chroma_subsampling: 1,
						video_full_range_flag: false,
						color_primaries: 1,
						transfer_characteristics: 1,
						matrix_coefficients: 1,
						..Default::default()
					},
					..Default::default()
				})
			}
		};

		Ok(mp4_atom::Trak {
			tkhd: mp4_atom::Tkhd {
				track_id: VIDEO_TRACK_ID,
				enabled: true,
				width: video.width.into(),
				height: video.height.into(),
				..Default::default()
			},
			mdia: mp4_atom::Mdia {
				mdhd: mp4_atom::Mdhd {
					timescale: VIDEO_TIMESCALE,
					language: "und".into(),
					..Default::default()
				},
				hdlr: mp4_atom::Hdlr {
					handler: b"vide".into(),
					name: "VideoHandler".into(),
				},
				minf: mp4_atom::Minf {
					vmhd: Some(mp4_atom::Vmhd::default()),
					smhd: None,
					nmhd: None,
					sthd: None,
					dinf: mp4_atom::Dinf::default(),
					stbl: mp4_atom::Stbl {
						stsd: mp4_atom::Stsd {
							codecs: vec![codec],
						},
						..Default::default()
					},
				},
			},
			edts: None,
			..Default::default()
		})
	}

	fn audio_trak(&self, audio: &AudioTrack) -> Result<mp4_atom::Trak> {
		let sample_entry = mp4_atom::Audio {
			data_reference_index: 0,
			channel_count: audio.config.channels as u16,
			sample_size: 16,
			sample_rate: (audio.config.sample_rate as u16).into(),
		};

		let codec = match audio.config.codec {
			AudioCodec::Aac => {
				let dec_specific = audio
					.description
					.as_ref()
					.ok_or(Error::MissingParameterSets("aac"))?;
				let esds = decode_atom::<mp4_atom::Esds>(&build_esds(dec_specific))?;
				mp4_atom::Codec::Mp4a(mp4_atom::Mp4a {
					audio: sample_entry,
					esds,
					btrt: None,
					taic: None,
				})
			}
			AudioCodec::Opus => mp4_atom::Codec::Opus(mp4_atom::Opus {
				audio: sample_entry,
				dops: mp4_atom::Dops {
					output_channel_count: audio.config.channels,
					pre_skip: 0,
					input_sample_rate: audio.config.sample_rate,
					output_gain: 0,
				},
				btrt: None,
			}),
			other => {
				return Err(Error::UnsupportedCodec {
					codec: other.id(),
					container: "fmp4",
				});
			}
		};

		Ok(mp4_atom::Trak {
			tkhd: mp4_atom::Tkhd {
				track_id: AUDIO_TRACK_ID,
				enabled: true,
				..Default::default()
			},
			mdia: mp4_atom::Mdia {
				mdhd: mp4_atom::Mdhd {
					timescale: audio.config.sample_rate,
					language: "und".into(),
					..Default::default()
				},
				hdlr: mp4_atom::Hdlr {
					handler: b"soun".into(),
					name: "SoundHandler".into(),
				},
				minf: mp4_atom::Minf {
					vmhd: None,
					smhd: Some(mp4_atom::Smhd::default()),
					nmhd: None,
					sthd: None,
					dinf: mp4_atom::Dinf::default(),
					stbl: mp4_atom::Stbl {
						stsd: mp4_atom::Stsd {
							codecs: vec![codec],
						},
						..Default::default()
					},
				},
			},
			edts: None,
			..Default::default()
		})
	}

	/// Assemble one `moof` + `mdat` media segment.
	///
	/// Video samples must begin with a sync sample; audio samples are free
	/// running. Either slice may be empty (audio-only sources, or audio
	/// segments between video keyframes).
	pub fn write_segment(&mut self, video: &[MuxSample], audio: &[MuxSample]) -> Result<Bytes> {
		if video.is_empty() && audio.is_empty() {
			return Err(Error::InvalidFmp4("empty segment"));
		}

		self.sequence += 1;

		let mut tracks: Vec<(u32, u32, &[MuxSample])> = Vec::new();
		if !video.is_empty() {
			tracks.push((VIDEO_TRACK_ID, VIDEO_TIMESCALE, video));
		}
		if !audio.is_empty() {
			tracks.push((AUDIO_TRACK_ID, self.audio_timescale(), audio));
		}

		// First pass with zeroed data offsets to learn the moof size.
		let moof = self.build_moof(&tracks, None)?;
		let mut probe = BytesMut::new();
		moof.encode(&mut probe)?;
		let moof_size = probe.len();

		// Sample data begins right after the mdat header.
		let mut data_offsets = Vec::with_capacity(tracks.len());
		let mut running = moof_size + 8;
		for (_, _, samples) in &tracks {
			data_offsets.push(running as i32);
			running += samples.iter().map(|s| s.payload.len()).sum::<usize>();
		}

		let moof = self.build_moof(&tracks, Some(&data_offsets))?;

		let mut mdat = BytesMut::new();
		for (_, _, samples) in &tracks {
			for sample in *samples {
				mdat.extend_from_slice(&sample.payload);
			}
		}

		let mut out = BytesMut::with_capacity(moof_size + mdat.len() + 8);
		moof.encode(&mut out)?;
		mp4_atom::Mdat {
			data: mdat.freeze().into(),
		}
		.encode(&mut out)?;
		Ok(out.freeze())
	}

	fn build_moof(
		&self,
		tracks: &[(u32, u32, &[MuxSample])],
		data_offsets: Option<&[i32]>,
	) -> Result<mp4_atom::Moof> {
		let mut traf = Vec::with_capacity(tracks.len());

		for (i, (track_id, timescale, samples)) in tracks.iter().enumerate() {
			let base_dts = samples.first().expect("non-empty track").dts;

			let entries = samples
				.iter()
				.map(|sample| {
					let cts = rescale_signed(sample.cts(), *timescale);
					mp4_atom::TrunEntry {
						duration: Some(rescale(sample.duration, *timescale) as u32),
						size: Some(sample.payload.len() as u32),
						flags: Some(if sample.keyframe { FLAG_SYNC } else { FLAG_NON_SYNC }),
						cts: Some(cts as i32),
					}
				})
				.collect();

			traf.push(mp4_atom::Traf {
				tfhd: mp4_atom::Tfhd {
					track_id: *track_id,
					..Default::default()
				},
				tfdt: Some(mp4_atom::Tfdt {
					base_media_decode_time: rescale(base_dts, *timescale),
				}),
				trun: vec![mp4_atom::Trun {
					data_offset: data_offsets.map(|offsets| offsets[i]),
					entries,
				}],
				..Default::default()
			});
		}

		Ok(mp4_atom::Moof {
			mfhd: mp4_atom::Mfhd {
				sequence_number: self.sequence,
			},
			traf,
		})
	}
}

fn rescale(ts: Timestamp, timescale: u32) -> u64 {
	ts.as_scale(timescale)
}

fn rescale_signed(ticks: i64, timescale: u32) -> i64 {
	ticks * timescale as i64 / 90_000
}

/// The AV1CodecConfigurationBox payload: a fixed four bytes of profile and
/// level pulled from the sequence header, then the raw configOBUs.
fn build_av1c(seq_obu: &Bytes) -> Result<Vec<u8>> {
	if seq_obu.len() < 4 {
		return Err(Error::MalformedSample("AV1 sequence header too short"));
	}
	let mut out = Vec::with_capacity(seq_obu.len() + 4);
	out.push(0x81); // marker + version 1
	// seq_profile (3) + seq_level_idx_0 (5); both live right after the OBU
	// header in the sequence header payload.
	out.push(seq_obu[2]);
	out.push(0); // tier/bitdepth/monochrome/subsampling defaults
	out.push(0); // initial_presentation_delay absent
	out.extend_from_slice(seq_obu);
	Ok(out)
}

/// The full esds box payload wrapping an AudioSpecificConfig, per ISO/IEC
/// 14496-1 §7.2.6.5 with the inline-length descriptor encoding.
fn build_esds(asc: &[u8]) -> Vec<u8> {
	let dec_specific_len = asc.len();
	let dec_config_len = 13 + 2 + dec_specific_len;
	let es_len = 3 + 2 + dec_config_len + 3;

	let mut out = Vec::with_capacity(es_len + 10);
	out.extend_from_slice(&[0, 0, 0, 0]); // version + flags
	out.push(0x03); // ES_DescrTag
	out.push(es_len as u8);
	out.extend_from_slice(&[0, 0]); // ES_ID
	out.push(0); // flags
	out.push(0x04); // DecoderConfigDescrTag
	out.push(dec_config_len as u8);
	out.push(0x40); // objectTypeIndication: MPEG-4 audio
	out.push(0x15); // streamType audio + upStream 0 + reserved
	out.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
	out.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
	out.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
	out.push(0x05); // DecSpecificInfoTag
	out.push(dec_specific_len as u8);
	out.extend_from_slice(asc);
	out.push(0x06); // SLConfigDescrTag
	out.push(0x01);
	out.push(0x02);
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::demux::Fmp4Demuxer;
	use crate::model::TrackKind;
	use bytes::BufMut;

	const SPS: &[u8] = &[
		0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40,
		0x00, 0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01,
	];
	const PPS: &[u8] = &[0x68, 0xee, 0x3c, 0x80];

	fn h264_writer() -> Fmp4Writer {
		let params = VideoParams::Avc(h264::ParameterSets {
			sps: Some(Bytes::from_static(SPS)),
			pps: Some(Bytes::from_static(PPS)),
		});
		Fmp4Writer::new(
			Some(VideoTrack {
				params,
				width: 1280,
				height: 720,
			}),
			Some(AudioTrack {
				config: AudioConfig {
					codec: AudioCodec::Aac,
					sample_rate: 48_000,
					channels: 2,
					object_type: 2,
				},
				description: Some(Bytes::from_static(&[0x11, 0x90])),
			}),
		)
		.unwrap()
	}

	fn avcc_sample(dts: u64, keyframe: bool) -> MuxSample {
		let mut payload = BytesMut::new();
		let nal: &[u8] = if keyframe { &[0x65, 0x88, 0x84] } else { &[0x41, 0x9a] };
		payload.put_u32(nal.len() as u32);
		payload.put_slice(nal);
		MuxSample {
			kind: TrackKind::Video,
			payload: payload.freeze(),
			pts: Timestamp::from_ticks(dts + 3600),
			dts: Timestamp::from_ticks(dts),
			duration: Timestamp::from_ticks(3600),
			keyframe,
		}
	}

	fn aac_sample(pts: u64) -> MuxSample {
		MuxSample {
			kind: TrackKind::Audio,
			payload: Bytes::from_static(&[0x21, 0x10, 0x05]),
			pts: Timestamp::from_ticks(pts),
			dts: Timestamp::from_ticks(pts),
			duration: Timestamp::from_ticks(1920),
			keyframe: true,
		}
	}

	#[test]
	fn init_segment_round_trips() {
		let writer = h264_writer();
		let init = writer.init_segment().unwrap();

		// ftyp first.
		assert_eq!(&init[4..8], b"ftyp");

		let mut demuxer = Fmp4Demuxer::new();
		let mut buf = BytesMut::from(&init[..]);
		demuxer.push(&mut buf);
		assert!(demuxer.next().unwrap().is_none());
		assert!(demuxer.is_initialized());
	}

	#[test]
	fn segments_round_trip_through_demuxer() {
		let mut writer = h264_writer();
		let init = writer.init_segment().unwrap();

		let video = [avcc_sample(0, true), avcc_sample(3600, false)];
		let audio = [aac_sample(0), aac_sample(1920)];
		let segment = writer.write_segment(&video, &audio).unwrap();

		let mut demuxer = Fmp4Demuxer::new();
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&init);
		buf.extend_from_slice(&segment);
		demuxer.push(&mut buf);

		let mut samples = Vec::new();
		while let Some(sample) = demuxer.next().unwrap() {
			samples.push(sample);
		}
		assert_eq!(samples.len(), 4);

		let videos: Vec<_> = samples.iter().filter(|s| s.kind == TrackKind::Video).collect();
		assert_eq!(videos.len(), 2);
		assert!(videos[0].keyframe);
		assert!(!videos[1].keyframe);
		assert_eq!(videos[0].payload, video[0].payload);
		assert_eq!(videos[1].dts.as_ticks(), 3600);
		// Composition offset survived.
		assert_eq!(videos[0].pts.as_ticks(), 3600);

		let audios: Vec<_> = samples.iter().filter(|s| s.kind == TrackKind::Audio).collect();
		assert_eq!(audios.len(), 2);
		assert_eq!(audios[1].pts.as_scale(48_000), 1024);
	}

	#[test]
	fn audio_only_init_is_valid() {
		let writer = Fmp4Writer::new(
			None,
			Some(AudioTrack {
				config: AudioConfig {
					codec: AudioCodec::Aac,
					sample_rate: 44_100,
					channels: 2,
					object_type: 2,
				},
				description: Some(Bytes::from_static(&[0x12, 0x10])),
			}),
		)
		.unwrap();

		let init = writer.init_segment().unwrap();
		let mut demuxer = Fmp4Demuxer::new();
		let mut buf = BytesMut::from(&init[..]);
		demuxer.push(&mut buf);
		assert!(demuxer.next().unwrap().is_none());
		assert!(demuxer.is_initialized());
	}

	#[test]
	fn back_to_back_keyframes_each_start_a_segment() {
		let mut writer = h264_writer();
		let first = writer.write_segment(&[avcc_sample(0, true)], &[]).unwrap();
		let second = writer.write_segment(&[avcc_sample(3600, true)], &[]).unwrap();

		let mut demuxer = Fmp4Demuxer::new();
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&writer.init_segment().unwrap());
		buf.extend_from_slice(&first);
		buf.extend_from_slice(&second);
		demuxer.push(&mut buf);

		let mut keyframes = 0;
		while let Some(sample) = demuxer.next().unwrap() {
			assert!(sample.keyframe);
			keyframes += 1;
		}
		assert_eq!(keyframes, 2);
	}

	#[test]
	fn empty_segment_is_rejected() {
		let mut writer = h264_writer();
		assert!(writer.write_segment(&[], &[]).is_err());
	}

	#[test]
	fn esds_descriptor_layout() {
		let esds = build_esds(&[0x11, 0x90]);
		assert_eq!(esds[4], 0x03); // ES descriptor
		let objtype_at = esds.iter().position(|&b| b == 0x40).unwrap();
		assert_eq!(esds[objtype_at + 1], 0x15);
	}
}
