//! MPEG-TS (ISO/IEC 13818-1) muxing from muxer-ready samples.

use bytes::{BufMut, Bytes, BytesMut};

use crate::model::{MuxSample, Timestamp, TrackKind};
use crate::registry::{AudioCodec, VideoCodec};
use crate::{Error, Result};

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Knobs for the TS muxer. The defaults follow common ffmpeg conventions:
/// elementary PIDs from 256, PMT at 4096.
#[derive(Debug, Clone)]
pub struct TsMuxerConfig {
	pub pmt_pid: u16,
	pub start_pid: u16,
	pub program_number: u16,
	/// Re-emit PAT/PMT every this many TS packets.
	pub psi_interval: u32,
	/// Minimum spacing between PCR stamps.
	pub pcr_interval: Timestamp,
}

impl Default for TsMuxerConfig {
	fn default() -> Self {
		Self {
			pmt_pid: 4096,
			start_pid: 256,
			program_number: 1,
			psi_interval: 40,
			pcr_interval: Timestamp::from_millis(40),
		}
	}
}

struct TsTrack {
	pid: u16,
	stream_type: u8,
	stream_id: u8,
	continuity: u8,
}

/// Packetizes muxer-ready samples into 188-byte transport stream packets.
///
/// Video payloads must already be Annex B with parameter sets inline on
/// keyframes (the adapter's `NalFormat::AnnexB` output); audio keeps its
/// ADTS framing. PTS/DTS are preserved as-is, wrapped to 33 bits on the
/// wire. PCR rides the video PID.
pub struct TsMuxer {
	config: TsMuxerConfig,
	video: Option<TsTrack>,
	audio: Option<TsTrack>,
	pat_continuity: u8,
	pmt_continuity: u8,
	packets_until_psi: u32,
	last_pcr: Option<Timestamp>,
}

impl TsMuxer {
	pub fn new(
		video: Option<VideoCodec>,
		audio: Option<AudioCodec>,
		config: TsMuxerConfig,
	) -> Result<Self> {
		let mut next_pid = config.start_pid;

		let video = video
			.map(|codec| {
				let stream_type = codec.mpegts_stream_type();
				if stream_type == 0 {
					return Err(Error::UnsupportedCodec {
						codec: codec.id(),
						container: "mpegts",
					});
				}
				let track = TsTrack {
					pid: next_pid,
					stream_type,
					stream_id: 0xE0,
					continuity: 0,
				};
				next_pid += 1;
				Ok(track)
			})
			.transpose()?;

		let audio = audio
			.map(|codec| {
				let stream_type = codec.mpegts_stream_type();
				if stream_type == 0 {
					return Err(Error::UnsupportedCodec {
						codec: codec.id(),
						container: "mpegts",
					});
				}
				let track = TsTrack {
					pid: next_pid,
					stream_type,
					stream_id: 0xC0,
					continuity: 0,
				};
				next_pid += 1;
				Ok(track)
			})
			.transpose()?;

		if video.is_none() && audio.is_none() {
			return Err(Error::UnsupportedCodec {
				codec: "none",
				container: "mpegts",
			});
		}

		Ok(Self {
			config,
			video,
			audio,
			pat_continuity: 0,
			pmt_continuity: 0,
			packets_until_psi: 0,
			last_pcr: None,
		})
	}

	/// The PID carrying the PCR: the video PID, or the audio PID for
	/// audio-only programs.
	fn pcr_pid(&self) -> u16 {
		self.video
			.as_ref()
			.or(self.audio.as_ref())
			.map(|t| t.pid)
			.expect("at least one track")
	}

	/// Packetize one sample, preceded by PAT/PMT when they are due.
	pub fn write(&mut self, sample: &MuxSample) -> Result<Bytes> {
		if sample.payload.len() < 2 {
			return Err(Error::MalformedSample("payload too short for PES"));
		}

		let mut out = BytesMut::new();

		if self.packets_until_psi == 0 {
			self.write_psi(&mut out);
		}

		let pcr_pid = self.pcr_pid();
		let track = match sample.kind {
			TrackKind::Video => self.video.as_mut(),
			TrackKind::Audio => self.audio.as_mut(),
		}
		.ok_or(Error::MalformedSample("sample for absent track"))?;

		let pcr_due = match self.last_pcr {
			Some(last) => sample.dts.saturating_sub(last) >= self.config.pcr_interval,
			None => true,
		};
		let pcr = (track.pid == pcr_pid && (pcr_due || sample.keyframe)).then(|| {
			self.last_pcr = Some(sample.dts);
			sample.dts
		});

		let pes = build_pes(track.stream_id, sample);
		let mut remaining = &pes[..];
		let mut first = true;

		while !remaining.is_empty() {
			let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);

			let flag_bits = if first && (sample.keyframe || pcr.is_some()) {
				Some((sample.keyframe, pcr))
			} else {
				None
			};

			// Adaptation overhead: length + flags, plus 6 bytes of PCR.
			let flags_len = match flag_bits {
				Some((_, Some(_))) => 8,
				Some((_, None)) => 2,
				None => 0,
			};

			let payload_space = TS_PACKET_SIZE - 4 - flags_len;
			let payload_len = payload_space.min(remaining.len());
			let has_adaptation = flags_len > 0 || payload_len < payload_space;

			let continuity = track.continuity;
			track.continuity = (track.continuity + 1) & 0x0F;

			packet.put_u8(SYNC_BYTE);
			let pusi = if first { 0x40 } else { 0x00 };
			packet.put_u8(pusi | ((track.pid >> 8) as u8 & 0x1F));
			packet.put_u8(track.pid as u8);
			let adaptation_bits = if has_adaptation { 0x30 } else { 0x10 };
			packet.put_u8(adaptation_bits | continuity);

			if has_adaptation {
				// adaptation_field_length excludes its own byte.
				let field_len = (TS_PACKET_SIZE - 4 - payload_len - 1) as u8;
				packet.put_u8(field_len);

				if field_len > 0 {
					let mut flags = 0u8;
					if let Some((keyframe, pcr)) = flag_bits {
						if keyframe {
							flags |= 0x40; // random access indicator
						}
						if pcr.is_some() {
							flags |= 0x10;
						}
					}
					packet.put_u8(flags);
					let mut stuffing_len = field_len as usize - 1;

					if let Some((_, Some(pcr))) = flag_bits {
						let base = pcr.as_wire();
						packet.put_u8((base >> 25) as u8);
						packet.put_u8((base >> 17) as u8);
						packet.put_u8((base >> 9) as u8);
						packet.put_u8((base >> 1) as u8);
						packet.put_u8(((base as u8 & 0x01) << 7) | 0x7E);
						packet.put_u8(0); // extension
						stuffing_len -= 6;
					}

					for _ in 0..stuffing_len {
						packet.put_u8(0xFF);
					}
				}
			}

			packet.put_slice(&remaining[..payload_len]);
			remaining = &remaining[payload_len..];
			first = false;

			debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
			out.extend_from_slice(&packet);
			self.packets_until_psi = self.packets_until_psi.saturating_sub(1);
		}

		Ok(out.freeze())
	}

	fn write_psi(&mut self, out: &mut BytesMut) {
		// PAT
		let mut section = BytesMut::new();
		section.put_u8(0x00); // table_id
		let mut body = BytesMut::new();
		body.put_u16(1); // transport_stream_id
		body.put_u8(0xC1); // version 0, current_next
		body.put_u8(0); // section_number
		body.put_u8(0); // last_section_number
		body.put_u16(self.config.program_number);
		body.put_u16(0xE000 | self.config.pmt_pid);
		section.put_u16(0xB000 | (body.len() as u16 + 4));
		section.put_slice(&body);
		let crc = crc32_mpeg2(&section);
		section.put_u32(crc);
		push_psi_packet(out, 0x0000, &section, &mut self.pat_continuity);

		// PMT
		let mut section = BytesMut::new();
		section.put_u8(0x02);
		let mut body = BytesMut::new();
		body.put_u16(self.config.program_number);
		body.put_u8(0xC1);
		body.put_u8(0);
		body.put_u8(0);
		body.put_u16(0xE000 | self.pcr_pid());
		body.put_u16(0xF000); // program_info_length = 0
		for track in [self.video.as_ref(), self.audio.as_ref()].into_iter().flatten() {
			body.put_u8(track.stream_type);
			body.put_u16(0xE000 | track.pid);
			body.put_u16(0xF000); // es_info_length = 0
		}
		section.put_u16(0xB000 | (body.len() as u16 + 4));
		section.put_slice(&body);
		let crc = crc32_mpeg2(&section);
		section.put_u32(crc);
		push_psi_packet(out, self.config.pmt_pid, &section, &mut self.pmt_continuity);

		self.packets_until_psi = self.config.psi_interval;
	}
}

/// Wrap a PSI section into a single stuffed TS packet.
fn push_psi_packet(out: &mut BytesMut, pid: u16, section: &[u8], continuity: &mut u8) {
	let mut packet = BytesMut::with_capacity(TS_PACKET_SIZE);
	packet.put_u8(SYNC_BYTE);
	packet.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
	packet.put_u8(pid as u8);
	packet.put_u8(0x10 | *continuity);
	*continuity = (*continuity + 1) & 0x0F;
	packet.put_u8(0); // pointer_field
	packet.put_slice(section);
	while packet.len() < TS_PACKET_SIZE {
		packet.put_u8(0xFF);
	}
	out.extend_from_slice(&packet);
}

/// Build the PES wrapper for one access unit.
fn build_pes(stream_id: u8, sample: &MuxSample) -> Bytes {
	let with_dts = sample.dts != sample.pts;
	let header_data_len: u8 = if with_dts { 10 } else { 5 };

	let mut pes = BytesMut::with_capacity(sample.payload.len() + 19);
	pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);

	// PES_packet_length: zero is allowed (and common) for video; audio
	// packets are small enough to carry the real length.
	let payload_len = sample.payload.len() + 3 + header_data_len as usize;
	if stream_id >= 0xE0 && payload_len > u16::MAX as usize {
		pes.put_u16(0);
	} else {
		pes.put_u16(payload_len.min(u16::MAX as usize) as u16);
	}

	pes.put_u8(0x80); // marker bits
	pes.put_u8(if with_dts { 0xC0 } else { 0x80 }); // PTS (+DTS) flags
	pes.put_u8(header_data_len);

	put_pes_timestamp(&mut pes, sample.pts, if with_dts { 0x30 } else { 0x20 });
	if with_dts {
		put_pes_timestamp(&mut pes, sample.dts, 0x10);
	}

	pes.put_slice(&sample.payload);
	pes.freeze()
}

fn put_pes_timestamp(pes: &mut BytesMut, ts: Timestamp, marker: u8) {
	let v = ts.as_wire();
	pes.put_u8(marker | (((v >> 30) as u8 & 0x07) << 1) | 0x01);
	pes.put_u8((v >> 22) as u8);
	pes.put_u8((((v >> 15) as u8 & 0x7F) << 1) | 0x01);
	pes.put_u8((v >> 7) as u8);
	pes.put_u8(((v as u8 & 0x7F) << 1) | 0x01);
}

/// CRC-32/MPEG-2: polynomial 0x04C11DB7, init all-ones, no reflection.
fn crc32_mpeg2(data: &[u8]) -> u32 {
	const TABLE: [u32; 256] = {
		let mut table = [0u32; 256];
		let mut i = 0;
		while i < 256 {
			let mut crc = (i as u32) << 24;
			let mut bit = 0;
			while bit < 8 {
				crc = if crc & 0x8000_0000 != 0 {
					(crc << 1) ^ 0x04C1_1DB7
				} else {
					crc << 1
				};
				bit += 1;
			}
			table[i] = crc;
			i += 1;
		}
		table
	};

	data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
		(crc << 8) ^ TABLE[(((crc >> 24) ^ byte as u32) & 0xFF) as usize]
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::demux::{TsDemuxer, TsEvent};
	use crate::model::TrackKind;

	const SPS: &[u8] = &[
		0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40,
		0x00, 0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01,
	];
	const PPS: &[u8] = &[0x68, 0xee, 0x3c, 0x80];

	fn annexb_au(units: &[&[u8]]) -> Bytes {
		let mut out = BytesMut::new();
		for unit in units {
			out.put_slice(&[0, 0, 0, 1]);
			out.put_slice(unit);
		}
		out.freeze()
	}

	fn video_sample(dts: u64, keyframe: bool, large: bool) -> MuxSample {
		let slice_data = vec![0xAB; if large { 600 } else { 16 }];
		let payload = if keyframe {
			annexb_au(&[SPS, PPS, &[&[0x65u8, 0x88][..], &slice_data].concat()])
		} else {
			annexb_au(&[&[&[0x41u8, 0x9a][..], &slice_data].concat()])
		};
		MuxSample {
			kind: TrackKind::Video,
			payload,
			pts: Timestamp::from_ticks(dts + 3600),
			dts: Timestamp::from_ticks(dts),
			duration: Timestamp::from_ticks(3600),
			keyframe,
		}
	}

	fn adts_sample(pts: u64) -> MuxSample {
		let payload = &[0xDE, 0xAD, 0xBE];
		let frame_len = 7 + payload.len();
		let mut data = vec![
			0xFF,
			0xF1,
			(1 << 6) | (3 << 2),
			(2 << 6) | ((frame_len >> 11) as u8 & 0x03),
			(frame_len >> 3) as u8,
			((frame_len as u8 & 0x07) << 5) | 0x1F,
			0xFC,
		];
		data.extend_from_slice(payload);
		MuxSample {
			kind: TrackKind::Audio,
			payload: Bytes::from(data),
			pts: Timestamp::from_ticks(pts),
			dts: Timestamp::from_ticks(pts),
			duration: Timestamp::from_ticks(1920),
			keyframe: true,
		}
	}

	fn mux_all(samples: &[MuxSample]) -> (BytesMut, TsMuxer) {
		let mut muxer = TsMuxer::new(
			Some(VideoCodec::H264),
			Some(AudioCodec::Aac),
			TsMuxerConfig::default(),
		)
		.unwrap();
		let mut out = BytesMut::new();
		for sample in samples {
			out.extend_from_slice(&muxer.write(sample).unwrap());
		}
		(out, muxer)
	}

	#[test]
	fn pat_and_pmt_come_first() {
		let (out, _) = mux_all(&[video_sample(0, true, false)]);
		assert_eq!(out[0], SYNC_BYTE);
		let pid0 = ((out[1] as u16 & 0x1F) << 8) | out[2] as u16;
		assert_eq!(pid0, 0);
		let pid1 = ((out[189] as u16 & 0x1F) << 8) | out[190] as u16;
		assert_eq!(pid1, 4096);
	}

	#[test]
	fn continuity_counters_increase_mod_16() {
		let samples: Vec<_> = (0..20).map(|i| video_sample(i * 3600, i == 0, true)).collect();
		let (out, _) = mux_all(&samples);

		let mut last: Option<u8> = None;
		for packet in out.chunks_exact(TS_PACKET_SIZE) {
			let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
			if pid != 256 {
				continue;
			}
			let cc = packet[3] & 0x0F;
			if let Some(prev) = last {
				assert_eq!(cc, (prev + 1) & 0x0F, "continuity must increase mod 16");
			}
			last = Some(cc);
		}
		assert!(last.is_some());
	}

	#[test]
	fn round_trips_through_demuxer() {
		let input = vec![
			video_sample(0, true, true),
			adts_sample(0),
			video_sample(3600, false, true),
			adts_sample(1920),
			video_sample(7200, false, false),
		];
		let (out, _) = mux_all(&input);

		let mut demuxer = TsDemuxer::new();
		let mut buf = out.clone();
		demuxer.push(&mut buf);

		let mut programs = None;
		let mut samples = Vec::new();
		while let Some(event) = demuxer.next().unwrap() {
			match event {
				TsEvent::Programs(p) => programs = Some(p),
				TsEvent::Sample(s) => samples.push(s),
				TsEvent::Discontinuity { .. } => panic!("unexpected discontinuity"),
			}
		}
		demuxer.flush();
		while let Some(event) = demuxer.next().unwrap() {
			if let TsEvent::Sample(s) = event {
				samples.push(s);
			}
		}

		let programs = programs.expect("PMT seen");
		assert_eq!(programs.len(), 2);
		assert_eq!(programs[0].stream_type, 0x1B);
		assert_eq!(programs[1].stream_type, 0x0F);

		let video: Vec<_> = samples.iter().filter(|s| s.kind == TrackKind::Video).collect();
		assert_eq!(video.len(), 3);
		assert!(video[0].keyframe);
		assert!(!video[1].keyframe);
		assert_eq!(video[0].payload, input[0].payload);
		assert_eq!(video[1].dts.as_ticks(), 3600);
		assert_eq!(video[1].pts.as_ticks(), 7200);

		let audio: Vec<_> = samples.iter().filter(|s| s.kind == TrackKind::Audio).collect();
		assert_eq!(audio.len(), 2);
		assert_eq!(audio[0].payload, input[1].payload);
	}

	#[test]
	fn dropped_packet_reports_discontinuity() {
		let input = vec![
			video_sample(0, true, true),
			video_sample(3600, false, true),
			video_sample(7200, false, true),
		];
		let (out, _) = mux_all(&input);

		// Remove one mid-stream video packet.
		let mut damaged = BytesMut::new();
		let mut dropped = false;
		for packet in out.chunks_exact(TS_PACKET_SIZE) {
			let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
			let pusi = packet[1] & 0x40 != 0;
			if !dropped && pid == 256 && !pusi {
				dropped = true;
				continue;
			}
			damaged.extend_from_slice(packet);
		}
		assert!(dropped);

		let mut demuxer = TsDemuxer::new();
		demuxer.push(&mut damaged);
		let mut discontinuities = 0;
		while let Some(event) = demuxer.next().unwrap() {
			if matches!(event, TsEvent::Discontinuity { pid: 256 }) {
				discontinuities += 1;
			}
		}
		assert_eq!(discontinuities, 1);
		assert_eq!(demuxer.stats().discontinuities, 1);
	}

	#[test]
	fn unsupported_codec_is_rejected() {
		assert!(TsMuxer::new(Some(VideoCodec::Vp9), None, TsMuxerConfig::default()).is_err());
		assert!(TsMuxer::new(None, Some(AudioCodec::Opus), TsMuxerConfig::default()).is_err());
		assert!(TsMuxer::new(None, None, TsMuxerConfig::default()).is_err());
	}

	#[test]
	fn crc_matches_known_vector() {
		// CRC-32/MPEG-2 of "123456789".
		assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
	}
}
