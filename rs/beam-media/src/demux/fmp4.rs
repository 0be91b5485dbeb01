//! Fragmented MP4 demuxing to elementary samples.
//!
//! The transcoder emits fMP4 when the target codecs cannot ride in MPEG-TS;
//! this parser turns its stdout back into samples for the variant buffer.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use mp4_atom::{Any, Atom, DecodeAtom, DecodeMaybe, Header, Mdat, Moof, Moov};

use crate::model::{CodecHint, Sample, Timestamp, TrackKind};
use crate::registry::{AudioCodec, VideoCodec};
use crate::{Error, Result};

/// An atom pulled out of the byte stream.
enum AtomEvent {
	Atom(Any),
	Mdat(Bytes, usize), // payload and header size
}

/// Accumulates bytes until whole atoms are available.
///
/// `mdat` payloads are sliced out without going through the atom decoder so
/// sample data is never copied.
struct AtomReader {
	buffer: BytesMut,
}

impl AtomReader {
	fn new() -> Self {
		Self { buffer: BytesMut::new() }
	}

	fn push<B: Buf>(&mut self, buf: &mut B) {
		while buf.has_remaining() {
			let chunk = buf.chunk();
			self.buffer.extend_from_slice(chunk);
			let len = chunk.len();
			buf.advance(len);
		}
	}

	fn next(&mut self) -> Result<Option<(AtomEvent, usize)>> {
		if self.buffer.is_empty() {
			return Ok(None);
		}

		let mut cursor = std::io::Cursor::new(&self.buffer[..]);
		let header = match Header::decode_maybe(&mut cursor)? {
			Some(header) => header,
			None => return Ok(None), // need more data for the header
		};
		let header_size = cursor.position() as usize;

		let payload_size = header.size.ok_or(Error::InvalidFmp4("indefinite atom size"))?;
		let total_size = header_size + payload_size;
		if self.buffer.len() < total_size {
			return Ok(None);
		}

		let mut atom = self.buffer.split_to(total_size).freeze();
		atom.advance(header_size);

		if header.kind == Mdat::KIND {
			return Ok(Some((AtomEvent::Mdat(atom, header_size), total_size)));
		}

		let mut cursor = std::io::Cursor::new(atom);
		let any = Any::decode_atom(&header, &mut cursor)?;
		Ok(Some((AtomEvent::Atom(any), total_size)))
	}
}

struct TrackState {
	kind: TrackKind,
	codec: Option<CodecHint>,
	timescale: u32,
	default_duration: u32,
	default_size: u32,
	default_flags: u32,
}

/// A push parser for fMP4/CMAF byte streams.
pub struct Fmp4Demuxer {
	reader: AtomReader,
	moov: Option<Moov>,
	moof: Option<Moof>,
	moof_size: usize,
	tracks: HashMap<u32, TrackState>,
	events: std::collections::VecDeque<Sample>,
}

impl Default for Fmp4Demuxer {
	fn default() -> Self {
		Self::new()
	}
}

impl Fmp4Demuxer {
	pub fn new() -> Self {
		Self {
			reader: AtomReader::new(),
			moov: None,
			moof: None,
			moof_size: 0,
			tracks: HashMap::new(),
			events: std::collections::VecDeque::new(),
		}
	}

	pub fn is_initialized(&self) -> bool {
		self.moov.is_some()
	}

	pub fn push<B: Buf>(&mut self, buf: &mut B) {
		self.reader.push(buf);
	}

	pub fn next(&mut self) -> Result<Option<Sample>> {
		loop {
			if let Some(sample) = self.events.pop_front() {
				return Ok(Some(sample));
			}

			let Some((event, size)) = self.reader.next()? else {
				return Ok(None);
			};

			match event {
				AtomEvent::Atom(Any::Ftyp(_)) | AtomEvent::Atom(Any::Styp(_)) => {}
				AtomEvent::Atom(Any::Moov(moov)) => self.init(moov)?,
				AtomEvent::Atom(Any::Moof(moof)) => {
					if self.moof.is_some() {
						return Err(Error::InvalidFmp4("two moof boxes in a row"));
					}
					self.moof = Some(moof);
					self.moof_size = size;
				}
				AtomEvent::Mdat(payload, header_size) => self.extract(payload, header_size)?,
				// sidx and friends are optional and don't affect playback.
				AtomEvent::Atom(_) => {}
			}
		}
	}

	fn init(&mut self, moov: Moov) -> Result<()> {
		for trak in &moov.trak {
			let track_id = trak.tkhd.track_id;
			let timescale = trak.mdia.mdhd.timescale;

			let (kind, codec) = match trak.mdia.hdlr.handler.as_ref() {
				b"vide" => {
					let codec = trak.mdia.minf.stbl.stsd.codecs.first().and_then(|codec| match codec {
						mp4_atom::Codec::Avc1(_) => Some(CodecHint::Video(VideoCodec::H264)),
						mp4_atom::Codec::Hev1(_) | mp4_atom::Codec::Hvc1(_) => {
							Some(CodecHint::Video(VideoCodec::H265))
						}
						mp4_atom::Codec::Vp08(_) => Some(CodecHint::Video(VideoCodec::Vp8)),
						mp4_atom::Codec::Vp09(_) => Some(CodecHint::Video(VideoCodec::Vp9)),
						mp4_atom::Codec::Av01(_) => Some(CodecHint::Video(VideoCodec::Av1)),
						_ => None,
					});
					(TrackKind::Video, codec)
				}
				b"soun" => {
					let codec = trak.mdia.minf.stbl.stsd.codecs.first().and_then(|codec| match codec {
						mp4_atom::Codec::Mp4a(_) => Some(CodecHint::Audio(AudioCodec::Aac)),
						mp4_atom::Codec::Opus(_) => Some(CodecHint::Audio(AudioCodec::Opus)),
						_ => None,
					});
					(TrackKind::Audio, codec)
				}
				_ => continue,
			};

			let trex = moov
				.mvex
				.as_ref()
				.and_then(|mvex| mvex.trex.iter().find(|trex| trex.track_id == track_id));

			self.tracks.insert(
				track_id,
				TrackState {
					kind,
					codec,
					timescale,
					default_duration: trex.map(|t| t.default_sample_duration).unwrap_or_default(),
					default_size: trex.map(|t| t.default_sample_size).unwrap_or_default(),
					default_flags: trex.map(|t| t.default_sample_flags).unwrap_or_default(),
				},
			);
		}

		self.moov = Some(moov);
		Ok(())
	}

	/// Walk the pending moof and slice samples out of the mdat payload.
	fn extract(&mut self, mdat: Bytes, header_size: usize) -> Result<()> {
		let moof = self.moof.take().ok_or(Error::InvalidFmp4("mdat without moof"))?;

		for traf in &moof.traf {
			let track_id = traf.tfhd.track_id;
			let track = self.tracks.get(&track_id).ok_or(Error::UnknownTrack(track_id))?;

			let tfdt = traf.tfdt.as_ref().ok_or(Error::InvalidFmp4("missing tfdt box"))?;
			let mut dts = tfdt.base_media_decode_time;

			let mut offset = traf.tfhd.base_data_offset.unwrap_or_default() as usize;
			if traf.trun.is_empty() {
				return Err(Error::InvalidFmp4("missing trun box"));
			}

			for trun in &traf.trun {
				let tfhd = &traf.tfhd;

				if let Some(data_offset) = trun.data_offset {
					// Relative to the start of the moof, not the mdat.
					let data_offset: usize =
						data_offset.try_into().map_err(|_| Error::InvalidFmp4("negative data offset"))?;
					if data_offset < self.moof_size {
						return Err(Error::InvalidFmp4("data offset inside moof"));
					}
					let base = tfhd.base_data_offset.unwrap_or_default() as usize;
					offset = base + data_offset - self.moof_size - header_size;
				}

				for entry in &trun.entries {
					let flags = entry
						.flags
						.unwrap_or(tfhd.default_sample_flags.unwrap_or(track.default_flags));
					let duration = entry
						.duration
						.unwrap_or(tfhd.default_sample_duration.unwrap_or(track.default_duration));
					let size = entry
						.size
						.unwrap_or(tfhd.default_sample_size.unwrap_or(track.default_size)) as usize;

					if offset + size > mdat.len() {
						return Err(Error::InvalidFmp4("sample past end of mdat"));
					}

					let cts = entry.cts.unwrap_or_default() as i64;
					let pts_ticks = dts as i64 + cts;
					let pts = Timestamp::from_scale(pts_ticks.max(0) as u64, track.timescale);
					let dts_ts = Timestamp::from_scale(dts, track.timescale);

					let keyframe = match track.kind {
						TrackKind::Audio => true,
						TrackKind::Video => {
							// Chromium's track_run_iterator rule.
							let depends_on_none = (flags >> 24) & 0x3 == 0x2;
							let non_sync = (flags >> 16) & 0x1 == 0x1;
							depends_on_none && !non_sync
						}
					};

					self.events.push_back(Sample {
						kind: track.kind,
						codec: track.codec,
						payload: mdat.slice(offset..offset + size),
						pts,
						dts: dts_ts.min(pts),
						duration: Some(Timestamp::from_scale(duration as u64, track.timescale)),
						keyframe,
						sequence: 0,
					});

					dts += duration as u64;
					offset += size;
				}
			}
		}

		Ok(())
	}
}
