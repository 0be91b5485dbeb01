//! AV1 open bitstream unit (OBU) parsing.

use bytes::Bytes;

use crate::bitstream::BitReader;
use crate::{Error, Result};

/// OBU types from the AV1 specification §5.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum ObuType {
	SequenceHeader = 1,
	TemporalDelimiter = 2,
	FrameHeader = 3,
	TileGroup = 4,
	Metadata = 5,
	Frame = 6,
	RedundantFrameHeader = 7,
	TileList = 8,
	Padding = 15,
}

/// One parsed OBU.
#[derive(Debug, Clone)]
pub struct Obu {
	pub obu_type: ObuType,
	/// The full OBU including its header, for pass-through muxing.
	pub raw: Bytes,
	/// The OBU payload after header and size field.
	pub payload: Bytes,
}

/// Decode an unsigned LEB128 value, returning (value, bytes consumed).
/// At most eight bytes per AV1 §4.10.5.
pub fn read_leb128(data: &[u8]) -> Result<(u64, usize)> {
	let mut value = 0u64;
	for (i, &byte) in data.iter().take(8).enumerate() {
		value |= ((byte & 0x7F) as u64) << (i * 7);
		if byte & 0x80 == 0 {
			return Ok((value, i + 1));
		}
	}
	Err(Error::InvalidLeb128)
}

/// Iterate the OBUs of a temporal unit. Each OBU must carry the
/// `obu_has_size_field` flag; low-overhead streams without size fields can
/// only hold a single OBU, which is handled by treating the remainder of the
/// buffer as the payload.
pub struct ObuIter {
	data: Bytes,
	offset: usize,
	failed: bool,
}

impl ObuIter {
	pub fn new(data: Bytes) -> Self {
		Self {
			data,
			offset: 0,
			failed: false,
		}
	}

	fn parse_next(&mut self) -> Result<Option<Obu>> {
		let rest = &self.data[self.offset..];
		if rest.is_empty() {
			return Ok(None);
		}

		let header = rest[0];
		if header & 0x80 != 0 {
			// obu_forbidden_bit
			return Err(Error::InvalidObu);
		}

		let obu_type_bits = (header >> 3) & 0x0F;
		let has_extension = header & 0x04 != 0;
		let has_size = header & 0x02 != 0;

		let mut pos = 1;
		if has_extension {
			if rest.len() < 2 {
				return Err(Error::InvalidObu);
			}
			pos += 1;
		}

		let (size, end) = if has_size {
			let (size, len) = read_leb128(&rest[pos..])?;
			pos += len;
			let size = size as usize;
			if pos + size > rest.len() {
				return Err(Error::InvalidObu);
			}
			(size, pos + size)
		} else {
			(rest.len() - pos, rest.len())
		};

		let obu = Obu {
			obu_type: ObuType::try_from(obu_type_bits).map_err(|_| Error::InvalidObu)?,
			raw: self.data.slice(self.offset..self.offset + end),
			payload: self.data.slice(self.offset + pos..self.offset + pos + size),
		};
		self.offset += end;
		Ok(Some(obu))
	}
}

impl Iterator for ObuIter {
	type Item = Result<Obu>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}
		match self.parse_next() {
			Ok(Some(obu)) => Some(Ok(obu)),
			Ok(None) => None,
			Err(err) => {
				self.failed = true;
				Some(Err(err))
			}
		}
	}
}

/// Extract the sequence header OBU from a temporal unit, if present.
pub fn extract_sequence_header(payload: &Bytes) -> Result<Option<Bytes>> {
	for obu in ObuIter::new(payload.clone()) {
		let obu = obu?;
		if obu.obu_type == ObuType::SequenceHeader {
			return Ok(Some(obu.raw));
		}
	}
	Ok(None)
}

/// Whether a temporal unit starts a keyframe.
///
/// True when it carries a sequence header, or when its first frame header
/// has `frame_type == KEY_FRAME` (AV1 §5.9.2: after `show_existing_frame`,
/// the frame type is the next two bits).
pub fn is_keyframe(payload: &Bytes) -> bool {
	for obu in ObuIter::new(payload.clone()) {
		let Ok(obu) = obu else { return false };
		match obu.obu_type {
			ObuType::SequenceHeader => return true,
			ObuType::Frame | ObuType::FrameHeader => {
				let mut bits = BitReader::new(&obu.payload);
				let Ok(show_existing) = bits.bit() else { return false };
				if show_existing {
					return false;
				}
				return matches!(bits.bits(2), Ok(0)); // KEY_FRAME
			}
			_ => {}
		}
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;

	fn obu(obu_type: u8, payload: &[u8]) -> Vec<u8> {
		// header with has_size_field set, then LEB128 size
		let mut out = vec![(obu_type << 3) | 0x02, payload.len() as u8];
		out.extend_from_slice(payload);
		out
	}

	#[test]
	fn leb128_decoding() {
		assert_eq!(read_leb128(&[0x00]).unwrap(), (0, 1));
		assert_eq!(read_leb128(&[0x7F]).unwrap(), (127, 1));
		assert_eq!(read_leb128(&[0x80, 0x01]).unwrap(), (128, 2));
		assert_eq!(read_leb128(&[0xE5, 0x8E, 0x26]).unwrap(), (624485, 3));
		assert!(read_leb128(&[0x80; 9]).is_err());
		assert!(read_leb128(&[]).is_err());
	}

	#[test]
	fn iterates_obus() {
		let mut data = obu(2, &[]); // temporal delimiter
		data.extend(obu(1, &[0x20, 0x00])); // sequence header
		data.extend(obu(6, &[0x10, 0xff, 0xff])); // frame

		let obus: Vec<_> = ObuIter::new(Bytes::from(data)).map(|o| o.unwrap()).collect();
		assert_eq!(obus.len(), 3);
		assert_eq!(obus[0].obu_type, ObuType::TemporalDelimiter);
		assert_eq!(obus[1].obu_type, ObuType::SequenceHeader);
		assert_eq!(obus[2].obu_type, ObuType::Frame);
		assert_eq!(obus[2].payload.as_ref(), &[0x10, 0xff, 0xff]);
	}

	#[test]
	fn rejects_forbidden_bit() {
		let data = Bytes::from_static(&[0x80, 0x00]);
		assert!(ObuIter::new(data).next().unwrap().is_err());
	}

	#[test]
	fn sequence_header_means_keyframe() {
		let mut data = obu(2, &[]);
		data.extend(obu(1, &[0x20, 0x00]));
		data.extend(obu(6, &[0x10, 0xff]));
		let payload = Bytes::from(data);
		assert!(is_keyframe(&payload));
		assert!(extract_sequence_header(&payload).unwrap().is_some());
	}

	#[test]
	fn inter_frame_is_not_keyframe() {
		// frame OBU, show_existing_frame=0, frame_type=01 (INTER)
		let data = obu(6, &[0b0010_0000, 0xff]);
		let payload = Bytes::from(data);
		assert!(!is_keyframe(&payload));
		assert!(extract_sequence_header(&payload).unwrap().is_none());
	}

	#[test]
	fn key_frame_header_without_sequence_header() {
		// show_existing_frame=0, frame_type=00 (KEY)
		let data = obu(3, &[0b0001_0000]);
		assert!(is_keyframe(&Bytes::from(data)));
	}
}
