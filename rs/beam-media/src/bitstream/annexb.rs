//! Annex B framing: start-code delimited NAL units, and conversion to and
//! from the 4-byte length prefixes that MP4 containers require.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// The size of the start code at the beginning of `data`, if there is one.
/// Accepts both the 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) forms.
pub fn start_code_len(data: &[u8]) -> Option<usize> {
	match data {
		[0, 0, 1, ..] => Some(3),
		[0, 0, 0, 1, ..] => Some(4),
		_ => None,
	}
}

/// Whether a payload looks like an Annex B byte stream.
pub fn is_annex_b(data: &[u8]) -> bool {
	start_code_len(data).is_some()
}

/// Find the next start code in `data`, returning (offset, start code size).
fn find_start_code(data: &[u8]) -> Option<(usize, usize)> {
	let mut i = 0;
	while i + 3 <= data.len() {
		if data[i] == 0 && data[i + 1] == 0 {
			if data[i + 2] == 1 {
				return Some((i, 3));
			}
			if data[i + 2] == 0 && data.get(i + 3) == Some(&1) {
				return Some((i, 4));
			}
			// A run of zeros: only one byte is ruled out.
			i += 1;
		} else if data[i + 2] == 0 || data[i + 2] == 1 {
			// The window might end one byte into a start code.
			i += 1;
		} else {
			i += 3;
		}
	}
	None
}

/// Iterate over the NAL units of a complete Annex B access unit.
///
/// The buffer must begin with a start code; the final NAL extends to the end
/// of the buffer. Zero-length units (back-to-back start codes) are skipped.
pub struct NalUnits {
	data: Bytes,
	offset: usize,
	failed: bool,
}

impl NalUnits {
	pub fn new(data: Bytes) -> Self {
		Self {
			data,
			offset: 0,
			failed: false,
		}
	}
}

impl Iterator for NalUnits {
	type Item = Result<Bytes>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed {
			return None;
		}

		loop {
			let rest = &self.data[self.offset..];
			if rest.is_empty() {
				return None;
			}

			let start = match start_code_len(rest) {
				Some(len) => len,
				None => {
					self.failed = true;
					return Some(Err(Error::MissingStartCode));
				}
			};

			let begin = self.offset + start;
			let end = match find_start_code(&self.data[begin..]) {
				Some((offset, _)) => begin + offset,
				None => self.data.len(),
			};
			self.offset = end;

			// Trailing zeros before the next start code are padding, and two
			// start codes in a row delimit nothing.
			let mut unit = self.data.slice(begin..end);
			while unit.last() == Some(&0) {
				unit.truncate(unit.len() - 1);
			}
			if !unit.is_empty() {
				return Some(Ok(unit));
			}
		}
	}
}

/// Convert an Annex B access unit to AVCC framing (4-byte big-endian length
/// before each NAL unit).
///
/// The conversion is lossless: applying [avcc_to_annex_b] and this function
/// again yields an identical buffer.
pub fn annex_b_to_avcc(data: &Bytes) -> Result<Bytes> {
	let mut out = BytesMut::with_capacity(data.len() + 8);
	for nal in NalUnits::new(data.clone()) {
		let nal = nal?;
		out.put_u32(nal.len() as u32);
		out.put_slice(&nal);
	}
	Ok(out.freeze())
}

/// Convert an AVCC-framed access unit to Annex B with 4-byte start codes.
pub fn avcc_to_annex_b(data: &[u8]) -> Result<Bytes> {
	let mut out = BytesMut::with_capacity(data.len() + 4);
	let mut pos = 0;
	while pos < data.len() {
		if pos + 4 > data.len() {
			return Err(Error::TruncatedNal);
		}
		let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
		pos += 4;
		if pos + len > data.len() {
			return Err(Error::TruncatedNal);
		}
		out.put_slice(&[0, 0, 0, 1]);
		out.put_slice(&data[pos..pos + len]);
		pos += len;
	}
	Ok(out.freeze())
}

/// Emit a manual 4-byte start code before a raw unit. Fallback used when a
/// payload claims to be Annex B but fails parsing.
pub fn prefix_start_code(unit: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(unit.len() + 4);
	out.put_slice(&[0, 0, 0, 1]);
	out.put_slice(unit);
	out.freeze()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn au(parts: &[&[u8]]) -> Bytes {
		let mut out = BytesMut::new();
		for p in parts {
			out.put_slice(p);
		}
		out.freeze()
	}

	#[test]
	fn iterates_mixed_start_codes() {
		let data = au(&[&[0, 0, 0, 1], &[0x67, 0x42], &[0, 0, 1], &[0x68, 0xce], &[0, 0, 0, 1], &[0x65, 0x88]]);
		let nals: Vec<_> = NalUnits::new(data).map(|n| n.unwrap()).collect();
		assert_eq!(nals.len(), 3);
		assert_eq!(nals[0].as_ref(), &[0x67, 0x42]);
		assert_eq!(nals[1].as_ref(), &[0x68, 0xce]);
		assert_eq!(nals[2].as_ref(), &[0x65, 0x88]);
	}

	#[test]
	fn rejects_missing_start_code() {
		let data = Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]);
		let mut iter = NalUnits::new(data);
		assert!(iter.next().unwrap().is_err());
		assert!(iter.next().is_none());
	}

	#[test]
	fn skips_empty_units_and_trailing_zeros() {
		let data = au(&[&[0, 0, 1], &[0, 0, 1], &[0x09, 0xf0, 0x00], &[0, 0, 1], &[0x41, 0x9a]]);
		let nals: Vec<_> = NalUnits::new(data).map(|n| n.unwrap()).collect();
		assert_eq!(nals.len(), 2);
		assert_eq!(nals[0].as_ref(), &[0x09, 0xf0]);
		assert_eq!(nals[1].as_ref(), &[0x41, 0x9a]);
	}

	#[test]
	fn embedded_zeros_are_not_boundaries() {
		let data = au(&[&[0, 0, 1], &[0x67, 0x00, 0x00, 0x02, 0xff], &[0, 0, 1], &[0x68]]);
		let nals: Vec<_> = NalUnits::new(data).map(|n| n.unwrap()).collect();
		assert_eq!(nals[0].as_ref(), &[0x67, 0x00, 0x00, 0x02, 0xff]);
		assert_eq!(nals[1].as_ref(), &[0x68]);
	}

	#[test]
	fn conversion_is_involutive() {
		let annexb = au(&[
			&[0, 0, 1],
			&[0x67, 0x4d, 0x00, 0x1f],
			&[0, 0, 0, 1],
			&[0x68, 0xee, 0x3c, 0x80],
			&[0, 0, 0, 1],
			&[0x65, 0x88, 0x80, 0x10, 0x00],
		]);

		let avcc = annex_b_to_avcc(&annexb).unwrap();
		assert_eq!(&avcc[..4], &[0, 0, 0, 4]);

		let back = avcc_to_annex_b(&avcc).unwrap();
		let avcc2 = annex_b_to_avcc(&back).unwrap();
		assert_eq!(avcc, avcc2, "avcc(annexb(avcc(x))) == avcc(x)");

		let annexb2 = avcc_to_annex_b(&annex_b_to_avcc(&back).unwrap()).unwrap();
		assert_eq!(back, annexb2, "annexb(avcc(annexb(x))) == annexb(x)");
	}

	#[test]
	fn avcc_rejects_truncation() {
		assert!(avcc_to_annex_b(&[0, 0, 0, 9, 0x65]).is_err());
		assert!(avcc_to_annex_b(&[0, 0, 0]).is_err());
	}
}
