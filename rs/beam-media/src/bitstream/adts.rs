//! ADTS framing around AAC, and the AudioSpecificConfig needed to describe
//! raw AAC in MP4 containers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// ISO/IEC 14496-3 sampling frequency index table.
const SAMPLE_RATES: [u32; 13] = [
	96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
	7_350,
];

/// Samples per AAC frame.
pub const SAMPLES_PER_FRAME: u32 = 1024;

/// One ADTS frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
	/// MPEG-4 audio object type (adts profile + 1): 2 = AAC-LC.
	pub object_type: u8,
	pub sample_rate_index: u8,
	pub sample_rate: u32,
	pub channel_config: u8,
	/// 7 bytes, or 9 when a CRC is present (protection_absent == 0).
	pub header_len: usize,
	/// Total frame length including the header.
	pub frame_len: usize,
}

impl AdtsHeader {
	/// Parse an ADTS header at the start of `data`.
	pub fn parse(data: &[u8]) -> Result<Self> {
		if data.len() < 7 {
			return Err(Error::MissingAdtsSync);
		}
		if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
			return Err(Error::MissingAdtsSync);
		}

		let protection_absent = data[1] & 0x01 != 0;
		let profile = (data[2] >> 6) & 0x03;
		let sample_rate_index = (data[2] >> 2) & 0x0F;
		let channel_config = ((data[2] & 0x01) << 2) | ((data[3] >> 6) & 0x03);
		let frame_len = (((data[3] & 0x03) as usize) << 11) | ((data[4] as usize) << 3) | ((data[5] >> 5) as usize);

		let sample_rate = SAMPLE_RATES
			.get(sample_rate_index as usize)
			.copied()
			.ok_or(Error::AdtsSampleRate(sample_rate_index))?;

		Ok(Self {
			object_type: profile + 1,
			sample_rate_index,
			sample_rate,
			channel_config,
			header_len: if protection_absent { 7 } else { 9 },
			frame_len,
		})
	}

	/// The 2-byte AudioSpecificConfig for this stream, as stored in the
	/// esds box.
	pub fn audio_specific_config(&self) -> Bytes {
		let mut out = BytesMut::with_capacity(2);
		out.put_u8((self.object_type << 3) | (self.sample_rate_index >> 1));
		out.put_u8(((self.sample_rate_index & 1) << 7) | (self.channel_config << 3));
		out.freeze()
	}
}

/// One AAC frame split out of an ADTS stream.
#[derive(Debug, Clone)]
pub struct AdtsFrame {
	pub header: AdtsHeader,
	/// The raw AAC frame with the ADTS header stripped.
	pub payload: Bytes,
}

/// Iterate the frames of an ADTS stream.
pub struct AdtsIter {
	data: Bytes,
	offset: usize,
	failed: bool,
}

impl AdtsIter {
	pub fn new(data: Bytes) -> Self {
		Self {
			data,
			offset: 0,
			failed: false,
		}
	}
}

impl Iterator for AdtsIter {
	type Item = Result<AdtsFrame>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.failed || self.offset >= self.data.len() {
			return None;
		}

		let rest = &self.data[self.offset..];
		let header = match AdtsHeader::parse(rest) {
			Ok(header) => header,
			Err(err) => {
				self.failed = true;
				return Some(Err(err));
			}
		};

		if header.frame_len < header.header_len || rest.len() < header.frame_len {
			self.failed = true;
			return Some(Err(Error::MalformedSample("truncated ADTS frame")));
		}

		let begin = self.offset + header.header_len;
		let end = self.offset + header.frame_len;
		self.offset = end;

		Some(Ok(AdtsFrame {
			header,
			payload: self.data.slice(begin..end),
		}))
	}
}

/// Whether a payload begins with the ADTS syncword.
pub fn is_adts(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}
