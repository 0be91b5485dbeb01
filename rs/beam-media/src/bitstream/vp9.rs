//! VP9 uncompressed frame header parsing.

use crate::bitstream::BitReader;
use crate::{Error, Result};

const SYNC_CODE: u64 = 0x498342;

/// Fields of the VP9 uncompressed header the relay cares about.
///
/// Inter frames carry almost none of these; geometry and color information
/// are only present on keyframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
	pub profile: u8,
	pub keyframe: bool,
	pub show_frame: bool,
	pub bit_depth: u8,
	/// 0 = 4:2:0, 1 = 4:2:2, 2 = 4:4:4 (keyframes only, profile-dependent).
	pub chroma_subsampling: u8,
	pub full_range: bool,
	pub width: u32,
	pub height: u32,
}

/// Parse the start of a VP9 frame. Returns the header for keyframes; inter
/// frames yield a header with only `profile`, `keyframe` and `show_frame`
/// populated.
pub fn parse_frame_header(data: &[u8]) -> Result<FrameHeader> {
	let mut bits = BitReader::new(data);

	let frame_marker = bits.bits(2)?;
	if frame_marker != 2 {
		return Err(Error::InvalidVp9("bad frame marker"));
	}

	let profile_low = bits.bit()? as u8;
	let profile_high = bits.bit()? as u8;
	let mut profile = (profile_high << 1) | profile_low;
	if profile == 3 {
		// reserved_zero bit extends the profile field
		if bits.bit()? {
			return Err(Error::InvalidVp9("bad reserved bit"));
		}
	}

	let show_existing_frame = bits.bit()?;
	if show_existing_frame {
		return Ok(FrameHeader {
			profile,
			keyframe: false,
			show_frame: true,
			bit_depth: 0,
			chroma_subsampling: 0,
			full_range: false,
			width: 0,
			height: 0,
		});
	}

	let frame_type_inter = bits.bit()?;
	let show_frame = bits.bit()?;
	let _error_resilient = bits.bit()?;

	if frame_type_inter {
		return Ok(FrameHeader {
			profile,
			keyframe: false,
			show_frame,
			bit_depth: 0,
			chroma_subsampling: 0,
			full_range: false,
			width: 0,
			height: 0,
		});
	}

	if bits.bits(24)? != SYNC_CODE {
		return Err(Error::InvalidVp9("bad sync code"));
	}

	// color_config
	let bit_depth = if profile >= 2 {
		if bits.bit()? { 12 } else { 10 }
	} else {
		8
	};

	let color_space = bits.bits(3)?;
	let mut full_range = false;
	let mut chroma_subsampling = 0;
	if color_space != 7 {
		// CS_RGB implies 4:4:4 full range.
		full_range = bits.bit()?;
		if profile == 1 || profile == 3 {
			let sub_x = bits.bit()? as u8;
			let sub_y = bits.bit()? as u8;
			chroma_subsampling = match (sub_x, sub_y) {
				(1, 1) => 0,
				(1, 0) => 1,
				_ => 2,
			};
			if bits.bit()? {
				return Err(Error::InvalidVp9("bad reserved bit"));
			}
		}
	} else {
		full_range = true;
		chroma_subsampling = 2;
		if profile == 1 || profile == 3 {
			if bits.bit()? {
				return Err(Error::InvalidVp9("bad reserved bit"));
			}
		}
	}
	if profile == 0 || profile == 2 {
		chroma_subsampling = 0;
	}

	let width = bits.bits(16)? as u32 + 1;
	let height = bits.bits(16)? as u32 + 1;

	Ok(FrameHeader {
		profile,
		keyframe: true,
		show_frame,
		bit_depth,
		chroma_subsampling,
		full_range,
		width,
		height,
	})
}

/// Whether a VP9 frame is a keyframe. Malformed headers are treated as
/// non-key so they never start a segment.
pub fn is_keyframe(data: &[u8]) -> bool {
	parse_frame_header(data).map(|h| h.keyframe).unwrap_or(false)
}
