//! H.265 NAL unit inspection and decoder configuration assembly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::bitstream::annexb::NalUnits;
use crate::{Error, Result};

/// The H.265 NAL unit types the relay distinguishes. The type lives in bits
/// 6..1 of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum NalType {
	Vps = 32,
	Sps = 33,
	Pps = 34,
	Aud = 35,
	PrefixSei = 39,
	SuffixSei = 40,
}

/// IRAP picture types span BLA_W_LP (16) through CRA_NUT (21), with 22/23
/// reserved for future IRAP types.
const IRAP_RANGE: std::ops::RangeInclusive<u8> = 16..=23;

/// The raw 6-bit NAL unit type from the first header byte.
pub fn nal_unit_type(header: u8) -> u8 {
	(header >> 1) & 0x3F
}

pub fn is_irap(header: u8) -> bool {
	IRAP_RANGE.contains(&nal_unit_type(header))
}

/// Parameter sets extracted from an access unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSets {
	pub vps: Option<Bytes>,
	pub sps: Option<Bytes>,
	pub pps: Option<Bytes>,
}

impl ParameterSets {
	/// A stream is decodable without a VPS in the single-layer case, so only
	/// SPS and PPS are mandatory.
	pub fn is_complete(&self) -> bool {
		self.sps.is_some() && self.pps.is_some()
	}
}

/// Scan an Annex B access unit for VPS/SPS/PPS NAL units.
pub fn extract_parameter_sets(payload: &Bytes) -> Result<ParameterSets> {
	let mut sets = ParameterSets::default();
	for nal in NalUnits::new(payload.clone()) {
		let nal = nal?;
		let Some(&header) = nal.first() else { continue };
		match nal_unit_type(header) {
			32 => sets.vps = Some(nal),
			33 => sets.sps = Some(nal),
			34 => sets.pps = Some(nal),
			_ => {}
		}
	}
	Ok(sets)
}

/// Whether an Annex B access unit contains an IRAP slice.
pub fn contains_irap(payload: &Bytes) -> bool {
	NalUnits::new(payload.clone())
		.filter_map(|nal| nal.ok())
		.any(|nal| nal.first().copied().map(is_irap).unwrap_or(false))
}

/// Whether an access unit already carries an SPS in-band.
pub fn contains_sps(payload: &Bytes) -> bool {
	NalUnits::new(payload.clone())
		.filter_map(|nal| nal.ok())
		.any(|nal| nal.first().copied().map(|h| nal_unit_type(h) == 33).unwrap_or(false))
}

/// Assemble an `HEVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §8.3.3.1)
/// from raw VPS/SPS/PPS NAL units.
///
/// The general_profile/tier/level fields are copied from the SPS
/// profile_tier_level, which starts at a fixed offset for the single-layer
/// streams the relay handles. `lengthSizeMinusOne` is fixed at 3.
pub fn build_hvcc(vps: Option<&[u8]>, sps: &[u8], pps: &[u8]) -> Result<Bytes> {
	// NAL header (2) + sps_video_parameter_set_id/max_sub_layers/temporal_id
	// nesting (1), then profile_tier_level: profile_space/tier/profile_idc
	// (1), compatibility flags (4), constraint flags (6), level_idc (1).
	if sps.len() < 15 {
		return Err(Error::MalformedSample("H.265 SPS too short"));
	}
	let ptl = &sps[3..15];

	let mut out = BytesMut::with_capacity(sps.len() + pps.len() + vps.map_or(0, |v| v.len()) + 40);
	out.put_u8(1); // configurationVersion
	out.put_u8(ptl[0]); // profile_space + tier + profile_idc
	out.put_slice(&ptl[1..5]); // general_profile_compatibility_flags
	out.put_slice(&ptl[5..11]); // general_constraint_indicator_flags
	out.put_u8(ptl[11]); // general_level_idc
	out.put_u16(0xF000); // reserved + min_spatial_segmentation_idc
	out.put_u8(0xFC); // reserved + parallelismType
	out.put_u8(0xFC | 1); // reserved + chromaFormat (4:2:0)
	out.put_u8(0xF8); // reserved + bitDepthLumaMinus8
	out.put_u8(0xF8); // reserved + bitDepthChromaMinus8
	out.put_u16(0); // avgFrameRate
	out.put_u8(0x03 | (3 << 2)); // constantFrameRate=0, numTemporalLayers=0, temporalIdNested=0, lengthSizeMinusOne=3

	let arrays: Vec<(u8, &[u8])> = vps
		.map(|v| (32u8, v))
		.into_iter()
		.chain([(33u8, sps), (34u8, pps)])
		.collect();

	out.put_u8(arrays.len() as u8);
	for (nal_type, nal) in arrays {
		out.put_u8(0x80 | nal_type); // array_completeness + NAL_unit_type
		out.put_u16(1); // numNalus
		out.put_u16(nal.len() as u16);
		out.put_slice(nal);
	}

	Ok(out.freeze())
}

#[cfg(test)]
mod tests {
	use super::*;

	// Parameter sets from an x265-encoded 1280x720 main-profile stream.
	const VPS: &[u8] = &[
		0x40, 0x01, 0x0c, 0x01, 0xff, 0xff, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00,
		0x03, 0x00, 0x00, 0x03, 0x00, 0x5d, 0x95, 0x98, 0x09,
	];
	const SPS: &[u8] = &[
		0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00,
		0x03, 0x00, 0x5d, 0xa0, 0x02, 0x80, 0x80, 0x2d, 0x16, 0x59, 0x59, 0xa4, 0x93, 0x2b, 0xc0,
		0x5a, 0x70, 0x80, 0x00, 0x00, 0x03, 0x00, 0x80, 0x00, 0x00, 0x0c, 0x42,
	];
	const PPS: &[u8] = &[0x44, 0x01, 0xc1, 0x72, 0xb4, 0x62, 0x40];

	fn annexb_au(units: &[&[u8]]) -> Bytes {
		let mut out = BytesMut::new();
		for unit in units {
			out.put_slice(&[0, 0, 0, 1]);
			out.put_slice(unit);
		}
		out.freeze()
	}

	#[test]
	fn classifies_nal_types() {
		assert_eq!(nal_unit_type(VPS[0]), 32);
		assert_eq!(nal_unit_type(SPS[0]), 33);
		assert_eq!(nal_unit_type(PPS[0]), 34);
		// IDR_W_RADL = 19
		assert_eq!(nal_unit_type(0x26), 19);
		assert!(is_irap(0x26));
		// TRAIL_R = 1
		assert!(!is_irap(0x02));
	}

	#[test]
	fn extracts_parameter_sets() {
		let au = annexb_au(&[VPS, SPS, PPS, &[0x26, 0x01, 0xaf]]);
		let sets = extract_parameter_sets(&au).unwrap();
		assert_eq!(sets.vps.as_deref(), Some(VPS));
		assert_eq!(sets.sps.as_deref(), Some(SPS));
		assert_eq!(sets.pps.as_deref(), Some(PPS));
		assert!(sets.is_complete());
		assert!(contains_irap(&au));
	}

	#[test]
	fn hvcc_record_layout() {
		let hvcc = build_hvcc(Some(VPS), SPS, PPS).unwrap();
		assert_eq!(hvcc[0], 1);
		// profile_space=0, tier=0, profile_idc=1 (Main)
		assert_eq!(hvcc[1], SPS[3]);
		// Three parameter set arrays: VPS, SPS, PPS.
		let count_offset = 22;
		assert_eq!(hvcc[count_offset], 3);
		assert_eq!(hvcc[count_offset + 1], 0x80 | 32);
	}

	#[test]
	fn hvcc_without_vps() {
		let hvcc = build_hvcc(None, SPS, PPS).unwrap();
		assert_eq!(hvcc[22], 2);
		assert_eq!(hvcc[23], 0x80 | 33);
	}
}
