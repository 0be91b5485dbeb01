//! H.264 NAL unit inspection and decoder configuration assembly.

use bytes::{BufMut, Bytes, BytesMut};

use crate::bitstream::annexb::NalUnits;
use crate::{Error, Result};

/// ISO/IEC 14496-10 table 7-1 NAL unit types, as far as the relay cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum NalType {
	Unspecified = 0,
	NonIdrSlice = 1,
	DataPartitionA = 2,
	DataPartitionB = 3,
	DataPartitionC = 4,
	IdrSlice = 5,
	Sei = 6,
	Sps = 7,
	Pps = 8,
	Aud = 9,
	EndOfSeq = 10,
	EndOfStream = 11,
	Filler = 12,
}

/// The type carried in the bottom five bits of the NAL header byte.
pub fn nal_type(header: u8) -> Option<NalType> {
	NalType::try_from(header & 0x1F).ok()
}

/// Parameter sets extracted from an access unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSets {
	pub sps: Option<Bytes>,
	pub pps: Option<Bytes>,
}

impl ParameterSets {
	pub fn is_complete(&self) -> bool {
		self.sps.is_some() && self.pps.is_some()
	}
}

/// Scan an Annex B access unit for SPS/PPS NAL units.
pub fn extract_parameter_sets(payload: &Bytes) -> Result<ParameterSets> {
	let mut sets = ParameterSets::default();
	for nal in NalUnits::new(payload.clone()) {
		let nal = nal?;
		match nal.first().copied().and_then(nal_type) {
			Some(NalType::Sps) => sets.sps = Some(nal),
			Some(NalType::Pps) => sets.pps = Some(nal),
			_ => {}
		}
	}
	Ok(sets)
}

/// Whether an Annex B access unit contains an IDR slice.
pub fn contains_idr(payload: &Bytes) -> bool {
	NalUnits::new(payload.clone())
		.filter_map(|nal| nal.ok())
		.any(|nal| nal.first().copied().and_then(nal_type) == Some(NalType::IdrSlice))
}

/// Whether an access unit already carries an SPS in-band.
pub fn contains_sps(payload: &Bytes) -> bool {
	NalUnits::new(payload.clone())
		.filter_map(|nal| nal.ok())
		.any(|nal| nal.first().copied().and_then(nal_type) == Some(NalType::Sps))
}

/// Assemble an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §5.2.4.1)
/// from raw SPS and PPS NAL units.
///
/// `lengthSizeMinusOne` is fixed at 3 to match the 4-byte prefixes produced
/// by [crate::bitstream::annexb::annex_b_to_avcc]. The profile bytes are
/// copied straight out of the SPS; the distinction between RBSP and NAL
/// escaping does not matter for them since 0x00 is not a valid profile_idc.
pub fn build_avcc(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
	if sps.len() < 4 {
		return Err(Error::MalformedSample("SPS too short"));
	}

	let mut out = BytesMut::with_capacity(sps.len() + pps.len() + 11);
	out.put_u8(1); // configurationVersion
	out.put_u8(sps[1]); // AVCProfileIndication
	out.put_u8(sps[2]); // profile_compatibility
	out.put_u8(sps[3]); // AVCLevelIndication
	out.put_u8(0xFF); // reserved + lengthSizeMinusOne = 3
	out.put_u8(0xE1); // reserved + one SPS
	out.put_u16(sps.len() as u16);
	out.put_slice(sps);
	out.put_u8(1); // one PPS
	out.put_u16(pps.len() as u16);
	out.put_slice(pps);
	Ok(out.freeze())
}

/// The RFC 6381 codec string (`avc1.PPCCLL`) for an SPS.
pub fn codec_string(sps: &[u8]) -> Option<String> {
	if sps.len() < 4 {
		return None;
	}
	Some(format!("avc1.{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}
