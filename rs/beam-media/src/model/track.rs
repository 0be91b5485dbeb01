use serde::{Deserialize, Serialize};

use crate::model::TrackKind;

/// Disposition flags carried by a track, as reported by the prober.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disposition {
	#[serde(default)]
	pub default: bool,
	#[serde(default)]
	pub forced: bool,
}

/// Static description of one track in a source.
///
/// Populated once by the prober and immutable afterward.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
	/// Zero-based index of this track in the source.
	pub index: usize,

	pub kind: StreamKind,

	/// Codec name as normalized by the registry, or the probe's raw string
	/// when unknown.
	pub codec: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub profile: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub level: Option<i64>,

	/// Video geometry.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub width: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub height: Option<u32>,

	/// Audio layout.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub channels: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sample_rate: Option<u32>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,

	#[serde(default)]
	pub disposition: Disposition,
}

/// Track categories the prober reports. Subtitles are carried through for
/// callers that select non-default tracks but never demuxed here.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
	Video,
	Audio,
	Subtitle,
	#[serde(other)]
	Other,
}

impl StreamKind {
	/// The demuxable track kind, if this is one.
	pub fn track_kind(self) -> Option<TrackKind> {
		match self {
			Self::Video => Some(TrackKind::Video),
			Self::Audio => Some(TrackKind::Audio),
			_ => None,
		}
	}
}
