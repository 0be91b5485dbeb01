use serde::{Deserialize, Serialize};

/// Hardware acceleration modes for the external encoder.
///
/// `Auto` is resolved by the route decider: it tries the platform's
/// accelerators in order and falls back to software when none is available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
	#[default]
	Auto,
	None,
	Cuda,
	Qsv,
	Vaapi,
	#[serde(rename = "videotoolbox")]
	VideoToolbox,
}

impl HwAccel {
	pub const fn id(self) -> &'static str {
		match self {
			Self::Auto => "auto",
			Self::None => "none",
			Self::Cuda => "cuda",
			Self::Qsv => "qsv",
			Self::Vaapi => "vaapi",
			Self::VideoToolbox => "videotoolbox",
		}
	}

	/// Whether encoders for this mode need a hardware device initialized
	/// and frames uploaded before encoding.
	pub const fn needs_device(self) -> bool {
		matches!(self, Self::Cuda | Self::Qsv | Self::Vaapi)
	}
}

impl std::fmt::Display for HwAccel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.id())
	}
}

impl std::str::FromStr for HwAccel {
	type Err = UnknownHwAccel;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"auto" | "" => Ok(Self::Auto),
			"none" | "software" | "sw" => Ok(Self::None),
			"cuda" | "nvenc" | "nvidia" => Ok(Self::Cuda),
			"qsv" | "quicksync" | "intel" => Ok(Self::Qsv),
			"vaapi" => Ok(Self::Vaapi),
			"videotoolbox" | "vt" => Ok(Self::VideoToolbox),
			other => Err(UnknownHwAccel(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown hwaccel mode: {0}")]
pub struct UnknownHwAccel(pub String);
