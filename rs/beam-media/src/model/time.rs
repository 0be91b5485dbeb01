/// A presentation or decode timestamp in 90 kHz ticks.
///
/// MPEG-TS carries PTS/DTS at 90 kHz, so the whole pipeline uses that clock;
/// samples from other containers are rescaled on ingest. Timestamps within a
/// track are relative, so zero for one track is not zero for another.
///
/// This is [std::time::Instant] and [std::time::Duration] merged into one
/// type for simplicity, like the frame timestamps in MoQ-style stacks.
#[derive(Debug, Clone, Default, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

/// The MPEG-TS timestamp clock rate.
pub const TICKS_PER_SECOND: u64 = 90_000;

/// PTS and DTS wrap at 33 bits on the wire.
pub const PTS_WRAP: u64 = 1 << 33;

impl Timestamp {
	pub const ZERO: Self = Self(0);

	/// A raw 90 kHz tick count.
	pub const fn from_ticks(ticks: u64) -> Self {
		Self(ticks)
	}

	pub const fn from_secs(seconds: u64) -> Self {
		Self(seconds * TICKS_PER_SECOND)
	}

	pub const fn from_millis(millis: u64) -> Self {
		Self(millis * TICKS_PER_SECOND / 1000)
	}

	pub const fn from_micros(micros: u64) -> Self {
		Self((micros as u128 * TICKS_PER_SECOND as u128 / 1_000_000) as u64)
	}

	/// Rescale a tick count from another clock to 90 kHz.
	pub const fn from_scale(value: u64, scale: u32) -> Self {
		Self((value as u128 * TICKS_PER_SECOND as u128 / scale as u128) as u64)
	}

	pub const fn as_ticks(self) -> u64 {
		self.0
	}

	pub const fn as_secs(self) -> u64 {
		self.0 / TICKS_PER_SECOND
	}

	pub const fn as_millis(self) -> u64 {
		(self.0 as u128 * 1000 / TICKS_PER_SECOND as u128) as u64
	}

	pub const fn as_micros(self) -> u64 {
		(self.0 as u128 * 1_000_000 / TICKS_PER_SECOND as u128) as u64
	}

	/// Rescale to another clock, e.g. an audio sample rate.
	pub const fn as_scale(self, scale: u32) -> u64 {
		(self.0 as u128 * scale as u128 / TICKS_PER_SECOND as u128) as u64
	}

	/// The value as it appears on the MPEG-TS wire, wrapped to 33 bits.
	pub const fn as_wire(self) -> u64 {
		self.0 % PTS_WRAP
	}

	pub const fn checked_add(self, rhs: Self) -> Option<Self> {
		match self.0.checked_add(rhs.0) {
			Some(v) => Some(Self(v)),
			None => None,
		}
	}

	pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
		match self.0.checked_sub(rhs.0) {
			Some(v) => Some(Self(v)),
			None => None,
		}
	}

	pub const fn saturating_sub(self, rhs: Self) -> Self {
		Self(self.0.saturating_sub(rhs.0))
	}

	pub const fn is_zero(self) -> bool {
		self.0 == 0
	}
}

impl std::ops::Add for Timestamp {
	type Output = Self;

	fn add(self, rhs: Self) -> Self {
		Self(self.0 + rhs.0)
	}
}

impl std::ops::Sub for Timestamp {
	type Output = Self;

	fn sub(self, rhs: Self) -> Self {
		Self(self.0 - rhs.0)
	}
}

impl From<std::time::Duration> for Timestamp {
	fn from(duration: std::time::Duration) -> Self {
		Self((duration.as_nanos() * TICKS_PER_SECOND as u128 / 1_000_000_000) as u64)
	}
}

impl From<Timestamp> for std::time::Duration {
	fn from(ts: Timestamp) -> Self {
		std::time::Duration::from_nanos((ts.0 as u128 * 1_000_000_000 / TICKS_PER_SECOND as u128) as u64)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}.{:03}s", self.as_secs(), self.as_millis() % 1000)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rescale_round_trips() {
		let ts = Timestamp::from_scale(48_000, 48_000);
		assert_eq!(ts, Timestamp::from_secs(1));
		assert_eq!(ts.as_scale(48_000), 48_000);
		assert_eq!(ts.as_ticks(), 90_000);
	}

	#[test]
	fn wire_wraps_at_33_bits() {
		let ts = Timestamp::from_ticks(PTS_WRAP + 42);
		assert_eq!(ts.as_wire(), 42);
	}

	#[test]
	fn duration_conversion() {
		let ts: Timestamp = std::time::Duration::from_millis(500).into();
		assert_eq!(ts.as_ticks(), 45_000);
		let back: std::time::Duration = ts.into();
		assert_eq!(back, std::time::Duration::from_millis(500));
	}
}
