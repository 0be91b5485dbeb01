//! Byte accounting shared by sessions, clients and the transcoder monitor.
//!
//! Counters are atomics so hot paths never block; rates are derived lazily
//! by whoever reads a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonically growing byte counter with rate estimation.
pub struct ByteCounter {
	total: AtomicU64,
	/// (total, millis since start) at the previous rate sample.
	window: parking_lot::Mutex<(u64, u64)>,
	started: Instant,
}

impl Default for ByteCounter {
	fn default() -> Self {
		Self::new()
	}
}

impl ByteCounter {
	pub fn new() -> Self {
		Self {
			total: AtomicU64::new(0),
			window: parking_lot::Mutex::new((0, 0)),
			started: Instant::now(),
		}
	}

	pub fn add(&self, bytes: u64) {
		self.total.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn total(&self) -> u64 {
		self.total.load(Ordering::Relaxed)
	}

	/// Bytes per second since the previous call. The first call measures
	/// from counter creation.
	pub fn rate(&self) -> f64 {
		let now_ms = self.started.elapsed().as_millis() as u64;
		let total = self.total();

		let mut window = self.window.lock();
		let (prev_total, prev_ms) = *window;
		*window = (total, now_ms);

		let elapsed_ms = now_ms.saturating_sub(prev_ms);
		if elapsed_ms == 0 {
			return 0.0;
		}
		(total.saturating_sub(prev_total)) as f64 * 1000.0 / elapsed_ms as f64
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counts_and_rates() {
		let counter = ByteCounter::new();
		counter.add(1000);
		counter.add(500);
		assert_eq!(counter.total(), 1500);

		std::thread::sleep(std::time::Duration::from_millis(20));
		let rate = counter.rate();
		assert!(rate > 0.0);

		// No new bytes: the next window reports zero.
		std::thread::sleep(std::time::Duration::from_millis(20));
		assert_eq!(counter.rate(), 0.0);
	}
}
