//! Resource monitoring for the encoder subprocess.
//!
//! CPU and memory figures come from `sysinfo`, sampled once a second. On
//! hosts where the process table gives partial answers the missing fields
//! stay zero and the session's health checks fall back to ingress-rate
//! stall detection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::stats::ByteCounter;

/// A snapshot of the encoder's resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceStats {
	pub cpu_percent: f32,
	pub rss_bytes: u64,
	pub virtual_bytes: u64,
	pub bytes_written: u64,
	pub write_rate: f64,
}

/// Samples one process until dropped.
pub struct ResourceMonitor {
	snapshot: Arc<Mutex<ResourceStats>>,
	bytes: Arc<ByteCounter>,
	task: tokio::task::JoinHandle<()>,
}

impl ResourceMonitor {
	/// Start sampling `pid`. `bytes` is the counter fed by whoever pumps
	/// the process's stdout.
	pub fn spawn(pid: u32, bytes: Arc<ByteCounter>) -> Self {
		let snapshot = Arc::new(Mutex::new(ResourceStats::default()));

		let task = {
			let snapshot = snapshot.clone();
			let bytes = bytes.clone();
			tokio::spawn(async move {
				let mut system = System::new();
				let pid = Pid::from_u32(pid);
				let mut interval = tokio::time::interval(Duration::from_secs(1));
				interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

				loop {
					interval.tick().await;

					system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
					let Some(process) = system.process(pid) else {
						// Process is gone; keep the last sample around for
						// post-mortem stats.
						return;
					};

					let mut stats = snapshot.lock();
					stats.cpu_percent = process.cpu_usage();
					stats.rss_bytes = process.memory();
					stats.virtual_bytes = process.virtual_memory();
					stats.bytes_written = bytes.total();
					stats.write_rate = bytes.rate();
				}
			})
		};

		Self {
			snapshot,
			bytes,
			task,
		}
	}

	pub fn stats(&self) -> ResourceStats {
		let mut stats = *self.snapshot.lock();
		// Byte counters are cheap; refresh them even between samples.
		stats.bytes_written = self.bytes.total();
		stats
	}
}

impl Drop for ResourceMonitor {
	fn drop(&mut self) {
		self.task.abort();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn reports_bytes_for_the_current_process() {
		let bytes = Arc::new(ByteCounter::new());
		let monitor = ResourceMonitor::spawn(std::process::id(), bytes.clone());

		bytes.add(4096);
		let stats = monitor.stats();
		assert_eq!(stats.bytes_written, 4096);

		// After a sampling tick the process figures fill in.
		tokio::time::sleep(Duration::from_millis(1100)).await;
		let stats = monitor.stats();
		assert!(stats.rss_bytes > 0, "a live process has resident memory");
	}
}
