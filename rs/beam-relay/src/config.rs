use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All engine tunables. Loading and validating config files is the outer
/// application's job; this struct only defines the shape and the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
	pub probe: ProbeConfig,
	pub buffer: BufferConfig,
	pub transcode: TranscodeConfig,
	pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
	/// Path to the probe binary.
	pub ffprobe: String,

	/// Wall-clock budget for a quick probe.
	#[serde(with = "humantime_serde")]
	pub quick_timeout: Duration,

	/// Wall-clock budget for a deep probe.
	#[serde(with = "humantime_serde")]
	pub deep_timeout: Duration,

	/// `analyzeduration` handed to the probe in quick mode, microseconds.
	pub quick_analyze_micros: u64,

	/// `probesize` handed to the probe in quick mode, bytes.
	pub quick_probe_bytes: u64,
}

impl Default for ProbeConfig {
	fn default() -> Self {
		Self {
			ffprobe: "ffprobe".to_string(),
			quick_timeout: Duration::from_secs(5),
			deep_timeout: Duration::from_secs(30),
			quick_analyze_micros: 500_000,
			quick_probe_bytes: 2_000_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
	/// Byte budget per variant buffer; 0 disables eviction.
	pub max_bytes: u64,
}

impl Default for BufferConfig {
	fn default() -> Self {
		Self {
			max_bytes: 64 * 1024 * 1024,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscodeConfig {
	/// Path to the encoder binary.
	pub ffmpeg: String,

	/// Runs shorter than this count as startup failures and are retried;
	/// longer runs that exit are fatal.
	#[serde(with = "humantime_serde")]
	pub min_run_time: Duration,

	/// Startup attempts before giving up.
	pub max_attempts: u32,

	/// First retry delay; doubles per attempt.
	#[serde(with = "humantime_serde")]
	pub backoff_base: Duration,

	/// Upper bound for the retry delay.
	#[serde(with = "humantime_serde")]
	pub backoff_cap: Duration,

	/// Where to append encoder stderr, if anywhere.
	pub stderr_log_dir: Option<std::path::PathBuf>,

	/// Lines of stderr kept in memory per transcoder.
	pub stderr_ring_lines: usize,
}

impl Default for TranscodeConfig {
	fn default() -> Self {
		Self {
			ffmpeg: "ffmpeg".to_string(),
			min_run_time: Duration::from_secs(5),
			max_attempts: 3,
			backoff_base: Duration::from_millis(500),
			backoff_cap: Duration::from_secs(5),
			stderr_log_dir: None,
			stderr_ring_lines: 100,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
	/// How long an empty session survives before the pipeline shuts down.
	#[serde(with = "humantime_serde")]
	pub linger: Duration,

	/// No ingress growth for this long marks the session stalled.
	#[serde(with = "humantime_serde")]
	pub stall_threshold: Duration,

	/// Health check cadence.
	#[serde(with = "humantime_serde")]
	pub health_interval: Duration,

	/// Bytes queued per client before backpressure stops the reader.
	pub client_queue_bytes: usize,

	/// How long a full client queue may stay full before the client is
	/// evicted.
	#[serde(with = "humantime_serde")]
	pub drain_deadline: Duration,

	/// Grace period for tasks to flush and exit on shutdown.
	#[serde(with = "humantime_serde")]
	pub shutdown_timeout: Duration,

	/// Target media segment duration for fMP4 and HLS output.
	#[serde(with = "humantime_serde")]
	pub segment_duration: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			linger: Duration::from_secs(30),
			stall_threshold: Duration::from_secs(30),
			health_interval: Duration::from_secs(5),
			client_queue_bytes: 4 * 1024 * 1024,
			drain_deadline: Duration::from_secs(5),
			shutdown_timeout: Duration::from_secs(10),
			segment_duration: Duration::from_secs(4),
		}
	}
}
