//! The source prober: runs the external probe binary and normalizes its
//! JSON into a stream description.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use beam_media::registry;
use beam_media::{Disposition, StreamKind, TrackInfo};

use crate::config::ProbeConfig;
use crate::{Error, Result};

/// How much of the source to examine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
	/// Bounded analyze window: enough for codecs, geometry and a liveness
	/// guess.
	Quick,
	/// Full format and stream analysis.
	Deep,
}

/// Normalized description of an upstream source.
#[derive(Debug, Clone)]
pub struct SourceProbe {
	/// Container short name as reported (e.g. `mpegts`, `hls`).
	pub container: String,
	/// Zero for live sources.
	pub duration_secs: f64,
	/// Whether this looks like a live stream rather than a file.
	pub live: bool,
	pub tracks: Vec<TrackInfo>,
}

impl SourceProbe {
	/// The default video track: `disposition.default` first, then index
	/// order.
	pub fn primary_video(&self) -> Option<&TrackInfo> {
		self.primary(StreamKind::Video)
	}

	pub fn primary_audio(&self) -> Option<&TrackInfo> {
		self.primary(StreamKind::Audio)
	}

	fn primary(&self, kind: StreamKind) -> Option<&TrackInfo> {
		self.tracks
			.iter()
			.filter(|t| t.kind == kind)
			.find(|t| t.disposition.default)
			.or_else(|| self.tracks.iter().find(|t| t.kind == kind))
	}
}

/// Runs the external probe binary.
pub struct Prober {
	config: ProbeConfig,
}

impl Prober {
	pub fn new(config: ProbeConfig) -> Self {
		Self { config }
	}

	/// The argv for a probe run, without the binary itself.
	/// Deterministic, so decisions derived from it are reproducible.
	pub fn args(&self, url: &str, mode: ProbeMode) -> Vec<String> {
		let mut args: Vec<String> = vec![
			"-v".into(),
			"quiet".into(),
			"-print_format".into(),
			"json".into(),
			"-show_format".into(),
			"-show_streams".into(),
		];

		if mode == ProbeMode::Quick {
			args.push("-analyzeduration".into());
			args.push(self.config.quick_analyze_micros.to_string());
			args.push("-probesize".into());
			args.push(self.config.quick_probe_bytes.to_string());
		}

		if url.starts_with("http://") || url.starts_with("https://") {
			args.extend(
				["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "2"]
					.iter()
					.map(|s| s.to_string()),
			);
		}

		args.push("-i".into());
		args.push(url.into());
		args
	}

	#[tracing::instrument(skip(self), fields(mode = ?ProbeMode::Quick))]
	pub async fn quick(&self, url: &str) -> Result<SourceProbe> {
		self.run(url, ProbeMode::Quick, self.config.quick_timeout).await
	}

	#[tracing::instrument(skip(self), fields(mode = ?ProbeMode::Deep))]
	pub async fn deep(&self, url: &str) -> Result<SourceProbe> {
		self.run(url, ProbeMode::Deep, self.config.deep_timeout).await
	}

	async fn run(&self, url: &str, mode: ProbeMode, timeout: Duration) -> Result<SourceProbe> {
		let output = Command::new(&self.config.ffprobe)
			.args(self.args(url, mode))
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.output();

		let output = tokio::time::timeout(timeout, output)
			.await
			.map_err(|_| Error::ProbeTimeout(timeout))?
			.map_err(|err| Error::ProbeFailed(err.to_string()))?;

		if !output.status.success() {
			return Err(Error::ProbeFailed(format!("probe exited with {}", output.status)));
		}

		let probe = parse_output(&output.stdout)?;
		tracing::debug!(
			container = %probe.container,
			tracks = probe.tracks.len(),
			live = probe.live,
			"probe complete"
		);
		Ok(probe)
	}
}

// The slice of ffprobe's JSON output the relay consumes.

#[derive(Deserialize)]
struct FfprobeOutput {
	#[serde(default)]
	format: Option<FfprobeFormat>,
	#[serde(default)]
	streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
	#[serde(default)]
	format_name: String,
	#[serde(default)]
	duration: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
	index: usize,
	#[serde(default)]
	codec_type: Option<String>,
	#[serde(default)]
	codec_name: Option<String>,
	#[serde(default)]
	profile: Option<String>,
	#[serde(default)]
	level: Option<i64>,
	#[serde(default)]
	width: Option<u32>,
	#[serde(default)]
	height: Option<u32>,
	#[serde(default)]
	channels: Option<u32>,
	#[serde(default)]
	sample_rate: Option<String>,
	#[serde(default)]
	disposition: Option<FfprobeDisposition>,
	#[serde(default)]
	tags: Option<FfprobeTags>,
}

#[derive(Deserialize)]
struct FfprobeDisposition {
	#[serde(default)]
	default: i32,
	#[serde(default)]
	forced: i32,
}

#[derive(Deserialize)]
struct FfprobeTags {
	#[serde(default)]
	language: Option<String>,
}

/// Parse probe stdout into a [SourceProbe]. Split out for testability.
fn parse_output(stdout: &[u8]) -> Result<SourceProbe> {
	let output: FfprobeOutput =
		serde_json::from_slice(stdout).map_err(|err| Error::ProbeParse(err.to_string()))?;

	if output.streams.is_empty() {
		return Err(Error::NoStreams);
	}

	let (container, duration_secs) = match output.format {
		Some(format) => {
			let duration = format
				.duration
				.as_deref()
				.and_then(|d| d.parse::<f64>().ok())
				.unwrap_or(0.0);
			(format.format_name, duration)
		}
		None => (String::new(), 0.0),
	};

	// Live when there's no duration, or the container is a live one.
	let live = duration_secs == 0.0
		|| container.split(',').any(|name| name == "hls" || name == "mpegts");

	let tracks = output
		.streams
		.into_iter()
		.map(|stream| {
			let kind = match stream.codec_type.as_deref() {
				Some("video") => StreamKind::Video,
				Some("audio") => StreamKind::Audio,
				Some("subtitle") => StreamKind::Subtitle,
				_ => StreamKind::Other,
			};

			TrackInfo {
				index: stream.index,
				kind,
				codec: registry::normalize(stream.codec_name.as_deref().unwrap_or("")),
				profile: stream.profile,
				level: stream.level,
				width: stream.width,
				height: stream.height,
				channels: stream.channels,
				sample_rate: stream.sample_rate.and_then(|s| s.parse().ok()),
				language: stream.tags.and_then(|t| t.language),
				disposition: stream
					.disposition
					.map(|d| Disposition {
						default: d.default != 0,
						forced: d.forced != 0,
					})
					.unwrap_or_default(),
			}
		})
		.collect();

	Ok(SourceProbe {
		container,
		duration_secs,
		live,
		tracks,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn prober() -> Prober {
		Prober::new(ProbeConfig::default())
	}

	#[test]
	fn quick_args_bound_the_analysis() {
		let args = prober().args("http://example.com/stream.ts", ProbeMode::Quick);
		let joined = args.join(" ");
		assert!(joined.contains("-analyzeduration 500000"));
		assert!(joined.contains("-probesize 2000000"));
		assert!(joined.contains("-reconnect 1"));
		assert!(joined.ends_with("-i http://example.com/stream.ts"));
	}

	#[test]
	fn deep_args_skip_bounds_and_local_files_skip_reconnect() {
		let args = prober().args("/media/show.mkv", ProbeMode::Deep);
		let joined = args.join(" ");
		assert!(!joined.contains("-analyzeduration"));
		assert!(!joined.contains("-reconnect"));
	}

	const SAMPLE: &str = r#"{
		"format": { "format_name": "mpegts", "duration": "0.0" },
		"streams": [
			{
				"index": 0,
				"codec_type": "video",
				"codec_name": "hevc",
				"profile": "Main",
				"level": 120,
				"width": 1920,
				"height": 1080,
				"disposition": { "default": 1, "forced": 0 }
			},
			{
				"index": 1,
				"codec_type": "audio",
				"codec_name": "ac3",
				"channels": 6,
				"sample_rate": "48000",
				"tags": { "language": "eng" }
			},
			{
				"index": 2,
				"codec_type": "audio",
				"codec_name": "aac",
				"channels": 2,
				"sample_rate": "44100",
				"disposition": { "default": 1, "forced": 0 }
			}
		]
	}"#;

	#[test]
	fn parses_and_normalizes_streams() {
		let probe = parse_output(SAMPLE.as_bytes()).unwrap();
		assert!(probe.live);
		assert_eq!(probe.container, "mpegts");

		let video = probe.primary_video().unwrap();
		assert_eq!(video.codec, "h265");
		assert_eq!(video.width, Some(1920));

		// The default-flagged audio wins over the lower index.
		let audio = probe.primary_audio().unwrap();
		assert_eq!(audio.index, 2);
		assert_eq!(audio.codec, "aac");
		assert_eq!(audio.sample_rate, Some(44_100));
	}

	#[test]
	fn no_streams_is_a_distinct_error() {
		let err = parse_output(br#"{ "format": { "format_name": "mpegts" }, "streams": [] }"#)
			.unwrap_err();
		assert!(matches!(err, Error::NoStreams));
		assert!(err.is_recoverable());
	}

	#[test]
	fn garbage_is_a_parse_error() {
		let err = parse_output(b"not json").unwrap_err();
		assert!(matches!(err, Error::ProbeParse(_)));
	}

	#[test]
	fn vod_files_are_not_live() {
		let probe = parse_output(
			br#"{
				"format": { "format_name": "matroska,webm", "duration": "5400.5" },
				"streams": [ { "index": 0, "codec_type": "video", "codec_name": "h264" } ]
			}"#,
		)
		.unwrap();
		assert!(!probe.live);
		assert_eq!(probe.duration_secs, 5400.5);
	}
}
