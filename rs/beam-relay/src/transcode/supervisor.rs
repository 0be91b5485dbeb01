//! Supervision of the external encoder subprocess.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::TranscodeConfig;
use crate::stats::ByteCounter;
use crate::transcode::{ResourceMonitor, ResourceStats};
use crate::{Error, Result};

/// Grace between SIGTERM and SIGKILL on shutdown.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Where the supervisor delivers encoder output. The session implements
/// this with a demuxer feeding the variant buffer.
pub trait IngestSink: Send {
	fn write(&mut self, chunk: &[u8]) -> Result<()>;
}

/// A point-in-time view of the supervised process.
#[derive(Debug, Clone, Default)]
pub struct TranscoderStats {
	pub pid: Option<u32>,
	pub attempt: u32,
	pub uptime: Option<Duration>,
	pub resources: ResourceStats,
}

struct State {
	pid: Option<u32>,
	attempt: u32,
	started_at: Option<Instant>,
	stderr: VecDeque<String>,
	monitor: Option<Arc<ResourceMonitor>>,
}

/// Supervises one encoder subprocess writing into a variant buffer.
///
/// At most one process is alive per handle. Exits within `min_run_time`
/// are treated as startup flaps and retried with exponential backoff; an
/// exit after that is fatal and surfaced to the session.
pub struct Transcoder {
	config: TranscodeConfig,
	args: Vec<String>,
	session_id: String,
	bytes: Arc<ByteCounter>,
	state: Arc<Mutex<State>>,
}

impl Transcoder {
	pub fn new(config: TranscodeConfig, args: Vec<String>, session_id: String) -> Self {
		Self {
			config,
			args,
			session_id,
			bytes: Arc::new(ByteCounter::new()),
			state: Arc::new(Mutex::new(State {
				pid: None,
				attempt: 0,
				started_at: None,
				stderr: VecDeque::new(),
				monitor: None,
			})),
		}
	}

	pub fn args(&self) -> &[String] {
		&self.args
	}

	pub fn stats(&self) -> TranscoderStats {
		let state = self.state.lock();
		TranscoderStats {
			pid: state.pid,
			attempt: state.attempt,
			uptime: state.started_at.map(|t| t.elapsed()),
			resources: state
				.monitor
				.as_ref()
				.map(|m| m.stats())
				.unwrap_or_default(),
		}
	}

	/// The most recent stderr lines, oldest first.
	pub fn recent_stderr(&self) -> Vec<String> {
		self.state.lock().stderr.iter().cloned().collect()
	}

	/// Run the spawn/monitor/retry loop until the encoder fails hard or
	/// `shutdown` flips to true. Output bytes land in `sink` as they
	/// arrive.
	#[tracing::instrument(skip_all, fields(session = %self.session_id))]
	pub async fn run<S: IngestSink>(
		&self,
		sink: &mut S,
		mut shutdown: watch::Receiver<bool>,
	) -> Result<()> {
		loop {
			let attempt = {
				let mut state = self.state.lock();
				state.attempt += 1;
				state.attempt
			};

			tracing::info!(attempt, "starting encoder");
			match self.run_once(sink, &mut shutdown).await? {
				RunOutcome::Shutdown => return Ok(()),
				RunOutcome::Exited { runtime, reason } => {
					if runtime >= self.config.min_run_time {
						tracing::error!(?runtime, %reason, "encoder died after healthy start");
						return Err(Error::TranscoderRuntime { runtime, reason });
					}

					if attempt >= self.config.max_attempts {
						tracing::error!(attempt, %reason, "encoder startup failed; giving up");
						return Err(Error::TranscoderStartup {
							attempts: attempt,
							reason,
						});
					}

					let backoff = self
						.config
						.backoff_base
						.saturating_mul(1 << (attempt - 1))
						.min(self.config.backoff_cap);
					tracing::warn!(attempt, ?runtime, ?backoff, %reason, "encoder flapped; retrying");

					tokio::select! {
						_ = tokio::time::sleep(backoff) => {}
						changed = shutdown.changed() => {
							if changed.is_err() || *shutdown.borrow() {
								return Ok(());
							}
						}
					}
				}
			}
		}
	}

	async fn run_once<S: IngestSink>(
		&self,
		sink: &mut S,
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<RunOutcome> {
		let started = Instant::now();
		let spawned = Command::new(&self.config.ffmpeg)
			.args(&self.args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn();

		let mut child = match spawned {
			Ok(child) => child,
			Err(err) => {
				return Ok(RunOutcome::Exited {
					runtime: Duration::ZERO,
					reason: format!("spawn failed: {err}"),
				});
			}
		};

		let pid = child.id();
		{
			let mut state = self.state.lock();
			state.pid = pid;
			state.started_at = Some(started);
			state.monitor = pid.map(|pid| Arc::new(ResourceMonitor::spawn(pid, self.bytes.clone())));
		}

		let mut log = self.open_log().await;
		if let Some(log) = log.as_mut() {
			let header = format!(
				"[{}] session={} attempt={} exec: {} {}\n",
				humantime::format_rfc3339_seconds(SystemTime::now()),
				self.session_id,
				self.state.lock().attempt,
				self.config.ffmpeg,
				self.args.join(" "),
			);
			let _ = log.write_all(header.as_bytes()).await;
		}

		// stderr drains into the in-memory ring and the log file.
		let stderr = child.stderr.take().expect("stderr piped");
		let stderr_task = {
			let state = self.state.clone();
			let ring_lines = self.config.stderr_ring_lines;
			let mut log = log;
			tokio::spawn(async move {
				let mut lines = BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					if let Some(log) = log.as_mut() {
						let _ = log.write_all(line.as_bytes()).await;
						let _ = log.write_all(b"\n").await;
					}
					let mut state = state.lock();
					if state.stderr.len() >= ring_lines {
						state.stderr.pop_front();
					}
					state.stderr.push_back(line);
				}
				log
			})
		};

		let mut stdout = child.stdout.take().expect("stdout piped");
		let mut buf = vec![0u8; 64 * 1024];
		let mut seen_output = false;
		let startup_deadline = tokio::time::sleep(self.config.min_run_time * 2);
		tokio::pin!(startup_deadline);
		let mut requested_shutdown = false;
		let mut startup_timeout = false;

		loop {
			tokio::select! {
				read = stdout.read(&mut buf) => {
					match read {
						Ok(0) => break,
						Ok(n) => {
							seen_output = true;
							self.bytes.add(n as u64);
							sink.write(&buf[..n])?;
						}
						Err(err) => {
							tracing::warn!(%err, "encoder stdout read failed");
							break;
						}
					}
				}
				_ = &mut startup_deadline, if !seen_output => {
					tracing::warn!("no encoder output within the startup deadline");
					startup_timeout = true;
					self.terminate(&mut child).await;
					break;
				}
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						requested_shutdown = true;
						self.terminate(&mut child).await;
						break;
					}
				}
			}
		}

		let status = child.wait().await;
		let runtime = started.elapsed();
		let mut log = stderr_task.await.unwrap_or(None);

		let reason = {
			let state = self.state.lock();
			let last_line = state.stderr.back().cloned().unwrap_or_default();
			match &status {
				Ok(status) if startup_timeout => format!("startup deadline exceeded ({status})"),
				Ok(status) => format!("{status}; last stderr: {last_line}"),
				Err(err) => format!("wait failed: {err}"),
			}
		};

		{
			let mut state = self.state.lock();
			state.pid = None;
			state.monitor = None;
		}

		if let Some(log) = log.as_mut() {
			let footer = format!(
				"[{}] session={} exit after {:.1}s: {}\n",
				humantime::format_rfc3339_seconds(SystemTime::now()),
				self.session_id,
				runtime.as_secs_f64(),
				reason,
			);
			let _ = log.write_all(footer.as_bytes()).await;
			let _ = log.flush().await;
		}

		if requested_shutdown {
			return Ok(RunOutcome::Shutdown);
		}

		// A startup timeout always counts as a failed start, even though
		// the wall clock ran past min_run_time waiting for output.
		let runtime = if startup_timeout { Duration::ZERO } else { runtime };
		Ok(RunOutcome::Exited { runtime, reason })
	}

	/// TERM first so the encoder can flush, KILL when it doesn't.
	async fn terminate(&self, child: &mut tokio::process::Child) {
		#[cfg(unix)]
		if let Some(pid) = child.id() {
			let _ = nix::sys::signal::kill(
				nix::unistd::Pid::from_raw(pid as i32),
				nix::sys::signal::Signal::SIGTERM,
			);
			if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
				return;
			}
			tracing::warn!(pid, "encoder ignored SIGTERM");
		}

		let _ = child.kill().await;
	}

	async fn open_log(&self) -> Option<tokio::fs::File> {
		let dir = self.config.stderr_log_dir.as_ref()?;
		let path = dir.join(format!("{}.log", self.session_id));

		let mut options = tokio::fs::OpenOptions::new();
		options.create(true).append(true);
		#[cfg(unix)]
		options.mode(0o640);

		match options.open(&path).await {
			Ok(file) => Some(file),
			Err(err) => {
				tracing::warn!(?path, %err, "cannot open encoder log");
				None
			}
		}
	}
}

enum RunOutcome {
	Shutdown,
	Exited { runtime: Duration, reason: String },
}
