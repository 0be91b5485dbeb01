//! The session manager: the crate's public attach/detach surface.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RelayConfig;
use crate::route::EncoderInventory;
use crate::session::{AttachRequest, ClientStream, ProbeBackend, Session, SessionInfo, SessionKey};
use crate::{Error, Result};

/// Owns every session and enforces one ingest per (channel, profile).
pub struct SessionManager {
	config: RelayConfig,
	encoders: EncoderInventory,
	probe: Arc<ProbeBackend>,
	sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
	janitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
	/// The production setup: ffprobe for probing, software encoders
	/// assumed until [EncoderInventory] says otherwise.
	pub fn new(config: RelayConfig) -> Arc<Self> {
		let probe = ProbeBackend::ffprobe(config.probe.clone());
		Self::with_parts(config, EncoderInventory::software_only(), probe)
	}

	/// Full control over the collaborators; how embedders inject a known
	/// encoder inventory or a static probe.
	pub fn with_parts(
		config: RelayConfig,
		encoders: EncoderInventory,
		probe: ProbeBackend,
	) -> Arc<Self> {
		let manager = Arc::new(Self {
			config,
			encoders,
			probe: Arc::new(probe),
			sessions: Mutex::new(HashMap::new()),
			janitor: Mutex::new(None),
		});
		manager.start_janitor();
		manager
	}

	/// Reap errored sessions and empty ones whose linger expired.
	fn start_janitor(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let interval = self.config.session.health_interval;
		let linger = self.config.session.linger;

		let task = tokio::spawn(async move {
			let mut ticks = tokio::time::interval(interval);
			ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticks.tick().await;
				let Some(manager) = weak.upgrade() else { return };

				let expired: Vec<Arc<Session>> = {
					let mut sessions = manager.sessions.lock();
					let dead: Vec<SessionKey> = sessions
						.iter()
						.filter(|(_, session)| {
							session.is_dead()
								|| session.empty_for().map(|d| d >= linger).unwrap_or(false)
						})
						.map(|(key, _)| key.clone())
						.collect();
					dead.iter().filter_map(|key| sessions.remove(key)).collect()
				};

				for session in expired {
					tracing::info!(session = %session.id(), "reaping session");
					session.shutdown();
				}
			}
		});

		*self.janitor.lock() = Some(task);
	}

	/// Connect a client, creating the session on first use.
	pub fn attach(self: &Arc<Self>, request: AttachRequest) -> Result<ClientStream> {
		let key = SessionKey {
			channel: request.channel.clone(),
			profile: request.profile.clone(),
		};

		// Two tries: a session that died since the map was read is replaced.
		for _ in 0..2 {
			let session = {
				let mut sessions = self.sessions.lock();
				match sessions.get(&key) {
					Some(session) if !session.is_dead() => session.clone(),
					_ => {
						let session = Session::spawn(
							key.clone(),
							request.clone(),
							self.config.clone(),
							self.encoders.clone(),
							self.probe.clone(),
						);
						sessions.insert(key.clone(), session.clone());
						session
					}
				}
			};

			match session.attach_client(&request) {
				Ok(stream) => return Ok(stream),
				Err(Error::SessionClosed) => {
					self.sessions.lock().remove(&key);
				}
				Err(err) => return Err(err),
			}
		}

		Err(Error::SessionClosed)
	}

	/// Disconnect one client, wherever it is.
	pub fn detach(&self, client_id: &str) -> Result<()> {
		let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
		for session in sessions {
			if session.detach_client(client_id).is_ok() {
				return Ok(());
			}
		}
		Err(Error::NotFound(format!("client {client_id}")))
	}

	pub fn list_sessions(&self) -> Vec<SessionInfo> {
		let sessions: Vec<Arc<Session>> = self.sessions.lock().values().cloned().collect();
		let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
		infos.sort_by(|a, b| a.id.cmp(&b.id));
		infos
	}

	pub fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
		self.sessions
			.lock()
			.values()
			.find(|s| s.id() == session_id)
			.map(|s| s.info())
			.ok_or_else(|| Error::NotFound(format!("session {session_id}")))
	}

	/// The admin hammer: tear a session down now, clients included.
	pub fn kill_session(&self, session_id: &str) -> Result<()> {
		let session = {
			let mut sessions = self.sessions.lock();
			let key = sessions
				.iter()
				.find(|(_, s)| s.id() == session_id)
				.map(|(k, _)| k.clone())
				.ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
			sessions.remove(&key).expect("key just found")
		};

		tracing::info!(session = %session_id, "killing session");
		session.shutdown();
		Ok(())
	}

	/// Tear everything down.
	pub fn shutdown(&self) {
		let sessions: Vec<Arc<Session>> = {
			let mut map = self.sessions.lock();
			map.drain().map(|(_, s)| s).collect()
		};
		for session in sessions {
			session.shutdown();
		}
	}
}

impl Drop for SessionManager {
	fn drop(&mut self) {
		if let Some(task) = self.janitor.lock().take() {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	use bytes::{BufMut, Bytes, BytesMut};

	use beam_media::demux::{Fmp4Demuxer, TsDemuxer, TsEvent};
	use beam_media::mux::{TsMuxer, TsMuxerConfig};
	use beam_media::registry::{AudioCodec, Container, HwAccel, VideoCodec};
	use beam_media::{Disposition, MuxSample, StreamKind, Timestamp, TrackInfo, TrackKind};

	use crate::probe::SourceProbe;
	use crate::route::RouteType;
	use crate::session::{StreamEvent, TerminalStatus};

	const SPS: &[u8] = &[
		0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01, 0x01, 0x01, 0x40,
		0x00, 0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01,
	];
	const PPS: &[u8] = &[0x68, 0xee, 0x3c, 0x80];

	fn annexb_au(units: &[&[u8]]) -> Bytes {
		let mut out = BytesMut::new();
		for unit in units {
			out.put_slice(&[0, 0, 0, 1]);
			out.put_slice(unit);
		}
		out.freeze()
	}

	fn adts_frame(payload: &[u8]) -> Bytes {
		let frame_len = 7 + payload.len();
		let mut out = vec![
			0xFF,
			0xF1,
			(1 << 6) | (3 << 2),
			(2 << 6) | ((frame_len >> 11) as u8 & 0x03),
			(frame_len >> 3) as u8,
			((frame_len as u8 & 0x07) << 5) | 0x1F,
			0xFC,
		];
		out.extend_from_slice(payload);
		Bytes::from(out)
	}

	/// A few seconds of synthetic H264+AAC transport stream.
	fn synthetic_ts(gops: u64) -> Vec<u8> {
		let mut muxer = TsMuxer::new(
			Some(VideoCodec::H264),
			Some(AudioCodec::Aac),
			TsMuxerConfig::default(),
		)
		.unwrap();

		let mut out = Vec::new();
		for g in 0..gops {
			for f in 0..12u64 {
				let dts = (g * 12 + f) * 3600;
				let keyframe = f == 0;
				let payload = if keyframe {
					annexb_au(&[SPS, PPS, &[0x65, 0x88, 0x84, 0x00, 0x1f, 0xff]])
				} else {
					annexb_au(&[&[0x41, 0x9a, 0x24, 0x6c, 0x41, 0x4f]])
				};
				let sample = MuxSample {
					kind: TrackKind::Video,
					payload,
					pts: Timestamp::from_ticks(dts),
					dts: Timestamp::from_ticks(dts),
					duration: Timestamp::from_ticks(3600),
					keyframe,
				};
				out.extend_from_slice(&muxer.write(&sample).unwrap());

				let audio = MuxSample {
					kind: TrackKind::Audio,
					payload: adts_frame(&[0x21, 0x10, f as u8]),
					pts: Timestamp::from_ticks(dts),
					dts: Timestamp::from_ticks(dts),
					duration: Timestamp::from_ticks(1920),
					keyframe: true,
				};
				out.extend_from_slice(&muxer.write(&audio).unwrap());
			}
		}
		out
	}

	fn track(index: usize, kind: StreamKind, codec: &str) -> TrackInfo {
		TrackInfo {
			index,
			kind,
			codec: codec.to_string(),
			profile: None,
			level: None,
			width: Some(1280),
			height: Some(720),
			channels: Some(2),
			sample_rate: Some(48_000),
			language: None,
			disposition: Disposition {
				default: true,
				forced: false,
			},
		}
	}

	fn ts_probe(video: &str, audio: &str) -> SourceProbe {
		SourceProbe {
			container: "mpegts".to_string(),
			duration_secs: 0.0,
			live: true,
			tracks: vec![
				track(0, StreamKind::Video, video),
				track(1, StreamKind::Audio, audio),
			],
		}
	}

	fn test_config() -> RelayConfig {
		let mut config = RelayConfig::default();
		config.session.linger = Duration::from_millis(300);
		config.session.health_interval = Duration::from_millis(50);
		config.session.stall_threshold = Duration::from_secs(5);
		config
	}

	fn manager_for(probe: SourceProbe, config: RelayConfig) -> Arc<SessionManager> {
		SessionManager::with_parts(
			config,
			EncoderInventory::software_only(),
			ProbeBackend::Static(probe),
		)
	}

	fn request(url: &str, container: Container) -> AttachRequest {
		AttachRequest {
			channel: "one".to_string(),
			profile: "default".to_string(),
			upstream_url: url.to_string(),
			container,
			video: Some("h264".to_string()),
			audio: Some("aac".to_string()),
			hwaccel: HwAccel::None,
			remote_addr: Some("10.0.0.7:41000".to_string()),
			user_agent: Some("test-client".to_string()),
		}
	}

	fn temp_media(name: &str, data: &[u8]) -> std::path::PathBuf {
		let path = std::env::temp_dir().join(format!("beam-{}-{}", std::process::id(), name));
		std::fs::write(&path, data).unwrap();
		path
	}

	/// Drain a client stream until the terminal event or a quiet period.
	async fn collect(stream: &mut ClientStream) -> (Vec<u8>, Option<TerminalStatus>) {
		let mut data = Vec::new();
		loop {
			match tokio::time::timeout(Duration::from_secs(2), stream.recv()).await {
				Ok(Some(StreamEvent::Data(chunk))) => data.extend_from_slice(&chunk),
				Ok(Some(StreamEvent::Terminal(status))) => return (data, Some(status)),
				Ok(None) | Err(_) => return (data, None),
			}
		}
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn passthrough_ts_serves_ts_without_subprocess() {
		let (path, writer) = live_source("passthrough", synthetic_ts(4));
		let manager = manager_for(ts_probe("h264", "aac"), test_config());

		let mut stream = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();
		let _writer = writer.await.unwrap();

		// Route is decided before the first samples flow.
		tokio::time::sleep(Duration::from_millis(200)).await;
		let sessions = manager.list_sessions();
		assert_eq!(sessions.len(), 1);
		assert_eq!(sessions[0].route, Some(RouteType::Passthrough));
		assert!(sessions[0].transcoder.is_none(), "no subprocess for passthrough");
		assert_eq!(sessions[0].clients.len(), 1);

		let (data, _) = collect(&mut stream).await;
		assert!(!data.is_empty());

		// Output is valid TS: PAT first, then our program and samples.
		assert_eq!(data[0], 0x47);
		let mut demuxer = TsDemuxer::new();
		let mut buf = BytesMut::from(&data[..]);
		demuxer.push(&mut buf);

		let mut video = 0;
		let mut audio = 0;
		let mut saw_programs = false;
		while let Some(event) = demuxer.next().unwrap() {
			match event {
				TsEvent::Programs(streams) => {
					saw_programs = true;
					assert_eq!(streams[0].stream_type, 0x1B);
				}
				TsEvent::Sample(sample) => match sample.kind {
					TrackKind::Video => video += 1,
					TrackKind::Audio => audio += 1,
				},
				TsEvent::Discontinuity { .. } => {}
			}
		}
		assert!(saw_programs);
		assert!(video >= 12, "one upstream pass of video frames, got {video}");
		assert!(audio >= 12);

		let _ = std::fs::remove_file(path);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn repackage_ts_to_fmp4_emits_init_then_avcc_fragments() {
		let (path, writer) = live_source("repackage", synthetic_ts(4));
		let mut config = test_config();
		// Short segments so the tail GOP flushes without waiting for the
		// next keyframe.
		config.session.segment_duration = Duration::from_millis(200);
		let manager = manager_for(ts_probe("h264", "aac"), config);

		let mut request = request(path.to_str().unwrap(), Container::Fmp4);
		request.video = None;
		request.audio = None;
		let mut stream = manager.attach(request).unwrap();
		let _writer = writer.await.unwrap();

		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(manager.list_sessions()[0].route, Some(RouteType::Repackage));

		let (data, _) = collect(&mut stream).await;
		assert_eq!(&data[4..8], b"ftyp", "init segment comes first");

		let mut demuxer = Fmp4Demuxer::new();
		let mut buf = BytesMut::from(&data[..]);
		demuxer.push(&mut buf);

		let mut video = 0;
		let mut audio = 0;
		while let Some(sample) = demuxer.next().unwrap() {
			match sample.kind {
				TrackKind::Video => {
					video += 1;
					// AVCC framing: the first four bytes are a NAL length.
					let len = u32::from_be_bytes([
						sample.payload[0],
						sample.payload[1],
						sample.payload[2],
						sample.payload[3],
					]) as usize;
					assert!(len <= sample.payload.len() - 4);
				}
				TrackKind::Audio => {
					audio += 1;
					// The ADTS syncword must not survive into fragments.
					assert!(
						!(sample.payload[0] == 0xFF && sample.payload[1] & 0xF0 == 0xF0),
						"ADTS header leaked into fMP4"
					);
				}
			}
		}
		assert!(video >= 12, "got {video}");
		assert!(audio >= 12, "got {audio}");

		let _ = std::fs::remove_file(path);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn placeholder_prelude_precedes_real_samples() {
		use beam_media::placeholder::placeholder;
		use beam_media::Variant;

		let fifo = std::env::temp_dir().join(format!("beam-fifo-{}", std::process::id()));
		let _ = std::fs::remove_file(&fifo);
		nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o644)).unwrap();

		let manager = manager_for(ts_probe("h264", "aac"), test_config());
		let mut stream = manager.attach(request(fifo.to_str().unwrap(), Container::Fmp4)).unwrap();

		// Upstream produces nothing yet: the first bytes must be the canned
		// H264+AAC prelude.
		let prelude = placeholder(&Variant::new(VideoCodec::H264, AudioCodec::Aac)).unwrap();
		let first = match stream.recv().await {
			Some(StreamEvent::Data(data)) => data,
			other => panic!("expected prelude, got {other:?}"),
		};
		assert_eq!(first, prelude.init);
		let second = match stream.recv().await {
			Some(StreamEvent::Data(data)) => data,
			other => panic!("expected prelude segment, got {other:?}"),
		};
		assert_eq!(second, prelude.segment);

		// Now the upstream starts producing; the client must seamlessly
		// receive real fragments (a fresh init, then media). The write side
		// stays open so the stream keeps looking live.
		let fifo_writer = fifo.clone();
		let writer = tokio::task::spawn_blocking(move || {
			use std::io::Write;
			let mut file = std::fs::OpenOptions::new().write(true).open(fifo_writer).unwrap();
			file.write_all(&synthetic_ts(4)).unwrap();
			file.flush().unwrap();
			file
		});

		let (data, _) = collect(&mut stream).await;
		let _writer = writer.await.unwrap();
		assert!(!data.is_empty(), "real samples follow the placeholder");
		assert_eq!(&data[4..8], b"ftyp", "a fresh init segment precedes real media");

		let _ = std::fs::remove_file(&fifo);
	}

	#[tokio::test]
	async fn transcode_route_spawns_encoder_and_surfaces_startup_failure() {
		let ts = synthetic_ts(2);
		let path = temp_media("transcode.ts", &ts);

		let mut config = test_config();
		config.transcode.ffmpeg = "/nonexistent/ffmpeg".to_string();
		config.transcode.max_attempts = 2;
		config.transcode.backoff_base = Duration::from_millis(20);

		// HEVC source, H264 target: the route must transcode.
		let manager = manager_for(ts_probe("hevc", "ac3"), config);
		let mut stream = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();

		tokio::time::sleep(Duration::from_millis(30)).await;
		// The session may already be reaped if both attempts burned fast;
		// when it is still visible it must be on the transcode route.
		if let Some(info) = manager.list_sessions().first() {
			assert_eq!(info.route, Some(RouteType::Transcode));
		}

		let (_, terminal) = collect(&mut stream).await;
		match terminal {
			Some(TerminalStatus::Error(message)) => {
				assert!(message.contains("transcoder"), "got: {message}");
			}
			other => panic!("expected a session error, got {other:?}"),
		}

		let _ = std::fs::remove_file(path);
	}

	/// A FIFO-backed upstream that stays open, so the session lives until
	/// the test drops the write side. The writer task blocks until a
	/// session actually opens the FIFO, so await it only after attaching.
	#[cfg(unix)]
	fn live_source(
		name: &str,
		data: Vec<u8>,
	) -> (std::path::PathBuf, tokio::task::JoinHandle<std::fs::File>) {
		let path = std::env::temp_dir().join(format!("beam-live-{}-{}", std::process::id(), name));
		let _ = std::fs::remove_file(&path);
		nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o644)).unwrap();

		let writer_path = path.clone();
		let writer = tokio::task::spawn_blocking(move || {
			use std::io::Write;
			let mut file = std::fs::OpenOptions::new().write(true).open(writer_path).unwrap();
			file.write_all(&data).unwrap();
			file.flush().unwrap();
			file
		});

		(path, writer)
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn stalled_encoder_is_torn_down_and_surfaced() {
		use std::os::unix::fs::PermissionsExt;

		// A stand-in encoder that emits one burst of garbage and then sits
		// idle forever without exiting.
		let script = std::env::temp_dir().join(format!("beam-stall-{}.sh", std::process::id()));
		std::fs::write(&script, "#!/bin/sh\nprintf garbage\nsleep 30\n").unwrap();
		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

		let ts = synthetic_ts(2);
		let path = temp_media("stall.ts", &ts);

		let mut config = test_config();
		config.transcode.ffmpeg = script.to_str().unwrap().to_string();
		config.session.stall_threshold = Duration::from_millis(300);
		config.session.health_interval = Duration::from_millis(50);

		// HEVC source, H264 target: the encoder path carries the session.
		let manager = manager_for(ts_probe("hevc", "ac3"), config);
		let mut stream = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();

		let (_, terminal) = collect(&mut stream).await;
		match terminal {
			Some(TerminalStatus::Error(message)) => {
				assert!(message.contains("no data"), "got: {message}");
			}
			other => panic!("expected a stall error, got {other:?}"),
		}

		let _ = std::fs::remove_file(script);
		let _ = std::fs::remove_file(path);
	}

	#[tokio::test]
	async fn linger_reaps_empty_sessions() {
		let ts = synthetic_ts(2);
		let path = temp_media("linger.ts", &ts);
		let manager = manager_for(ts_probe("h264", "aac"), test_config());

		let stream = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();
		assert_eq!(manager.list_sessions().len(), 1);
		let _ = manager.detach(&stream.client_id);

		tokio::time::sleep(Duration::from_millis(700)).await;
		assert!(manager.list_sessions().is_empty(), "session should linger out");

		let _ = std::fs::remove_file(path);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn kill_session_disconnects_clients() {
		let (path, writer) = live_source("kill", synthetic_ts(8));
		let manager = manager_for(ts_probe("h264", "aac"), test_config());

		let mut stream = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();
		let _writer = writer.await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;

		let id = manager.list_sessions()[0].id.clone();
		manager.kill_session(&id).unwrap();
		assert!(manager.list_sessions().is_empty());
		assert!(matches!(manager.session_info(&id), Err(Error::NotFound(_))));

		let (_, terminal) = collect(&mut stream).await;
		assert_eq!(terminal, Some(TerminalStatus::Shutdown));

		let _ = std::fs::remove_file(path);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn two_clients_share_one_session() {
		let (path, writer) = live_source("shared", synthetic_ts(6));
		let manager = manager_for(ts_probe("h264", "aac"), test_config());

		let mut a = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();
		let mut b = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();
		let _writer = writer.await.unwrap();
		assert_eq!(a.session_id, b.session_id, "same key, same session");
		assert_eq!(manager.list_sessions().len(), 1);

		let ((data_a, _), (data_b, _)) = tokio::join!(collect(&mut a), collect(&mut b));
		assert!(!data_a.is_empty());
		assert!(!data_b.is_empty());

		let _ = std::fs::remove_file(path);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn session_info_serializes() {
		let (path, writer) = live_source("info", synthetic_ts(2));
		let manager = manager_for(ts_probe("h264", "aac"), test_config());

		let _stream = manager.attach(request(path.to_str().unwrap(), Container::MpegTs)).unwrap();
		let _writer = writer.await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;

		let info = &manager.list_sessions()[0];
		let json = serde_json::to_value(info).unwrap();
		assert_eq!(json["channel"], "one");
		assert_eq!(json["container"], "mpegts");
		assert_eq!(json["route"], "passthrough");
		assert_eq!(json["clients"][0]["userAgent"], "test-client");

		let _ = std::fs::remove_file(path);
	}
}
