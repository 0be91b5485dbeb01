//! One session: a single upstream pipeline fanned out to its clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};

use beam_media::adapt::{AudioAdapter, NalFormat, VideoAdapter};
use beam_media::mux::{AudioTrack, Fmp4Writer, TsMuxer, TsMuxerConfig, VideoTrack};
use beam_media::placeholder;
use beam_media::registry::{self, Container};
use beam_media::{MuxSample, Sample, Timestamp, TrackKind, Variant};

use crate::buffer::{BufferReader, StartPolicy, VariantBuffer};
use crate::config::RelayConfig;
use crate::route::{self, EncoderInventory, Route, RouteType};
use crate::session::{
	generate_id, AttachRequest, ByteSource, ClientInfo, ClientStream, IngestState, Pipeline,
	ProbeBackend, SessionHealth, SessionInfo, SessionKey, StreamEvent, StreamItem, TerminalStatus,
	TranscoderInfo,
};
use crate::stats::ByteCounter;
use crate::transcode::{build_args, CommandSpec, EncoderOptions, Transcoder};
use crate::{Error, Result};

struct ClientHandle {
	info: ClientInfo,
	tx: mpsc::UnboundedSender<StreamItem>,
	bytes: Arc<ByteCounter>,
	connected: Instant,
	task: tokio::task::JoinHandle<()>,
}

/// Shared state of one (channel, profile) stream.
pub struct Session {
	pub(crate) id: String,
	pub(crate) key: SessionKey,
	request: AttachRequest,
	config: RelayConfig,
	encoders: EncoderInventory,
	probe: Arc<ProbeBackend>,

	created: Instant,
	bytes_in: Arc<ByteCounter>,
	bytes_out: Arc<ByteCounter>,
	/// Stamped by the ingest state on every chunk, native or encoder path.
	last_activity: Arc<Mutex<Instant>>,

	shutdown: watch::Sender<bool>,
	ready: watch::Sender<bool>,

	pipeline: Mutex<Option<Arc<Pipeline>>>,
	transcoder: Mutex<Option<Arc<Transcoder>>>,
	clients: Mutex<HashMap<String, ClientHandle>>,
	error: Mutex<Option<Error>>,
	in_fallback: AtomicBool,
	empty_since: Mutex<Option<Instant>>,
}

impl Session {
	/// Create the session and start its ingest pipeline.
	pub(crate) fn spawn(
		key: SessionKey,
		request: AttachRequest,
		config: RelayConfig,
		encoders: EncoderInventory,
		probe: Arc<ProbeBackend>,
	) -> Arc<Self> {
		let (shutdown, _) = watch::channel(false);
		let (ready, _) = watch::channel(false);

		let session = Arc::new(Self {
			id: generate_id("sess"),
			key,
			request,
			config,
			encoders,
			probe,
			created: Instant::now(),
			bytes_in: Arc::new(ByteCounter::new()),
			bytes_out: Arc::new(ByteCounter::new()),
			last_activity: Arc::new(Mutex::new(Instant::now())),
			shutdown,
			ready,
			pipeline: Mutex::new(None),
			transcoder: Mutex::new(None),
			clients: Mutex::new(HashMap::new()),
			error: Mutex::new(None),
			in_fallback: AtomicBool::new(false),
			empty_since: Mutex::new(Some(Instant::now())),
		});

		let runner = session.clone();
		tokio::spawn(async move {
			runner.run().await;
		});

		session
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn is_dead(&self) -> bool {
		self.error.lock().is_some() || *self.shutdown.borrow()
	}

	/// How long this session has had no clients, if it is empty.
	pub(crate) fn empty_for(&self) -> Option<std::time::Duration> {
		self.empty_since.lock().map(|since| since.elapsed())
	}

	// ---- ingest ----------------------------------------------------------

	#[tracing::instrument("session", skip_all, fields(id = %self.id, key = %self.key))]
	async fn run(self: Arc<Self>) {
		let mut attempts = 0u32;
		loop {
			attempts += 1;
			let result = self.run_pipeline().await;

			if *self.shutdown.borrow() {
				return;
			}

			match result {
				Ok(()) => return,
				Err(err) if attempts < 2 => {
					// One fallback: re-probe, re-decide, restart.
					tracing::warn!(%err, error_type = err.error_type(), "pipeline failed; falling back");
					self.in_fallback.store(true, Ordering::Relaxed);
					self.teardown_pipeline();
				}
				Err(err) => {
					tracing::error!(%err, error_type = err.error_type(), "pipeline failed twice; session errored");
					self.fail(err);
					return;
				}
			}
		}
	}

	async fn run_pipeline(&self) -> Result<()> {
		// Each (re)start gets a fresh stall window.
		*self.last_activity.lock() = Instant::now();

		let probe = self.probe.quick(&self.request.upstream_url).await?;

		let target = route::TargetProfile {
			container: self.request.container,
			video: self.request.video.clone(),
			audio: self.request.audio.clone(),
			hwaccel: self.request.hwaccel,
		};
		let route = route::decide(&probe, &target, &self.encoders)?;
		tracing::info!(
			kind = ?route.kind,
			container = %route.container,
			variant = %route.variant,
			"route decided"
		);

		let buffer = VariantBuffer::new(route.variant, self.config.buffer.max_bytes);
		{
			let variant = route.variant;
			buffer.set_evict_handler(Box::new(move |reader| {
				tracing::warn!(%variant, reader, "slow client evicted by buffer pressure");
			}));
		}

		let video_adapter = route
			.variant
			.video
			.map(|codec| Arc::new(Mutex::new(VideoAdapter::new(codec))));
		let audio_adapter = route.variant.audio.map(|codec| {
			// AAC over MPEG-TS announces itself through ADTS headers; every
			// other case (non-AAC codecs, AAC inside fMP4 from the encoder)
			// takes its configuration from the probe.
			let adts_visible =
				codec == registry::AudioCodec::Aac && !route.variant.requires_fmp4();
			let adapter = if adts_visible {
				AudioAdapter::new(codec)
			} else {
				let track = probe.primary_audio();
				AudioAdapter::with_config(
					codec,
					track.and_then(|t| t.sample_rate).unwrap_or(48_000),
					track.and_then(|t| t.channels).unwrap_or(2) as u8,
				)
			};
			Arc::new(Mutex::new(adapter))
		});

		let pipeline = Arc::new(Pipeline {
			route: route.clone(),
			probe: probe.clone(),
			buffer: buffer.clone(),
			video_adapter,
			audio_adapter,
		});
		*self.pipeline.lock() = Some(pipeline.clone());

		let native = route.kind != RouteType::Transcode && source_is_mpegts(&probe.container);
		let result = if native {
			self.run_native(&pipeline).await
		} else {
			self.run_encoder(&pipeline, &route).await
		};

		buffer.close();
		result
	}

	/// Pump upstream MPEG-TS straight through the demuxer.
	async fn run_native(&self, pipeline: &Arc<Pipeline>) -> Result<()> {
		let mut source = ByteSource::connect(&self.request.upstream_url).await?;
		let mut state = IngestState::new(
			Container::MpegTs,
			pipeline,
			self.ready.clone(),
			self.bytes_in.clone(),
			self.last_activity.clone(),
		);
		let mut shutdown = self.shutdown.subscribe();

		loop {
			let chunk = tokio::select! {
				chunk = tokio::time::timeout(self.config.session.stall_threshold, source.next_chunk()) => {
					chunk.map_err(|_| Error::Upstream("upstream stalled".into()))??
				}
				_ = shutdown.changed() => return Ok(()),
			};

			match chunk {
				Some(chunk) => state.ingest(&chunk)?,
				None => return Err(Error::Upstream("upstream ended".into())),
			}
		}
	}

	/// Spawn the encoder subprocess and pump its stdout through the demuxer.
	/// Also the copy-mode path for sources the native demuxer cannot read.
	async fn run_encoder(&self, pipeline: &Arc<Pipeline>, route: &Route) -> Result<()> {
		// The encoder's own output container: fMP4 only when the codecs
		// demand it, MPEG-TS otherwise.
		let encoder_container = if route.variant.requires_fmp4() {
			Container::Fmp4
		} else {
			Container::MpegTs
		};
		let ingest_route = Route {
			container: encoder_container,
			// ADTS survives into TS; the client-side muxers strip it.
			strip_adts: encoder_container.is_mp4() && route.video_encoder.is_none(),
			..route.clone()
		};

		let spec = CommandSpec {
			input_url: self.request.upstream_url.clone(),
			route: ingest_route,
			hwaccel: self.request.hwaccel,
			options: EncoderOptions::default(),
			fragment_duration: self.config.session.segment_duration,
		};
		let args = build_args(&spec)?;

		let transcoder = Arc::new(Transcoder::new(
			self.config.transcode.clone(),
			args,
			self.id.clone(),
		));
		*self.transcoder.lock() = Some(transcoder.clone());

		let mut sink = IngestState::new(
			encoder_container,
			pipeline,
			self.ready.clone(),
			self.bytes_in.clone(),
			self.last_activity.clone(),
		);

		let result = self.supervise_encoder(&transcoder, &mut sink).await;
		*self.transcoder.lock() = None;
		result
	}

	/// Run the encoder under a health watchdog.
	///
	/// The supervisor's startup deadline only covers the window before the
	/// first output byte; an encoder that keeps running but stops emitting
	/// is caught here by the ingress clock and torn down so the session's
	/// fallback fires, exactly like a stalled native source.
	async fn supervise_encoder(&self, transcoder: &Transcoder, sink: &mut IngestState) -> Result<()> {
		let (stop, stop_rx) = watch::channel(false);
		let mut shutdown = self.shutdown.subscribe();

		let run = transcoder.run(sink, stop_rx);
		tokio::pin!(run);

		let mut checks = tokio::time::interval(self.config.session.health_interval);
		checks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let mut stalled = false;

		let result = loop {
			tokio::select! {
				result = &mut run => break result,
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						let _ = stop.send(true);
					}
				}
				_ = checks.tick() => {
					let health = self.health_check();
					// Only a live process can stall; between retry attempts
					// the supervisor's own backoff accounting applies.
					if !stalled && health.stalled && transcoder.stats().pid.is_some() {
						tracing::warn!(
							idle_secs = health.last_activity_secs,
							"encoder is alive but produced nothing; stopping it"
						);
						stalled = true;
						let _ = stop.send(true);
					}
				}
			}
		};

		if stalled && !*self.shutdown.borrow() {
			return Err(Error::Upstream(format!(
				"encoder produced no data for {:?}",
				self.config.session.stall_threshold
			)));
		}
		result
	}

	/// One health probe: rates, ingest age, transcoder liveness, and the
	/// stall verdict the watchdogs act on.
	pub fn health_check(&self) -> SessionHealth {
		let idle = self.last_activity.lock().elapsed();
		let transcoder_running = self
			.transcoder
			.lock()
			.as_ref()
			.map(|t| t.stats().pid.is_some())
			.unwrap_or(false);

		SessionHealth {
			ingress_rate: self.bytes_in.rate(),
			egress_rate: self.bytes_out.rate(),
			last_activity_secs: idle.as_secs(),
			transcoder_running,
			stalled: idle >= self.config.session.stall_threshold,
		}
	}

	fn teardown_pipeline(&self) {
		if let Some(pipeline) = self.pipeline.lock().take() {
			pipeline.buffer.close();
		}
		let _ = self.ready.send(false);
	}

	/// Mark the session failed and cut every client loose.
	fn fail(&self, err: Error) {
		let message = err.to_string();
		*self.error.lock() = Some(err);
		self.teardown_pipeline();

		let clients = self.clients.lock();
		for handle in clients.values() {
			let _ = handle
				.tx
				.send((StreamEvent::Terminal(TerminalStatus::Error(message.clone())), None));
		}
	}

	// ---- clients ---------------------------------------------------------

	pub(crate) fn attach_client(self: &Arc<Self>, request: &AttachRequest) -> Result<ClientStream> {
		if self.is_dead() {
			return Err(Error::SessionClosed);
		}

		let client_id = generate_id("client");
		let (tx, rx) = mpsc::unbounded_channel();
		let semaphore = Arc::new(Semaphore::new(self.config.session.client_queue_bytes));
		let bytes = Arc::new(ByteCounter::new());

		let task = {
			let session = self.clone();
			let client_id = client_id.clone();
			let tx = tx.clone();
			let semaphore = semaphore.clone();
			let bytes = bytes.clone();
			let container = request.container;
			tokio::spawn(async move {
				let outcome = session
					.clone()
					.run_client(&client_id, container, &tx, &semaphore, &bytes)
					.await;

				let status = match outcome {
					Ok(()) => TerminalStatus::Shutdown,
					Err(Error::BufferLagged { .. }) | Err(Error::ClientWrite(_)) => TerminalStatus::Lagged,
					Err(Error::BufferClosed) | Err(Error::SessionClosed) => {
						match session.error.lock().as_ref() {
							Some(err) => TerminalStatus::Error(err.to_string()),
							None => TerminalStatus::Shutdown,
						}
					}
					Err(err) => TerminalStatus::Error(err.to_string()),
				};
				let _ = tx.send((StreamEvent::Terminal(status), None));
				session.finish_client(&client_id);
			})
		};

		let info = ClientInfo {
			id: client_id.clone(),
			remote_addr: request.remote_addr.clone(),
			user_agent: request.user_agent.clone(),
			container: request.container,
			connected_secs: 0,
			bytes_sent: 0,
		};

		self.clients.lock().insert(
			client_id.clone(),
			ClientHandle {
				info,
				tx,
				bytes,
				connected: Instant::now(),
				task,
			},
		);
		*self.empty_since.lock() = None;

		tracing::info!(session = %self.id, client = %client_id, "client attached");
		Ok(ClientStream {
			client_id,
			session_id: self.id.clone(),
			rx,
		})
	}

	pub(crate) fn detach_client(&self, client_id: &str) -> Result<()> {
		let handle = self
			.clients
			.lock()
			.remove(client_id)
			.ok_or_else(|| Error::NotFound(format!("client {client_id}")))?;

		let _ = handle
			.tx
			.send((StreamEvent::Terminal(TerminalStatus::Shutdown), None));
		handle.task.abort();
		self.note_if_empty();
		tracing::info!(session = %self.id, client = %client_id, "client detached");
		Ok(())
	}

	fn finish_client(&self, client_id: &str) {
		self.clients.lock().remove(client_id);
		self.note_if_empty();
	}

	fn note_if_empty(&self) {
		let clients = self.clients.lock();
		if clients.is_empty() {
			let mut empty = self.empty_since.lock();
			if empty.is_none() {
				*empty = Some(Instant::now());
			}
		}
	}

	/// Stop the pipeline and disconnect everything.
	pub(crate) fn shutdown(&self) {
		let _ = self.shutdown.send(true);
		self.teardown_pipeline();

		let mut clients = self.clients.lock();
		for (_, handle) in clients.drain() {
			let _ = handle
				.tx
				.send((StreamEvent::Terminal(TerminalStatus::Shutdown), None));
			handle.task.abort();
		}
	}

	// ---- delivery --------------------------------------------------------

	async fn run_client(
		self: Arc<Self>,
		client_id: &str,
		container: Container,
		tx: &mpsc::UnboundedSender<StreamItem>,
		semaphore: &Arc<Semaphore>,
		bytes: &Arc<ByteCounter>,
	) -> Result<()> {
		let mut ready = self.ready.subscribe();
		let mut shutdown = self.shutdown.subscribe();

		// The placeholder prelude: fMP4 clients get a canned GOP looped
		// until the pipeline produces, so their decoders start instantly.
		if container.is_mp4() {
			self.serve_placeholder(tx, semaphore, bytes, &mut ready).await?;
		}

		// Deliver until the session dies. A closed buffer with a live
		// session means a fallback swapped the pipeline; resubscribe.
		loop {
			while !*ready.borrow() {
				if self.is_dead() {
					return Err(Error::SessionClosed);
				}
				tokio::select! {
					changed = ready.changed() => {
						if changed.is_err() {
							return Err(Error::SessionClosed);
						}
					}
					_ = shutdown.changed() => return Err(Error::SessionClosed),
				}
			}

			let pipeline = self.pipeline.lock().clone().ok_or(Error::SessionClosed)?;

			// Join at the freshest decodable point. After a placeholder (or
			// a fallback) the new init segment resets the decoder anyway.
			let mut reader = pipeline.buffer.subscribe(StartPolicy::FromLatestKeyframe);

			tracing::debug!(client = client_id, container = %container, "delivery started");

			let outcome = if container.is_mp4() {
				self.deliver_fmp4(&pipeline, &mut reader, tx, semaphore, bytes).await
			} else {
				self.deliver_ts(&pipeline, &mut reader, tx, semaphore, bytes).await
			};

			match outcome {
				Err(Error::BufferClosed) if !self.is_dead() => {
					tracing::debug!(client = client_id, "pipeline swapped; resubscribing");
					continue;
				}
				other => return other,
			}
		}
	}

	/// Send the canned prelude until the pipeline is ready. Returns whether
	/// anything was sent.
	async fn serve_placeholder(
		&self,
		tx: &mpsc::UnboundedSender<StreamItem>,
		semaphore: &Arc<Semaphore>,
		bytes: &Arc<ByteCounter>,
		ready: &mut watch::Receiver<bool>,
	) -> Result<bool> {
		if *ready.borrow() {
			// Real samples already flow; a prelude would only delay them.
			return Ok(false);
		}

		let requested = Variant {
			video: self.request.video.as_deref().and_then(registry::parse_video),
			audio: self.request.audio.as_deref().and_then(registry::parse_audio),
		};
		let Some(prelude) = placeholder::placeholder(&requested) else {
			return Ok(false);
		};

		self.send(tx, semaphore, bytes, prelude.init.clone()).await?;
		self.send(tx, semaphore, bytes, prelude.segment.clone()).await?;

		let mut loops = tokio::time::interval(std::time::Duration::from_secs(1));
		loops.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loops.tick().await; // the immediate first tick

		while !*ready.borrow() {
			if self.is_dead() {
				return Err(Error::SessionClosed);
			}
			tokio::select! {
				changed = ready.changed() => {
					if changed.is_err() {
						return Err(Error::SessionClosed);
					}
				}
				_ = loops.tick() => {
					self.send(tx, semaphore, bytes, prelude.segment.clone()).await?;
				}
			}
		}

		Ok(true)
	}

	async fn deliver_fmp4(
		&self,
		pipeline: &Arc<Pipeline>,
		reader: &mut BufferReader,
		tx: &mpsc::UnboundedSender<StreamItem>,
		semaphore: &Arc<Semaphore>,
		bytes: &Arc<ByteCounter>,
	) -> Result<()> {
		let mut writer = build_fmp4_writer(pipeline)?;
		self.send(tx, semaphore, bytes, writer.init_segment()?).await?;

		let segment_ticks = Timestamp::from(self.config.session.segment_duration);
		let mut pending_video: Vec<MuxSample> = Vec::new();
		let mut pending_audio: Vec<MuxSample> = Vec::new();

		loop {
			let batch = match reader
				.next_batch(256, 2 * 1024 * 1024, std::time::Duration::from_millis(500))
				.await
			{
				Ok(batch) => batch,
				Err(Error::BufferLagged { oldest }) => {
					tracing::debug!(oldest, "fMP4 client lagged; rejoining at a keyframe");
					reader.reset_to_keyframe();
					pending_video.clear();
					pending_audio.clear();
					continue;
				}
				Err(err) => return Err(err),
			};
			if batch.is_empty() {
				continue;
			}

			let (video, audio) = split_batch(&batch);

			let video_mux = match &pipeline.video_adapter {
				Some(adapter) => adapter.lock().convert(&video, NalFormat::Avcc)?,
				None => Vec::new(),
			};
			let audio_mux = match &pipeline.audio_adapter {
				Some(adapter) => adapter.lock().convert(&audio, true)?,
				None => Vec::new(),
			};

			// Segment per GOP: a keyframe closes the previous segment.
			for sample in video_mux {
				if sample.keyframe && !pending_video.is_empty() {
					let segment = writer.write_segment(&pending_video, &pending_audio)?;
					pending_video.clear();
					pending_audio.clear();
					self.send(tx, semaphore, bytes, segment).await?;
				}
				pending_video.push(sample);
			}
			pending_audio.extend(audio_mux);

			// Audio-only sessions (and overlong GOPs) flush on duration.
			let flush_needed = if pending_video.is_empty() {
				pending_duration(&pending_audio) >= segment_ticks
			} else {
				pending_duration(&pending_video) >= segment_ticks + segment_ticks
			};
			if flush_needed && (!pending_video.is_empty() || !pending_audio.is_empty()) {
				let segment = writer.write_segment(&pending_video, &pending_audio)?;
				pending_video.clear();
				pending_audio.clear();
				self.send(tx, semaphore, bytes, segment).await?;
			}
		}
	}

	async fn deliver_ts(
		&self,
		pipeline: &Arc<Pipeline>,
		reader: &mut BufferReader,
		tx: &mpsc::UnboundedSender<StreamItem>,
		semaphore: &Arc<Semaphore>,
		bytes: &Arc<ByteCounter>,
	) -> Result<()> {
		let variant = pipeline.route.variant;
		let mut muxer = TsMuxer::new(variant.video, variant.audio, TsMuxerConfig::default())
			.map_err(Error::Demux)?;

		loop {
			let batch = match reader
				.next_batch(256, 2 * 1024 * 1024, std::time::Duration::from_millis(500))
				.await
			{
				Ok(batch) => batch,
				Err(Error::BufferLagged { oldest }) => {
					tracing::debug!(oldest, "TS client lagged; rejoining at a keyframe");
					reader.reset_to_keyframe();
					continue;
				}
				Err(err) => return Err(err),
			};
			if batch.is_empty() {
				continue;
			}

			let (video, audio) = split_batch(&batch);

			let video_mux = match &pipeline.video_adapter {
				Some(adapter) => adapter.lock().convert(&video, NalFormat::AnnexB)?,
				None => Vec::new(),
			};
			let audio_mux = match &pipeline.audio_adapter {
				Some(adapter) => adapter.lock().convert(&audio, false)?,
				None => Vec::new(),
			};

			// Interleave back in dts order for the packetizer.
			let mut samples: Vec<&MuxSample> = video_mux.iter().chain(audio_mux.iter()).collect();
			samples.sort_by_key(|s| s.dts);

			for sample in samples {
				let packets = muxer.write(sample).map_err(Error::Demux)?;
				self.send(tx, semaphore, bytes, packets).await?;
			}
		}
	}

	/// Push bytes into the client's bounded queue, giving up after the
	/// drain deadline (the client is then evicted as too slow).
	async fn send(
		&self,
		tx: &mpsc::UnboundedSender<StreamItem>,
		semaphore: &Arc<Semaphore>,
		bytes: &Arc<ByteCounter>,
		data: bytes::Bytes,
	) -> Result<()> {
		if data.is_empty() {
			return Ok(());
		}

		let budget = self.config.session.client_queue_bytes;
		let want = data.len().min(budget) as u32;

		let permit: OwnedSemaphorePermit = tokio::time::timeout(
			self.config.session.drain_deadline,
			semaphore.clone().acquire_many_owned(want),
		)
		.await
		.map_err(|_| Error::ClientWrite("outbound queue full past the drain deadline".into()))?
		.map_err(|_| Error::ClientWrite("client queue closed".into()))?;

		bytes.add(data.len() as u64);
		self.bytes_out.add(data.len() as u64);

		tx.send((StreamEvent::Data(data), Some(permit)))
			.map_err(|_| Error::ClientWrite("client went away".into()))?;
		Ok(())
	}

	// ---- introspection ---------------------------------------------------

	pub(crate) fn info(&self) -> SessionInfo {
		let pipeline = self.pipeline.lock().clone();
		let clients = self.clients.lock();

		let transcoder = self.transcoder.lock().clone().map(|t| {
			let stats = t.stats();
			TranscoderInfo {
				pid: stats.pid,
				attempt: stats.attempt,
				cpu_percent: stats.resources.cpu_percent,
				rss_bytes: stats.resources.rss_bytes,
				bytes_written: stats.resources.bytes_written,
				recent_stderr: t.recent_stderr(),
			}
		});

		SessionInfo {
			id: self.id.clone(),
			channel: self.key.channel.clone(),
			profile: self.key.profile.clone(),
			upstream_url: self.request.upstream_url.clone(),
			route: pipeline.as_ref().map(|p| p.route.kind),
			variant: pipeline.as_ref().map(|p| p.route.variant.to_string()),
			container: self.request.container,
			clients: clients
				.values()
				.map(|handle| ClientInfo {
					connected_secs: handle.connected.elapsed().as_secs(),
					bytes_sent: handle.bytes.total(),
					..handle.info.clone()
				})
				.collect(),
			bytes_in: self.bytes_in.total(),
			bytes_out: self.bytes_out.total(),
			ingress_rate: self.bytes_in.rate(),
			egress_rate: self.bytes_out.rate(),
			uptime_secs: self.created.elapsed().as_secs(),
			last_activity_secs: self.last_activity.lock().elapsed().as_secs(),
			in_fallback: self.in_fallback.load(Ordering::Relaxed),
			error: self.error.lock().as_ref().map(|e| e.to_string()),
			transcoder,
		}
	}
}

fn source_is_mpegts(format_name: &str) -> bool {
	format_name.split(',').any(|name| name.trim() == "mpegts")
}

fn split_batch(batch: &[Arc<Sample>]) -> (Vec<Sample>, Vec<Sample>) {
	let mut video = Vec::new();
	let mut audio = Vec::new();
	for sample in batch {
		match sample.kind {
			TrackKind::Video => video.push(Sample::clone(sample)),
			TrackKind::Audio => audio.push(Sample::clone(sample)),
		}
	}
	(video, audio)
}

fn pending_duration(samples: &[MuxSample]) -> Timestamp {
	match (samples.first(), samples.last()) {
		(Some(first), Some(last)) => last.dts.saturating_sub(first.dts) + last.duration,
		_ => Timestamp::ZERO,
	}
}

fn build_fmp4_writer(pipeline: &Arc<Pipeline>) -> Result<Fmp4Writer> {
	let video = pipeline
		.video_adapter
		.as_ref()
		.map(|adapter| {
			let adapter = adapter.lock();
			let params = adapter
				.params()
				.cloned()
				.ok_or(Error::Demux(beam_media::Error::MissingParameterSets("video")))?;
			let geometry = pipeline.probe.primary_video();
			Ok::<_, Error>(VideoTrack {
				params,
				width: geometry.and_then(|t| t.width).unwrap_or(1280) as u16,
				height: geometry.and_then(|t| t.height).unwrap_or(720) as u16,
			})
		})
		.transpose()?;

	let audio = pipeline
		.audio_adapter
		.as_ref()
		.map(|adapter| {
			let adapter = adapter.lock();
			let config = adapter
				.config()
				.ok_or(Error::Demux(beam_media::Error::MissingParameterSets("audio")))?;
			Ok::<_, Error>(AudioTrack {
				config,
				description: adapter.audio_specific_config(),
			})
		})
		.transpose()?;

	Fmp4Writer::new(video, audio).map_err(Error::Demux)
}
