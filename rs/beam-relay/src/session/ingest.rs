//! The ingest side of a session: upstream bytes in, adapted samples in the
//! variant buffer.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use beam_media::adapt::{AudioAdapter, VideoAdapter};
use beam_media::demux::{Fmp4Demuxer, TsDemuxer, TsEvent};
use beam_media::registry::Container;
use beam_media::{Sample, TrackKind};

use crate::buffer::{TrackWriter, VariantBuffer};
use crate::config::ProbeConfig;
use crate::probe::{Prober, SourceProbe};
use crate::route::Route;
use crate::stats::ByteCounter;
use crate::transcode::IngestSink;
use crate::{Error, Result};

/// How sessions learn what an upstream contains.
///
/// The `Static` backend serves embedders that already know their source
/// (and the test suite); `Ffprobe` is the production path.
pub enum ProbeBackend {
	Ffprobe(Prober),
	Static(SourceProbe),
}

impl ProbeBackend {
	pub fn ffprobe(config: ProbeConfig) -> Self {
		Self::Ffprobe(Prober::new(config))
	}

	pub async fn quick(&self, url: &str) -> Result<SourceProbe> {
		match self {
			Self::Ffprobe(prober) => prober.quick(url).await,
			Self::Static(probe) => Ok(probe.clone()),
		}
	}

	pub async fn deep(&self, url: &str) -> Result<SourceProbe> {
		match self {
			Self::Ffprobe(prober) => prober.deep(url).await,
			Self::Static(probe) => Ok(probe.clone()),
		}
	}
}

/// A connected upstream byte stream for the native (no-encoder) path.
pub enum ByteSource {
	File(tokio::fs::File),
	Http(reqwest::Response),
	/// An in-process stream; how tests and embedders feed synthetic input.
	Reader(Box<dyn tokio::io::AsyncRead + Send + Unpin>),
}

impl ByteSource {
	/// Open `url`. Plain paths and `file://` URLs become files; http(s) is
	/// streamed with the client's default redirect handling.
	pub async fn connect(url: &str) -> Result<Self> {
		if let Some(rest) = url.strip_prefix("file://") {
			return Ok(Self::File(tokio::fs::File::open(rest).await?));
		}
		if url.starts_with("http://") || url.starts_with("https://") {
			let response = reqwest::get(url)
				.await
				.and_then(|r| r.error_for_status())
				.map_err(|err| Error::Upstream(err.to_string()))?;
			return Ok(Self::Http(response));
		}
		Ok(Self::File(tokio::fs::File::open(url).await?))
	}

	/// The next chunk, or None at end of stream.
	pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
		match self {
			Self::File(file) => {
				let mut buf = vec![0u8; 64 * 1024];
				let n = file.read(&mut buf).await?;
				if n == 0 {
					return Ok(None);
				}
				buf.truncate(n);
				Ok(Some(Bytes::from(buf)))
			}
			Self::Http(response) => response
				.chunk()
				.await
				.map_err(|err| Error::Upstream(err.to_string())),
			Self::Reader(reader) => {
				let mut buf = vec![0u8; 64 * 1024];
				let n = reader.read(&mut buf).await?;
				if n == 0 {
					return Ok(None);
				}
				buf.truncate(n);
				Ok(Some(Bytes::from(buf)))
			}
		}
	}
}

/// The live media state clients read from.
pub struct Pipeline {
	pub route: Route,
	pub probe: SourceProbe,
	pub buffer: Arc<VariantBuffer>,
	pub video_adapter: Option<Arc<Mutex<VideoAdapter>>>,
	pub audio_adapter: Option<Arc<Mutex<AudioAdapter>>>,
}

enum Demux {
	Ts(TsDemuxer),
	Fmp4(Fmp4Demuxer),
}

/// Consumes upstream (or encoder) bytes: demux, track parameter sets,
/// admit into the buffer, and flip the ready signal once every present
/// track can be initialized for clients.
pub struct IngestState {
	demux: Demux,
	video_adapter: Option<Arc<Mutex<VideoAdapter>>>,
	audio_adapter: Option<Arc<Mutex<AudioAdapter>>>,
	video_writer: Option<TrackWriter>,
	audio_writer: Option<TrackWriter>,
	ready: watch::Sender<bool>,
	bytes_in: Arc<ByteCounter>,
	/// Stamped on every chunk; the session's health checks read it to spot
	/// an ingest that stopped moving.
	activity: Arc<Mutex<Instant>>,
}

impl IngestState {
	/// `container` is the container arriving on the wire (the upstream's
	/// for the native path, the encoder's output for the transcode path).
	pub fn new(
		container: Container,
		pipeline: &Pipeline,
		ready: watch::Sender<bool>,
		bytes_in: Arc<ByteCounter>,
		activity: Arc<Mutex<Instant>>,
	) -> Self {
		let demux = if container.is_mp4() {
			Demux::Fmp4(Fmp4Demuxer::new())
		} else {
			Demux::Ts(TsDemuxer::new())
		};

		let video_writer = pipeline
			.route
			.variant
			.video
			.map(|_| pipeline.buffer.writer(TrackKind::Video));
		let audio_writer = pipeline
			.route
			.variant
			.audio
			.map(|_| pipeline.buffer.writer(TrackKind::Audio));

		Self {
			demux,
			video_adapter: pipeline.video_adapter.clone(),
			audio_adapter: pipeline.audio_adapter.clone(),
			video_writer,
			audio_writer,
			ready,
			bytes_in,
			activity,
		}
	}

	/// Feed one chunk of container bytes.
	pub fn ingest(&mut self, chunk: &[u8]) -> Result<()> {
		self.bytes_in.add(chunk.len() as u64);
		*self.activity.lock() = Instant::now();

		let mut chunk = chunk;
		match &mut self.demux {
			Demux::Ts(demuxer) => {
				demuxer.push(&mut chunk);
				loop {
					match demuxer.next() {
						Ok(Some(TsEvent::Sample(sample))) => self.admit(sample)?,
						Ok(Some(TsEvent::Programs(streams))) => {
							tracing::debug!(streams = streams.len(), "upstream program map");
						}
						Ok(Some(TsEvent::Discontinuity { pid })) => {
							tracing::warn!(pid, "upstream continuity break");
						}
						Ok(None) => break,
						Err(err) => {
							// Malformed stretches are counted by the
							// demuxer; keep going.
							tracing::warn!(%err, "demux error");
						}
					}
				}
			}
			Demux::Fmp4(demuxer) => {
				demuxer.push(&mut chunk);
				loop {
					match demuxer.next() {
						Ok(Some(sample)) => self.admit(sample)?,
						Ok(None) => break,
						Err(err) => return Err(Error::Demux(err)),
					}
				}
			}
		}

		self.check_ready();
		Ok(())
	}

	fn admit(&mut self, sample: Sample) -> Result<()> {
		match sample.kind {
			TrackKind::Video => {
				if let Some(adapter) = &self.video_adapter {
					if let Err(err) = adapter.lock().update(std::slice::from_ref(&sample)) {
						tracing::warn!(%err, "video parameter scan failed");
					}
				}
				if let Some(writer) = &mut self.video_writer {
					writer.admit(sample)?;
				}
			}
			TrackKind::Audio => {
				if let Some(adapter) = &self.audio_adapter {
					adapter.lock().update(std::slice::from_ref(&sample));
				}
				if let Some(writer) = &mut self.audio_writer {
					writer.admit(sample)?;
				}
			}
		}
		Ok(())
	}

	fn check_ready(&self) {
		if *self.ready.borrow() {
			return;
		}

		let video_ready = match &self.video_adapter {
			Some(adapter) => adapter.lock().is_ready(),
			None => true,
		};
		let audio_ready = match &self.audio_adapter {
			Some(adapter) => adapter.lock().is_ready(),
			None => true,
		};

		if video_ready && audio_ready {
			tracing::debug!("pipeline ready; clients switch off the placeholder");
			let _ = self.ready.send(true);
		}
	}
}

impl IngestSink for IngestState {
	fn write(&mut self, chunk: &[u8]) -> Result<()> {
		self.ingest(chunk)
	}
}
