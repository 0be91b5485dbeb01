//! The per-variant sample buffer: one bounded ordered log shared by a
//! single producer side and any number of client readers.
//!
//! Samples are reference counted; the buffer owns the strong count and
//! eviction frees the backing storage regardless of how far behind a reader
//! is. A reader that would pin the byte budget is disconnected, never
//! silently skipped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use beam_media::{Sample, Timestamp, TrackKind, Variant};

use crate::{Error, Result};

/// Where a new reader's cursor starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
	/// At the most recent video keyframe still in the buffer, or the live
	/// edge when none is resident.
	FromLatestKeyframe,
	/// At the oldest sample still resident.
	FromOldestAvailable,
	/// At the live edge, skipping forward to the next keyframe to arrive.
	FromNextKeyframe,
}

/// A snapshot of buffer occupancy.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
	pub bytes: u64,
	pub max_bytes: u64,
	pub video_samples: usize,
	pub audio_samples: usize,
	pub evicted_samples: u64,
	pub evicted_bytes: u64,
	pub readers: usize,
	/// Wall span between the oldest and newest resident video sample.
	pub video_held: Timestamp,
	pub audio_held: Timestamp,
}

impl BufferStats {
	pub fn utilization(&self) -> f64 {
		if self.max_bytes == 0 {
			return 0.0;
		}
		self.bytes as f64 / self.max_bytes as f64
	}
}

#[derive(Debug, Clone, Copy)]
struct Signal {
	latest: u64,
	closed: bool,
}

struct ReaderState {
	/// Next sequence this reader wants.
	cursor: u64,
	/// Skip forward to the next video keyframe before delivering.
	await_keyframe: bool,
	/// Set when eviction had to disconnect this reader.
	kicked: bool,
}

struct Inner {
	log: VecDeque<Arc<Sample>>,
	next_sequence: u64,
	bytes: u64,
	readers: HashMap<u64, ReaderState>,
	next_reader_id: u64,
	writer_taken: [bool; 2],
	evicting: bool,
	closed: bool,
	evicted_samples: u64,
	evicted_bytes: u64,
}

/// Callback invoked (outside the buffer lock) when eviction disconnects a
/// slow reader. The session uses it to tear the client down.
pub type EvictHandler = Box<dyn Fn(u64) + Send + Sync>;

/// A bounded ordered sample log for one [Variant].
pub struct VariantBuffer {
	variant: Variant,
	max_bytes: u64,
	inner: Mutex<Inner>,
	signal: watch::Sender<Signal>,
	evict_handler: Mutex<Option<EvictHandler>>,
}

impl VariantBuffer {
	pub fn new(variant: Variant, max_bytes: u64) -> Arc<Self> {
		let (signal, _) = watch::channel(Signal {
			latest: 0,
			closed: false,
		});
		Arc::new(Self {
			variant,
			max_bytes,
			inner: Mutex::new(Inner {
				log: VecDeque::new(),
				next_sequence: 1,
				bytes: 0,
				readers: HashMap::new(),
				next_reader_id: 1,
				writer_taken: [false; 2],
				evicting: false,
				closed: false,
				evicted_samples: 0,
				evicted_bytes: 0,
			}),
			signal,
			evict_handler: Mutex::new(None),
		})
	}

	pub fn variant(&self) -> Variant {
		self.variant
	}

	/// Register the session callback for slow-reader eviction.
	pub fn set_evict_handler(&self, handler: EvictHandler) {
		*self.evict_handler.lock() = Some(handler);
	}

	/// Claim the submission lane for one track. Admission is single-writer
	/// per track; a second claim is a bug in the caller.
	pub fn writer(self: &Arc<Self>, track: TrackKind) -> TrackWriter {
		let mut inner = self.inner.lock();
		let slot = track_slot(track);
		assert!(!inner.writer_taken[slot], "duplicate writer for {track}");
		inner.writer_taken[slot] = true;
		drop(inner);

		TrackWriter {
			buffer: self.clone(),
			track,
		}
	}

	/// Attach a reader with its starting position.
	pub fn subscribe(self: &Arc<Self>, policy: StartPolicy) -> BufferReader {
		let mut inner = self.inner.lock();

		let (cursor, await_keyframe) = match policy {
			StartPolicy::FromOldestAvailable => {
				(inner.log.front().map(|s| s.sequence).unwrap_or(inner.next_sequence), false)
			}
			StartPolicy::FromLatestKeyframe => {
				let keyframe = inner
					.log
					.iter()
					.rev()
					.find(|s| s.kind == TrackKind::Video && s.keyframe)
					.map(|s| s.sequence);
				(keyframe.unwrap_or(inner.next_sequence), false)
			}
			StartPolicy::FromNextKeyframe => (inner.next_sequence, true),
		};

		let id = inner.next_reader_id;
		inner.next_reader_id += 1;
		inner.readers.insert(
			id,
			ReaderState {
				cursor,
				await_keyframe,
				kicked: false,
			},
		);

		BufferReader {
			buffer: self.clone(),
			id,
			signal: self.signal.subscribe(),
		}
	}

	/// Close the buffer: readers drain what is resident, then see
	/// [Error::BufferClosed].
	pub fn close(&self) {
		self.inner.lock().closed = true;
		self.signal.send_modify(|signal| signal.closed = true);
	}

	pub fn stats(&self) -> BufferStats {
		let inner = self.inner.lock();

		let held = |kind: TrackKind| -> Timestamp {
			let mut iter = inner.log.iter().filter(|s| s.kind == kind);
			let first = iter.next().map(|s| s.dts);
			let last = inner.log.iter().rev().find(|s| s.kind == kind).map(|s| s.dts);
			match (first, last) {
				(Some(first), Some(last)) => last.saturating_sub(first),
				_ => Timestamp::ZERO,
			}
		};

		BufferStats {
			bytes: inner.bytes,
			max_bytes: self.max_bytes,
			video_samples: inner.log.iter().filter(|s| s.kind == TrackKind::Video).count(),
			audio_samples: inner.log.iter().filter(|s| s.kind == TrackKind::Audio).count(),
			evicted_samples: inner.evicted_samples,
			evicted_bytes: inner.evicted_bytes,
			readers: inner.readers.values().filter(|r| !r.kicked).count(),
			video_held: held(TrackKind::Video),
			audio_held: held(TrackKind::Audio),
		}
	}

	/// Run eviction until the byte budget holds. Returns readers that had
	/// to be disconnected; the caller reports them outside the lock.
	fn evict_locked(&self, inner: &mut Inner) -> Vec<u64> {
		let mut kicked = Vec::new();

		while self.max_bytes > 0 && inner.bytes > self.max_bytes {
			let min_cursor = inner
				.readers
				.values()
				.filter(|r| !r.kicked)
				.map(|r| r.cursor)
				.min()
				.unwrap_or(u64::MAX);

			let front_seq = match inner.log.front() {
				Some(front) => front.sequence,
				None => break,
			};

			if front_seq < min_cursor {
				let evicted = inner.log.pop_front().expect("front exists");
				inner.bytes -= evicted.size() as u64;
				inner.evicted_samples += 1;
				inner.evicted_bytes += evicted.size() as u64;
				continue;
			}

			// A slow reader is pinning the budget: disconnect the laggard
			// and retry. Its unread samples are only dropped after it is
			// marked gone.
			inner.evicting = true;
			let slowest = inner
				.readers
				.iter()
				.filter(|(_, r)| !r.kicked)
				.min_by_key(|(_, r)| r.cursor)
				.map(|(id, _)| *id);

			match slowest {
				Some(id) => {
					let reader = inner.readers.get_mut(&id).expect("reader exists");
					reader.kicked = true;
					tracing::warn!(
						variant = %self.variant,
						reader = id,
						cursor = reader.cursor,
						"evicting slow reader"
					);
					kicked.push(id);
				}
				// No readers at all: everything old is fair game.
				None => {
					let evicted = inner.log.pop_front().expect("front exists");
					inner.bytes -= evicted.size() as u64;
					inner.evicted_samples += 1;
					inner.evicted_bytes += evicted.size() as u64;
				}
			}
		}

		if inner.bytes <= self.max_bytes {
			inner.evicting = false;
		}

		kicked
	}

	fn admit(&self, track: TrackKind, mut sample: Sample) -> Result<u64> {
		if sample.payload.len() < 2 {
			return Err(beam_media::Error::MalformedSample("sample under two bytes").into());
		}

		let (sequence, kicked) = {
			let mut inner = self.inner.lock();
			if inner.closed {
				return Err(Error::BufferClosed);
			}

			let sequence = inner.next_sequence;
			inner.next_sequence += 1;
			sample.sequence = sequence;
			sample.kind = track;

			inner.bytes += sample.size() as u64;
			inner.log.push_back(Arc::new(sample));

			let kicked = self.evict_locked(&mut inner);
			(sequence, kicked)
		};

		// Admission never waits on the disconnect: the kicked readers are
		// already excluded, the session just gets told.
		self.report_kicked(&kicked);

		self.signal.send_modify(|signal| signal.latest = sequence);
		Ok(sequence)
	}

	fn report_kicked(&self, kicked: &[u64]) {
		if kicked.is_empty() {
			return;
		}
		let handler = self.evict_handler.lock();
		if let Some(handler) = handler.as_ref() {
			for id in kicked {
				handler(*id);
			}
		}
	}

	fn close_reader(&self, id: u64) {
		let kicked = {
			let mut inner = self.inner.lock();
			inner.readers.remove(&id);
			// Samples pinned only by this cursor become evictable; with the
			// pin gone, a still-over-budget buffer may even have to kick the
			// next slowest reader.
			self.evict_locked(&mut inner)
		};
		self.report_kicked(&kicked);
	}
}

fn track_slot(track: TrackKind) -> usize {
	match track {
		TrackKind::Video => 0,
		TrackKind::Audio => 1,
	}
}

/// The submission lane for one track. Owning it is the license to admit.
pub struct TrackWriter {
	buffer: Arc<VariantBuffer>,
	track: TrackKind,
}

impl TrackWriter {
	/// Append a sample, assigning its sequence number. Runs eviction when
	/// the byte budget overflows.
	pub fn admit(&mut self, sample: Sample) -> Result<u64> {
		self.buffer.admit(self.track, sample)
	}

	pub fn track(&self) -> TrackKind {
		self.track
	}
}

impl Drop for TrackWriter {
	fn drop(&mut self) {
		self.buffer.inner.lock().writer_taken[track_slot(self.track)] = false;
	}
}

/// A cursor over the buffer's log.
pub struct BufferReader {
	buffer: Arc<VariantBuffer>,
	id: u64,
	signal: watch::Receiver<Signal>,
}

impl BufferReader {
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Pull the next contiguous run of samples past the cursor.
	///
	/// Blocks cooperatively until at least one sample is available or the
	/// deadline passes (empty result). Returns [Error::BufferLagged] when
	/// eviction overtook the cursor; the reader stays valid and may
	/// [reset_to_keyframe](Self::reset_to_keyframe) to recover.
	pub async fn next_batch(
		&mut self,
		max_count: usize,
		max_bytes: usize,
		deadline: Duration,
	) -> Result<Vec<Arc<Sample>>> {
		let sleep = tokio::time::sleep(deadline);
		tokio::pin!(sleep);

		loop {
			{
				let mut inner = self.buffer.inner.lock();
				let closed = inner.closed;

				let state = inner.readers.get_mut(&self.id).ok_or(Error::BufferClosed)?;
				if state.kicked {
					let oldest = inner.log.front().map(|s| s.sequence).unwrap_or(inner.next_sequence);
					return Err(Error::BufferLagged { oldest });
				}

				let oldest = inner.log.front().map(|s| s.sequence);
				if let Some(oldest) = oldest {
					if state.cursor < oldest {
						return Err(Error::BufferLagged { oldest });
					}
				}

				let cursor = state.cursor;
				let await_keyframe = state.await_keyframe;
				let mut batch = Vec::new();
				let mut bytes = 0usize;
				let mut new_cursor = cursor;
				let mut keyframe_seen = !await_keyframe;

				if let Some(front) = inner.log.front() {
					let start = (cursor - front.sequence) as usize;
					for sample in inner.log.iter().skip(start) {
						if !keyframe_seen {
							// Skip forward to the next keyframe; skipped
							// samples are released to eviction.
							new_cursor = sample.sequence + 1;
							if sample.kind == TrackKind::Video && sample.keyframe {
								keyframe_seen = true;
								new_cursor = sample.sequence;
							} else {
								continue;
							}
						}

						if batch.len() >= max_count || bytes + sample.size() > max_bytes && !batch.is_empty() {
							break;
						}
						bytes += sample.size();
						new_cursor = sample.sequence + 1;
						batch.push(sample.clone());
					}
				}

				let state = inner.readers.get_mut(&self.id).expect("still present");
				if keyframe_seen {
					state.await_keyframe = false;
				}
				state.cursor = new_cursor;

				if !batch.is_empty() {
					return Ok(batch);
				}
				if closed {
					return Err(Error::BufferClosed);
				}
			}

			tokio::select! {
				_ = &mut sleep => return Ok(Vec::new()),
				changed = self.signal.changed() => {
					if changed.is_err() {
						return Err(Error::BufferClosed);
					}
				}
			}
		}
	}

	/// After a lag, jump to the oldest resident video keyframe and clear
	/// the kicked state if the session decided to keep this reader alive.
	/// With no keyframe resident the reader waits at the live edge for the
	/// next one; serving mid-GOP frames would only corrupt the decoder.
	pub fn reset_to_keyframe(&mut self) {
		let mut inner = self.buffer.inner.lock();

		let keyframe = inner
			.log
			.iter()
			.find(|s| s.kind == TrackKind::Video && s.keyframe)
			.map(|s| s.sequence);
		let next_sequence = inner.next_sequence;

		if let Some(state) = inner.readers.get_mut(&self.id) {
			state.kicked = false;
			match keyframe {
				Some(sequence) => {
					state.cursor = sequence;
					state.await_keyframe = false;
				}
				None => {
					state.cursor = next_sequence;
					state.await_keyframe = true;
				}
			}
		}
	}
}

impl Drop for BufferReader {
	fn drop(&mut self) {
		self.buffer.close_reader(self.id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	fn sample(kind: TrackKind, keyframe: bool, size: usize, dts: u64) -> Sample {
		Sample {
			kind,
			codec: None,
			payload: Bytes::from(vec![0xAB; size]),
			pts: Timestamp::from_ticks(dts),
			dts: Timestamp::from_ticks(dts),
			duration: None,
			keyframe,
			sequence: 0,
		}
	}

	#[tokio::test]
	async fn delivers_in_admission_order() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut video = buffer.writer(TrackKind::Video);
		let mut audio = buffer.writer(TrackKind::Audio);
		let mut reader = buffer.subscribe(StartPolicy::FromOldestAvailable);

		video.admit(sample(TrackKind::Video, true, 100, 0)).unwrap();
		audio.admit(sample(TrackKind::Audio, true, 10, 0)).unwrap();
		video.admit(sample(TrackKind::Video, false, 100, 3600)).unwrap();

		let batch = reader.next_batch(10, usize::MAX, Duration::from_millis(100)).await.unwrap();
		let sequences: Vec<_> = batch.iter().map(|s| s.sequence).collect();
		assert_eq!(sequences, vec![1, 2, 3]);
		assert_eq!(batch[0].kind, TrackKind::Video);
		assert_eq!(batch[1].kind, TrackKind::Audio);
	}

	#[tokio::test]
	async fn batches_are_contiguous_across_calls() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut writer = buffer.writer(TrackKind::Video);
		let mut reader = buffer.subscribe(StartPolicy::FromOldestAvailable);

		for i in 0..10 {
			writer.admit(sample(TrackKind::Video, i == 0, 50, i * 3600)).unwrap();
		}

		let first = reader.next_batch(4, usize::MAX, Duration::from_millis(100)).await.unwrap();
		let second = reader.next_batch(100, usize::MAX, Duration::from_millis(100)).await.unwrap();
		assert_eq!(first.last().unwrap().sequence + 1, second.first().unwrap().sequence);
		assert_eq!(first.len() + second.len(), 10);
	}

	#[tokio::test]
	async fn blocks_until_admit_or_deadline() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut writer = buffer.writer(TrackKind::Video);
		let mut reader = buffer.subscribe(StartPolicy::FromNextKeyframe);

		// Deadline elapses with nothing admitted.
		let empty = reader.next_batch(10, usize::MAX, Duration::from_millis(20)).await.unwrap();
		assert!(empty.is_empty());

		// A concurrent admit wakes the reader.
		let handle = tokio::spawn(async move {
			reader.next_batch(10, usize::MAX, Duration::from_secs(5)).await
		});
		tokio::time::sleep(Duration::from_millis(20)).await;
		writer.admit(sample(TrackKind::Video, true, 10, 0)).unwrap();
		let batch = handle.await.unwrap().unwrap();
		assert_eq!(batch.len(), 1);
	}

	#[tokio::test]
	async fn next_keyframe_policy_skips_mid_gop_joins() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut writer = buffer.writer(TrackKind::Video);

		writer.admit(sample(TrackKind::Video, true, 10, 0)).unwrap();
		writer.admit(sample(TrackKind::Video, false, 10, 3600)).unwrap();

		let mut reader = buffer.subscribe(StartPolicy::FromNextKeyframe);
		writer.admit(sample(TrackKind::Video, false, 10, 7200)).unwrap();
		writer.admit(sample(TrackKind::Video, true, 10, 10800)).unwrap();
		writer.admit(sample(TrackKind::Video, false, 10, 14400)).unwrap();

		let batch = reader.next_batch(10, usize::MAX, Duration::from_millis(100)).await.unwrap();
		assert!(batch[0].keyframe);
		assert_eq!(batch[0].sequence, 4);
		assert_eq!(batch.len(), 2);
	}

	#[tokio::test]
	async fn latest_keyframe_policy_rewinds() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut writer = buffer.writer(TrackKind::Video);

		writer.admit(sample(TrackKind::Video, true, 10, 0)).unwrap();
		writer.admit(sample(TrackKind::Video, false, 10, 3600)).unwrap();
		writer.admit(sample(TrackKind::Video, true, 10, 7200)).unwrap();
		writer.admit(sample(TrackKind::Video, false, 10, 10800)).unwrap();

		let mut reader = buffer.subscribe(StartPolicy::FromLatestKeyframe);
		let batch = reader.next_batch(10, usize::MAX, Duration::from_millis(100)).await.unwrap();
		assert_eq!(batch[0].sequence, 3);
		assert!(batch[0].keyframe);
	}

	#[tokio::test]
	async fn eviction_respects_consumed_samples_and_budget() {
		// Budget of ~4 samples.
		let buffer = VariantBuffer::new(Variant::default(), 4 * 1024);
		let mut writer = buffer.writer(TrackKind::Video);
		let mut reader = buffer.subscribe(StartPolicy::FromOldestAvailable);

		for i in 0..4 {
			writer.admit(sample(TrackKind::Video, i == 0, 1024, i * 3600)).unwrap();
		}
		// Reader consumes everything resident.
		let batch = reader.next_batch(100, usize::MAX, Duration::from_millis(100)).await.unwrap();
		assert_eq!(batch.len(), 4);

		// Further admissions evict the consumed front; the reader is safe.
		for i in 4..12 {
			writer.admit(sample(TrackKind::Video, false, 1024, i * 3600)).unwrap();
		}
		let stats = buffer.stats();
		assert!(stats.bytes <= 4 * 1024);
		assert!(stats.evicted_samples >= 8);

		let batch = reader.next_batch(100, usize::MAX, Duration::from_millis(100)).await.unwrap();
		assert_eq!(batch.first().unwrap().sequence, 5);
	}

	#[tokio::test]
	async fn slow_reader_is_kicked_fast_reader_unharmed() {
		let buffer = VariantBuffer::new(Variant::default(), 16 * 1024);
		let kicked = Arc::new(parking_lot::Mutex::new(Vec::new()));
		{
			let kicked = kicked.clone();
			buffer.set_evict_handler(Box::new(move |id| kicked.lock().push(id)));
		}

		let mut writer = buffer.writer(TrackKind::Video);
		let mut fast = buffer.subscribe(StartPolicy::FromOldestAvailable);
		let mut slow = buffer.subscribe(StartPolicy::FromOldestAvailable);

		let mut fast_total = 0;
		// Admit 64 KiB against a 16 KiB budget; only the fast reader keeps
		// consuming.
		for i in 0..64 {
			writer.admit(sample(TrackKind::Video, i == 0, 1024, i * 3600)).unwrap();
			fast_total += fast
				.next_batch(100, usize::MAX, Duration::from_millis(50))
				.await
				.unwrap()
				.len();
		}

		assert_eq!(fast_total, 64, "fast reader saw every sample");
		assert_eq!(kicked.lock().as_slice(), &[slow.id()]);
		assert!(buffer.stats().bytes <= 16 * 1024);

		// The slow reader learns it lagged and can rejoin at a keyframe.
		let err = slow.next_batch(1, usize::MAX, Duration::from_millis(10)).await.unwrap_err();
		assert!(matches!(err, Error::BufferLagged { .. }));
		slow.reset_to_keyframe();
		// The only resident keyframe was evicted long ago, so the reader
		// waits at the live edge for the next one.
		let empty = slow.next_batch(1, usize::MAX, Duration::from_millis(20)).await.unwrap();
		assert!(empty.is_empty());
		writer.admit(sample(TrackKind::Video, true, 1024, 64 * 3600)).unwrap();
		let batch = slow.next_batch(1, usize::MAX, Duration::from_millis(50)).await.unwrap();
		assert_eq!(batch.len(), 1);
		assert!(batch[0].keyframe);
	}

	#[tokio::test]
	async fn close_wakes_readers() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut reader = buffer.subscribe(StartPolicy::FromOldestAvailable);

		let closer = buffer.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			closer.close();
		});

		let err = reader.next_batch(1, usize::MAX, Duration::from_secs(5)).await.unwrap_err();
		assert!(matches!(err, Error::BufferClosed));
	}

	#[tokio::test]
	async fn rejects_degenerate_samples() {
		let buffer = VariantBuffer::new(Variant::default(), 0);
		let mut writer = buffer.writer(TrackKind::Video);
		assert!(writer.admit(sample(TrackKind::Video, false, 0, 0)).is_err());
		assert!(writer.admit(sample(TrackKind::Video, false, 1, 0)).is_err());
		assert!(writer.admit(sample(TrackKind::Video, false, 2, 0)).is_ok());
	}

	#[tokio::test]
	async fn stats_track_occupancy() {
		let buffer = VariantBuffer::new(Variant::default(), 1024 * 1024);
		let mut video = buffer.writer(TrackKind::Video);
		let mut audio = buffer.writer(TrackKind::Audio);
		let _reader = buffer.subscribe(StartPolicy::FromOldestAvailable);

		video.admit(sample(TrackKind::Video, true, 100, 0)).unwrap();
		video.admit(sample(TrackKind::Video, false, 100, 90_000)).unwrap();
		audio.admit(sample(TrackKind::Audio, true, 50, 0)).unwrap();

		let stats = buffer.stats();
		assert_eq!(stats.video_samples, 2);
		assert_eq!(stats.audio_samples, 1);
		assert_eq!(stats.bytes, 250);
		assert_eq!(stats.readers, 1);
		assert_eq!(stats.video_held.as_secs(), 1);
		assert!(stats.utilization() > 0.0);
	}
}
