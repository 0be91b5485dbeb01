//! Live HLS media playlists over fMP4 or MPEG-TS segments.
//!
//! The relay only tracks the sliding window and renders the playlist;
//! segment bytes are served by the caller from the variant buffer.

use std::collections::VecDeque;

/// Playlist behavior knobs.
#[derive(Debug, Clone)]
pub struct HlsConfig {
	/// Number of segments kept in the live window.
	pub window_size: usize,
	/// Advertised EXT-X-TARGETDURATION, seconds.
	pub target_duration: u64,
	/// URI of the fMP4 init segment (EXT-X-MAP); None for TS segments.
	pub init_uri: Option<String>,
}

impl Default for HlsConfig {
	fn default() -> Self {
		Self {
			window_size: 6,
			target_duration: 4,
			init_uri: None,
		}
	}
}

struct HlsSegment {
	uri: String,
	duration: f32,
	discontinuity: bool,
}

/// A sliding-window live media playlist.
pub struct HlsPlaylist {
	config: HlsConfig,
	segments: VecDeque<HlsSegment>,
	media_sequence: u64,
	discontinuity_sequence: u64,
	ended: bool,
}

impl HlsPlaylist {
	pub fn new(config: HlsConfig) -> Self {
		Self {
			config,
			segments: VecDeque::new(),
			media_sequence: 0,
			discontinuity_sequence: 0,
			ended: false,
		}
	}

	/// Append a finished segment, sliding the window forward when full.
	pub fn push_segment(&mut self, uri: String, duration_secs: f32, discontinuity: bool) {
		self.segments.push_back(HlsSegment {
			uri,
			duration: duration_secs,
			discontinuity,
		});

		while self.segments.len() > self.config.window_size {
			let evicted = self.segments.pop_front().expect("non-empty window");
			self.media_sequence += 1;
			if evicted.discontinuity {
				self.discontinuity_sequence += 1;
			}
		}
	}

	/// Mark the stream finished; renders an EXT-X-ENDLIST from now on.
	pub fn end(&mut self) {
		self.ended = true;
	}

	pub fn media_sequence(&self) -> u64 {
		self.media_sequence
	}

	/// Segment URIs currently inside the window, oldest first.
	pub fn window(&self) -> impl Iterator<Item = &str> {
		self.segments.iter().map(|s| s.uri.as_str())
	}

	/// Render the playlist.
	pub fn render(&self) -> String {
		let segments = self
			.segments
			.iter()
			.map(|segment| m3u8_rs::MediaSegment {
				uri: segment.uri.clone(),
				duration: segment.duration,
				discontinuity: segment.discontinuity,
				map: self.config.init_uri.as_ref().map(|uri| m3u8_rs::Map {
					uri: uri.clone(),
					..Default::default()
				}),
				..Default::default()
			})
			.collect();

		let playlist = m3u8_rs::MediaPlaylist {
			version: Some(if self.config.init_uri.is_some() { 7 } else { 3 }),
			target_duration: self.config.target_duration,
			media_sequence: self.media_sequence,
			discontinuity_sequence: self.discontinuity_sequence,
			end_list: self.ended,
			independent_segments: true,
			segments,
			..Default::default()
		};

		let mut out = Vec::new();
		playlist.write_to(&mut out).expect("writing to a Vec cannot fail");
		String::from_utf8(out).expect("playlists are ASCII")
	}
}
