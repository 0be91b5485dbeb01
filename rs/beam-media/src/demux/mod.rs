//! Container demuxers: MPEG-TS packets and fMP4 fragments in, timestamped
//! elementary samples out.
//!
//! Both demuxers are push parsers: feed bytes as they arrive from the
//! network or an encoder's stdout, then drain events. They never block and
//! never copy payloads once a sample boundary is known.

mod fmp4;
mod mpegts;

pub use fmp4::*;
pub use mpegts::*;
