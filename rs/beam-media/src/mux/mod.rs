//! Muxers: elementary samples in, client-ready containers out.

mod fmp4;
mod hls;
mod mpegts;

pub use fmp4::*;
pub use hls::*;
pub use mpegts::*;
