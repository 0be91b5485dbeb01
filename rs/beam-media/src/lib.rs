//! # beam-media: container and bitstream handling for the beam relay
//!
//! `beam-media` is the media layer of the beam live TV relay. It knows how to
//! take apart the containers that upstream IPTV sources produce and put the
//! elementary streams back together in whatever container a client asked for,
//! without touching the codec payloads themselves.
//!
//! ## Overview
//!
//! - **Registry**: canonical codec identities, aliases, MPEG-TS stream types,
//!   and encoder selection per hardware acceleration mode.
//! - **Bitstream**: NAL unit (H.264/H.265), OBU (AV1), VP9 header and ADTS
//!   frame parsing, plus Annex-B ↔ length-prefixed conversion.
//! - **Demux**: MPEG-TS and fragmented MP4 to timestamped elementary samples.
//! - **Adapt**: parameter-set tracking and conversion of samples into
//!   muxer-ready form.
//! - **Mux**: fMP4/CMAF segments, MPEG-TS packets, HLS media playlists.
//! - **Placeholder**: embedded one-second fMP4 preludes per codec variant.
//!
mod error;

pub mod adapt;
pub mod bitstream;
pub mod demux;
pub mod model;
pub mod mux;
pub mod placeholder;
pub mod registry;

pub use error::*;
pub use model::*;
