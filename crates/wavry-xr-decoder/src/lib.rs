//! Hardware video decode for the XR client.
//!
//! Packets go in through [`DecoderPlugin::queue_packet`], decoded images come
//! out on the graphics device tagged with the tracking frame index they were
//! rendered from. The codec itself sits behind [`CodecBackend`].

pub mod backend;
pub mod dummy;
pub mod factory;
pub mod frame_index_map;
#[cfg(all(feature = "gstreamer", target_os = "linux"))]
pub mod gst;
pub mod nal;
pub mod plugin;
pub mod surface;
pub mod texture_ring;

pub use backend::{
    BufferFlags, CodecBackend, CodecEvent, CodecEvents, CodecSession, FormatValue, MediaFormat,
    OutputBuffer,
};
pub use dummy::{DummyCodec, DummyMode, DummySession};
pub use factory::{create_backend, create_decoder_plugin, BackendFactory, BackendKind};
pub use frame_index_map::FrameIndexMap;
pub use nal::PacketKind;
pub use plugin::{DecoderPlugin, HardwareDecoderPlugin, RunCtx, SessionState};
pub use surface::{DisplaySurface, SurfaceHandle, SurfaceImage};
pub use texture_ring::VideoTextureRing;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("invalid decoder configuration: {0}")]
    Configuration(String),
    #[error("codec error {code}: {context}")]
    Codec { code: i32, context: String },
    #[error("display surface unavailable")]
    SurfaceUnavailable,
    #[error("decoder session stopped")]
    SessionStopped,
    #[error("unknown buffer id {0}")]
    UnknownBuffer(usize),
}

pub type DecoderResult<T> = Result<T, DecoderError>;
