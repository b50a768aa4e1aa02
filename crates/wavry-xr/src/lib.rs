#![forbid(unsafe_code)]

pub mod foveation;
pub mod one_euro;
pub mod runtime;
pub mod types;

pub use foveation::{FoveatedDecodeParams, FoveationBase};
pub use one_euro::{OneEuroFilter, OneEuroParams, PoseFilter, PoseFilterParams};
pub use runtime::{ClientContext, GraphicsDevice, LatencySink, XrRuntime};
pub use types::{
    DecodedImage, DecoderConfig, EyeFov, EyeInfo, FoveationConfig, ImageData, OptionMap, Pose,
    RenderConfig, RenderMode, StreamConfig, TimeSync, TrackingFrameIndex, TrackingInfo,
    VideoCodec, NULL_FRAME_INDEX,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum XrError {
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type XrResult<T> = Result<T, XrError>;
