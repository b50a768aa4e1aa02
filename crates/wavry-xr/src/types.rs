use std::collections::BTreeMap;

use bytes::Bytes;
use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::{XrError, XrResult};

/// Identifier of the pose sample a video frame was rendered from.
pub type TrackingFrameIndex = u64;

/// Sentinel stored in correlation slots that hold no frame index.
pub const NULL_FRAME_INDEX: TrackingFrameIndex = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

impl VideoCodec {
    pub fn mime(self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
            VideoCodec::Hevc => "video/hevc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
    };
}

/// Field of view angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EyeFov {
    pub left: f32,
    pub right: f32,
    pub top: f32,
    pub bottom: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EyeInfo {
    pub eye_fov: [EyeFov; 2],
    /// Interpupillary distance in meters.
    pub ipd: f32,
}

impl EyeInfo {
    pub const ZERO: Self = Self {
        eye_fov: [EyeFov {
            left: 0.0,
            right: 0.0,
            top: 0.0,
            bottom: 0.0,
        }; 2],
        ipd: 0.0,
    };

    /// Compares ipd and both eyes' left angle, the values headsets adjust at runtime.
    pub fn differs_from(&self, other: &EyeInfo, threshold: f32) -> bool {
        (self.ipd - other.ipd).abs() > threshold
            || (self.eye_fov[0].left - other.eye_fov[0].left).abs() > threshold
            || (self.eye_fov[1].left - other.eye_fov[1].left).abs() > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub target_timestamp_us: u64,
    pub head: Pose,
    /// Left then right controller, `None` when not tracked.
    pub hands: [Option<Pose>; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoveationConfig {
    pub center_size: Vec2,
    pub center_shift: Vec2,
    pub edge_ratio: Vec2,
}

impl Default for FoveationConfig {
    fn default() -> Self {
        Self {
            center_size: Vec2::new(0.4, 0.35),
            center_shift: Vec2::new(0.4, 0.1),
            edge_ratio: Vec2::new(4.0, 5.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    pub eye_width: u32,
    pub eye_height: u32,
    pub refresh_rate: f32,
    pub foveation: Option<FoveationConfig>,
}

impl RenderConfig {
    pub fn validate(&self) -> XrResult<()> {
        if self.eye_width == 0 || self.eye_height == 0 {
            return Err(XrError::Config(format!(
                "eye size {}x{} must be non-zero",
                self.eye_width, self.eye_height
            )));
        }
        if !(self.refresh_rate > 0.0) {
            return Err(XrError::Config(format!(
                "refresh rate {} must be positive",
                self.refresh_rate
            )));
        }
        if let Some(foveation) = &self.foveation {
            let size = foveation.center_size;
            if !(size.is_finite() && size.min_element() > 0.0 && size.max_element() < 1.0) {
                return Err(XrError::Config(format!(
                    "foveation center size {size} must be in (0, 1)"
                )));
            }
            let shift = foveation.center_shift;
            if !(shift.is_finite() && shift.abs().max_element() < 1.0) {
                return Err(XrError::Config(format!(
                    "foveation center shift {shift} must be in (-1, 1)"
                )));
            }
            let ratio = foveation.edge_ratio;
            if !(ratio.is_finite() && ratio.min_element() > 1.0) {
                return Err(XrError::Config(format!(
                    "foveation edge ratio {ratio} must be greater than 1"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            eye_width: 1440,
            eye_height: 1584,
            refresh_rate: 90.0,
            foveation: None,
        }
    }
}

/// Free-form decoder options forwarded untouched to format negotiation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionMap {
    pub string: BTreeMap<String, String>,
    pub float: BTreeMap<String, f32>,
    pub int64: BTreeMap<String, i64>,
    pub int32: BTreeMap<String, i32>,
}

impl OptionMap {
    pub fn is_empty(&self) -> bool {
        self.string.is_empty() && self.float.is_empty() && self.int64.is_empty() && self.int32.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    pub realtime_priority: bool,
    pub options: OptionMap,
    pub frame_index_capacity: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            realtime_priority: true,
            options: OptionMap::default(),
            frame_index_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    pub render: RenderConfig,
    pub decoder: DecoderConfig,
    pub client_prediction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Lobby,
    VideoStream,
}

#[derive(Debug, Clone)]
pub enum ImageData {
    /// Packed rows of `stride` bytes.
    Cpu { bytes: Bytes, stride: u32 },
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub frame_index: TrackingFrameIndex,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub data: ImageData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSync {
    pub mode: u32,
    pub sequence: u64,
    pub server_time_us: u64,
    pub client_time_us: u64,
}
