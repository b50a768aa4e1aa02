use std::sync::Arc;

use crate::{
    foveation::FoveatedDecodeParams,
    types::{DecodedImage, EyeInfo, RenderMode, TimeSync, TrackingFrameIndex, TrackingInfo},
};

pub trait GraphicsDevice: Send + Sync {
    // Decoder -> graphics
    fn update_video_texture(&self, image: DecodedImage);
    fn set_foveated_decode(&self, params: Option<FoveatedDecodeParams>);
    fn clear_video_textures(&self);

    /// Frame index of the image currently published for rendering.
    fn video_frame_index(&self) -> Option<TrackingFrameIndex>;
}

pub trait XrRuntime: Send + Sync {
    fn set_render_mode(&self, mode: RenderMode);
    fn render_mode(&self) -> RenderMode;

    fn eye_info(&self) -> Option<EyeInfo>;
    fn poll_actions(&self);
    fn tracking_info(&self, client_prediction: bool) -> Option<TrackingInfo>;

    /// Renders the most recently published video image, returning its frame index.
    fn render_frame(&self) -> Option<TrackingFrameIndex>;

    fn graphics(&self) -> Option<Arc<dyn GraphicsDevice>>;
}

pub trait ClientContext: Send + Sync {
    // Client -> server
    fn input_send(&self, info: &TrackingInfo);
    fn views_config_send(&self, eye_info: &EyeInfo);
    fn time_sync_send(&self, sync: &TimeSync);
    fn request_idr(&self);

    // Packet loss recovery gate
    fn set_waiting_next_idr(&self, waiting: bool);
    fn is_waiting_next_idr(&self) -> bool;
}

pub trait LatencySink: Send + Sync {
    fn decoder_input(&self, frame_index: TrackingFrameIndex);
    fn decoder_output(&self, frame_index: TrackingFrameIndex);
}
