//! Reference collaborators without a headset or GPU.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use glam::{Quat, Vec3};
use tracing::{debug, trace};
use wavry_xr::{
    ClientContext, DecodedImage, EyeFov, EyeInfo, FoveatedDecodeParams, GraphicsDevice, Pose,
    RenderMode, TimeSync, TrackingFrameIndex, TrackingInfo, XrRuntime,
};
use wavry_xr_decoder::VideoTextureRing;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Graphics device that keeps decoded images in a texture ring.
#[derive(Debug, Default)]
pub struct HeadlessGraphics {
    ring: VideoTextureRing,
    foveated_decode: Mutex<Option<FoveatedDecodeParams>>,
    images_received: AtomicU64,
}

impl HeadlessGraphics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<DecodedImage> {
        self.ring.latest()
    }

    pub fn foveated_decode(&self) -> Option<FoveatedDecodeParams> {
        *lock(&self.foveated_decode)
    }

    pub fn images_received(&self) -> u64 {
        self.images_received.load(Ordering::Relaxed)
    }
}

impl GraphicsDevice for HeadlessGraphics {
    fn update_video_texture(&self, image: DecodedImage) {
        self.images_received.fetch_add(1, Ordering::Relaxed);
        self.ring.update(image);
    }

    fn set_foveated_decode(&self, params: Option<FoveatedDecodeParams>) {
        *lock(&self.foveated_decode) = params;
    }

    fn clear_video_textures(&self) {
        self.ring.clear();
    }

    fn video_frame_index(&self) -> Option<TrackingFrameIndex> {
        self.ring.video_frame_index()
    }
}

/// Quest 2 like default view: 64 mm IPD, asymmetric ~90 degree FOV.
pub fn default_eye_info() -> EyeInfo {
    let left = EyeFov {
        left: -0.942,
        right: 0.698,
        top: 0.768,
        bottom: -0.855,
    };
    let right = EyeFov {
        left: -0.698,
        right: 0.942,
        ..left
    };
    EyeInfo {
        eye_fov: [left, right],
        ipd: 0.064,
    }
}

/// Runtime with a slowly swaying synthetic head and hands.
pub struct HeadlessRuntime {
    graphics: Arc<HeadlessGraphics>,
    mode: Mutex<RenderMode>,
    eye_info: Mutex<EyeInfo>,
    origin: Instant,
    action_polls: AtomicU64,
}

impl HeadlessRuntime {
    pub fn new(graphics: Arc<HeadlessGraphics>) -> Self {
        Self {
            graphics,
            mode: Mutex::new(RenderMode::Lobby),
            eye_info: Mutex::new(default_eye_info()),
            origin: Instant::now(),
            action_polls: AtomicU64::new(0),
        }
    }

    pub fn headless_graphics(&self) -> &Arc<HeadlessGraphics> {
        &self.graphics
    }

    /// Simulates the user adjusting the headset.
    pub fn set_eye_info(&self, eye_info: EyeInfo) {
        *lock(&self.eye_info) = eye_info;
    }

    pub fn action_polls(&self) -> u64 {
        self.action_polls.load(Ordering::Relaxed)
    }

    fn pose_at(&self, t: f32) -> Pose {
        Pose {
            position: Vec3::new(0.05 * (t * 0.5).sin(), 1.6, 0.02 * t.cos()),
            orientation: Quat::from_rotation_y(0.3 * (t * 0.25).sin()),
        }
    }
}

impl XrRuntime for HeadlessRuntime {
    fn set_render_mode(&self, mode: RenderMode) {
        let mut current = lock(&self.mode);
        if *current != mode {
            debug!(?mode, "render mode changed");
            *current = mode;
        }
    }

    fn render_mode(&self) -> RenderMode {
        *lock(&self.mode)
    }

    fn eye_info(&self) -> Option<EyeInfo> {
        Some(*lock(&self.eye_info))
    }

    fn poll_actions(&self) {
        self.action_polls.fetch_add(1, Ordering::Relaxed);
    }

    fn tracking_info(&self, client_prediction: bool) -> Option<TrackingInfo> {
        let elapsed = self.origin.elapsed();
        // Predict one 90 Hz frame ahead when the client predicts.
        let lookahead_us = if client_prediction { 11_111 } else { 0 };
        let target_timestamp_us = elapsed.as_micros() as u64 + lookahead_us;
        let t = target_timestamp_us as f32 * 1e-6;

        let head = self.pose_at(t);
        let hand = |side: f32| Pose {
            position: head.position + Vec3::new(0.2 * side, -0.4, -0.3),
            orientation: head.orientation,
        };
        Some(TrackingInfo {
            target_timestamp_us,
            head,
            hands: [Some(hand(-1.0)), Some(hand(1.0))],
        })
    }

    fn render_frame(&self) -> Option<TrackingFrameIndex> {
        match self.render_mode() {
            RenderMode::Lobby => None,
            RenderMode::VideoStream => self.graphics.video_frame_index(),
        }
    }

    fn graphics(&self) -> Option<Arc<dyn GraphicsDevice>> {
        Some(self.graphics.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Tracking(TrackingInfo),
    ViewsConfig(EyeInfo),
    TimeSync(TimeSync),
    IdrRequest,
}

/// Client context that queues upstream messages on a bounded channel.
pub struct ChannelClientContext {
    tx: Sender<ClientMessage>,
    waiting_next_idr: AtomicBool,
}

impl ChannelClientContext {
    pub fn new(capacity: usize) -> (Self, Receiver<ClientMessage>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                waiting_next_idr: AtomicBool::new(false),
            },
            rx,
        )
    }

    fn send(&self, message: ClientMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => trace!(?message, "upstream queue full, dropping"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl ClientContext for ChannelClientContext {
    fn input_send(&self, info: &TrackingInfo) {
        self.send(ClientMessage::Tracking(*info));
    }

    fn views_config_send(&self, eye_info: &EyeInfo) {
        self.send(ClientMessage::ViewsConfig(*eye_info));
    }

    fn time_sync_send(&self, sync: &TimeSync) {
        self.send(ClientMessage::TimeSync(*sync));
    }

    fn request_idr(&self) {
        self.send(ClientMessage::IdrRequest);
    }

    fn set_waiting_next_idr(&self, waiting: bool) {
        self.waiting_next_idr.store(waiting, Ordering::Release);
    }

    fn is_waiting_next_idr(&self) -> bool {
        self.waiting_next_idr.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_frame_needs_video_mode() {
        let graphics = Arc::new(HeadlessGraphics::new());
        let runtime = HeadlessRuntime::new(graphics);
        assert_eq!(runtime.render_mode(), RenderMode::Lobby);
        assert_eq!(runtime.render_frame(), None);
        runtime.set_render_mode(RenderMode::VideoStream);
        assert_eq!(runtime.render_frame(), None);
    }

    #[test]
    fn test_prediction_moves_target_time() {
        let runtime = HeadlessRuntime::new(Arc::new(HeadlessGraphics::new()));
        let plain = runtime.tracking_info(false).unwrap();
        let predicted = runtime.tracking_info(true).unwrap();
        assert!(predicted.target_timestamp_us >= plain.target_timestamp_us + 11_111);
        assert!(predicted.hands.iter().all(Option::is_some));
    }

    #[test]
    fn test_channel_context_drops_when_full() {
        let (client, rx) = ChannelClientContext::new(1);
        client.request_idr();
        client.request_idr();
        assert_eq!(rx.try_recv(), Ok(ClientMessage::IdrRequest));
        assert!(rx.try_recv().is_err());

        client.set_waiting_next_idr(true);
        assert!(client.is_waiting_next_idr());
    }
}
