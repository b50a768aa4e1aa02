use std::sync::{Arc, Mutex, MutexGuard};

use glam::Vec2;
use tracing::{debug, info, warn};
use wavry_xr::{
    ClientContext, FoveatedDecodeParams, PoseFilterParams, RenderMode, StreamConfig,
    TrackingFrameIndex, XrRuntime,
};
use wavry_xr_decoder::BackendFactory;

use crate::decoder_thread::{DecoderThread, DecoderThreadCtx};
use crate::input_thread::{InputCtx, InputThread};
use crate::latency::LatencyCollector;
use crate::protocol::{parse_packet, InboundPacket, ProtocolError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Ties packet reception, the decoder thread, the input thread and rendering together.
pub struct XrClient {
    runtime: Arc<dyn XrRuntime>,
    client: Arc<dyn ClientContext>,
    latency: Arc<LatencyCollector>,
    backend: BackendFactory,
    decoder: DecoderThread,
    input: Mutex<InputThread>,
    // Held while rendering and while video textures are cleared.
    render_lock: Mutex<()>,
    stream_config: Mutex<Option<StreamConfig>>,
}

impl XrClient {
    /// Starts the input thread; decoding starts with the first stream config.
    pub fn new(
        runtime: Arc<dyn XrRuntime>,
        client: Arc<dyn ClientContext>,
        backend: BackendFactory,
        filter_params: PoseFilterParams,
    ) -> Self {
        let mut input = InputThread::new(filter_params);
        input.start(InputCtx {
            runtime: runtime.clone(),
            client: client.clone(),
        });
        Self {
            runtime,
            client,
            latency: Arc::new(LatencyCollector::new()),
            backend,
            decoder: DecoderThread::new(),
            input: Mutex::new(input),
            render_lock: Mutex::new(()),
            stream_config: Mutex::new(None),
        }
    }

    pub fn latency(&self) -> &Arc<LatencyCollector> {
        &self.latency
    }

    pub fn stream_config(&self) -> Option<StreamConfig> {
        lock(&self.stream_config).clone()
    }

    pub fn is_decoding(&self) -> bool {
        self.decoder.is_running()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.input).is_connected()
    }

    pub fn set_stream_config(&self, config: StreamConfig) {
        self.decoder.stop();

        if let Some(graphics) = self.runtime.graphics() {
            let render = &config.render;
            let _guard = lock(&self.render_lock);
            self.runtime.set_render_mode(RenderMode::Lobby);
            graphics.clear_video_textures();

            let params = render.foveation.as_ref().map(|foveation| {
                let target = Vec2::new(render.eye_width as f32, render.eye_height as f32);
                FoveatedDecodeParams::new(target, foveation)
            });
            graphics.set_foveated_decode(params);
        } else {
            warn!("no graphics device, video textures not reset");
        }

        info!(
            codec = ?config.decoder.codec,
            eye_width = config.render.eye_width,
            eye_height = config.render.eye_height,
            refresh_rate = config.render.refresh_rate,
            foveation = config.render.foveation.is_some(),
            "starting decoder thread"
        );
        self.decoder.start(DecoderThreadCtx {
            config: config.decoder.clone(),
            runtime: self.runtime.clone(),
            client: self.client.clone(),
            latency: self.latency.clone(),
            backend: self.backend.clone(),
        });

        lock(&self.input)
            .set_target_frame_rate(config.render.refresh_rate)
            .set_client_prediction(config.client_prediction)
            .set_connected(true);
        *lock(&self.stream_config) = Some(config);
    }

    pub fn on_server_disconnect(&self) {
        info!("server disconnected");
        lock(&self.input).set_connected(false);
        self.runtime.set_render_mode(RenderMode::Lobby);
    }

    /// Routes one inbound packet. Returns whether a video frame was accepted.
    pub fn on_receive(&self, packet: &[u8]) -> Result<bool, ProtocolError> {
        match parse_packet(packet)? {
            InboundPacket::VideoFrame { header, payload } => {
                self.latency.received(header.tracking_frame_index);
                let queued = self.decoder.queue_packet(&header, payload);
                if !queued {
                    debug!(
                        tracking_frame_index = header.tracking_frame_index,
                        "video packet dropped"
                    );
                }
                Ok(queued)
            }
            InboundPacket::TimeSync(sync) => {
                if let Some(reply) = self.latency.on_time_sync(&sync) {
                    self.client.time_sync_send(&reply);
                }
                Ok(false)
            }
        }
    }

    /// Renders once, returning the frame index of the video image shown.
    pub fn render_frame(&self) -> Option<TrackingFrameIndex> {
        let frame_index = {
            let _guard = lock(&self.render_lock);
            self.runtime.render_frame()
        };
        if let Some(frame_index) = frame_index {
            self.latency.rendered(frame_index);
        }
        frame_index
    }

    pub fn shutdown(&self) {
        lock(&self.input).stop();
        if let Some(graphics) = self.runtime.graphics() {
            let _guard = lock(&self.render_lock);
            graphics.clear_video_textures();
        }
        self.decoder.stop();
    }
}

impl Drop for XrClient {
    fn drop(&mut self) {
        self.shutdown();
        info!("xr client shut down");
    }
}
