use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};

use wavry_xr::{
    ClientContext, DecoderConfig, LatencySink, RenderMode, TrackingFrameIndex, XrRuntime,
};

use crate::backend::{
    BufferFlags, CodecBackend, CodecEvent, CodecEvents, CodecSession, InputBufferId, MediaFormat,
    SessionStateCell,
};
use crate::frame_index_map::FrameIndexMap;
use crate::nal;
use crate::surface::DisplaySurface;
use crate::{DecoderError, DecoderResult};

pub use crate::backend::SessionState;

/// Longest `queue_packet` waits for a free input buffer before dropping the frame.
pub const INPUT_BUFFER_WAIT: Duration = Duration::from_millis(100);
/// Longest one `run` iteration waits for output before re-checking the run token.
pub const OUTPUT_BUFFER_WAIT: Duration = Duration::from_millis(100);
/// Per-session depth of the input and output queues.
pub const BUFFER_QUEUE_CAPACITY: usize = 120;

const CODEC_CTX_POLL: Duration = Duration::from_millis(100);

pub trait DecoderPlugin: Send + Sync {
    /// Submits one packet. Returns false when the packet was dropped.
    fn queue_packet(&self, packet: &[u8], tracking_frame_index: TrackingFrameIndex) -> bool;

    /// Decode consumer loop, returns once `running` is cleared.
    fn run(&self, running: &AtomicBool) -> bool;

    /// Tears down the current session.
    fn stop(&self);
}

#[derive(Clone)]
pub struct RunCtx {
    pub config: DecoderConfig,
    pub runtime: Arc<dyn XrRuntime>,
    pub client: Option<Arc<dyn ClientContext>>,
    pub latency: Option<Arc<dyn LatencySink>>,
}

/// Strictly increasing microsecond timestamps, never zero.
#[derive(Debug)]
struct PtsClock {
    origin: Instant,
    last: AtomicU64,
}

impl PtsClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn make_pts(&self) -> u64 {
        let now = self.origin.elapsed().as_micros() as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

/// One live codec session and everything scoped to it.
struct CodecCtx {
    csd: Vec<u8>,
    session: Box<dyn CodecSession>,
    state: Arc<SessionStateCell>,
    input_rx: Receiver<InputBufferId>,
    events_rx: Receiver<CodecEvent>,
    frame_index_map: Arc<FrameIndexMap>,
    surface: Mutex<DisplaySurface>,
}

impl CodecCtx {
    fn shutdown(&self) {
        self.state.store(SessionState::Stopped);
        match self.surface.lock() {
            Ok(mut surface) => surface.close(),
            Err(poisoned) => poisoned.into_inner().close(),
        }
        self.session.stop();
    }
}

/// Stops a replaced session off the packet path.
fn retire(old: Arc<CodecCtx>) {
    old.state.store(SessionState::Stopped);
    let spawned = thread::Builder::new()
        .name("wavry-xr-session-teardown".to_string())
        .spawn({
            let old = old.clone();
            move || old.shutdown()
        });
    if let Err(err) = spawned {
        warn!("failed to spawn session teardown thread: {err}, stopping inline");
        old.shutdown();
    }
}

/// Decoder plugin driving an asynchronous hardware codec.
pub struct HardwareDecoderPlugin {
    run_ctx: RunCtx,
    backend: Box<dyn CodecBackend>,
    codec_ctx: RwLock<Option<Arc<CodecCtx>>>,
    idle_state: SessionStateCell,
    clock: PtsClock,
}

impl HardwareDecoderPlugin {
    pub fn new(run_ctx: RunCtx, backend: Box<dyn CodecBackend>) -> Self {
        Self {
            run_ctx,
            backend,
            codec_ctx: RwLock::new(None),
            idle_state: SessionStateCell::new(SessionState::Uninitialized),
            clock: PtsClock::new(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        match self.current() {
            Some(ctx) => ctx.state.load(),
            None => self.idle_state.load(),
        }
    }

    fn current(&self) -> Option<Arc<CodecCtx>> {
        match self.codec_ctx.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, next: Option<Arc<CodecCtx>>) -> Option<Arc<CodecCtx>> {
        let mut guard = match self.codec_ctx.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }

    fn needs_session(&self, csd: &[u8]) -> bool {
        match self.current() {
            None => true,
            Some(ctx) => {
                matches!(ctx.state.load(), SessionState::Error | SessionState::Stopped)
                    || ctx.csd != csd
            }
        }
    }

    fn rebuild_session(&self, csd: &[u8]) {
        if let Some(old) = self.replace(None) {
            info!("tearing down decoder session ({:?})", old.state.load());
            retire(old);
        }
        match self.make_codec_ctx(csd) {
            Ok(ctx) => {
                self.replace(Some(ctx));
            }
            Err(err) => {
                error!("failed to create decoder session: {err}");
                self.idle_state.store(SessionState::Error);
            }
        }
    }

    fn make_codec_ctx(&self, csd: &[u8]) -> DecoderResult<Arc<CodecCtx>> {
        info!("creating decoder session with {}", self.backend.name());
        self.idle_state.store(SessionState::Configuring);

        let config = &self.run_ctx.config;
        let graphics = self
            .run_ctx
            .runtime
            .graphics()
            .ok_or(DecoderError::SurfaceUnavailable)?;
        let frame_index_map = Arc::new(FrameIndexMap::new(config.frame_index_capacity));
        let surface = DisplaySurface::new(frame_index_map.clone(), graphics)?;

        let format = MediaFormat::video(config.codec, csd, &config.options, config.realtime_priority);
        let (input_tx, input_rx) = bounded(BUFFER_QUEUE_CAPACITY);
        let (events_tx, events_rx) = bounded(BUFFER_QUEUE_CAPACITY);
        let state = Arc::new(SessionStateCell::new(SessionState::Configuring));
        let events = CodecEvents::new(input_tx, events_tx, state.clone());

        let session = self
            .backend
            .create_session(&format, surface.handle(), events)?;
        info!("selected decoder: {}", self.backend.name());
        let started = session.start().and_then(|()| {
            // An error callback during start already degraded the session.
            if state.transition(SessionState::Configuring, SessionState::Running) {
                Ok(())
            } else {
                Err(DecoderError::Codec {
                    code: -1,
                    context: "codec failed while starting".to_string(),
                })
            }
        });
        if let Err(err) = started {
            session.stop();
            return Err(err);
        }

        self.run_ctx.runtime.set_render_mode(RenderMode::VideoStream);
        info!("finished creating decoder session");

        Ok(Arc::new(CodecCtx {
            csd: csd.to_vec(),
            session,
            state,
            input_rx,
            events_rx,
            frame_index_map,
            surface: Mutex::new(surface),
        }))
    }

    fn wait_for_codec_ctx(&self, running: &AtomicBool) -> Option<Arc<CodecCtx>> {
        while running.load(Ordering::Acquire) {
            if let Some(ctx) = self.current() {
                return Some(ctx);
            }
            thread::sleep(CODEC_CTX_POLL);
        }
        None
    }

    fn on_output(&self, ctx: &CodecCtx, event: CodecEvent) {
        match event {
            CodecEvent::OutputAvailable(buffer) => {
                // Peek only; the image listener consumes the slot.
                if let Some(frame_index) = ctx.frame_index_map.get(buffer.presentation_time_us) {
                    if let Some(latency) = &self.run_ctx.latency {
                        latency.decoder_output(frame_index);
                    }
                }
                if let Err(err) = ctx.session.release_output(buffer.buffer_id, true) {
                    warn!("release output buffer {}: {err}", buffer.buffer_id);
                }
            }
            CodecEvent::FormatChanged { width, height } => {
                info!("output format changed, w:{width}, h:{height}");
            }
            CodecEvent::Error { code, action, .. } => {
                error!(
                    "decoder session degraded (error-code {code}, action-code {action}), waiting for a config packet"
                );
            }
        }
    }
}

impl DecoderPlugin for HardwareDecoderPlugin {
    fn queue_packet(&self, packet: &[u8], tracking_frame_index: TrackingFrameIndex) -> bool {
        let codec = self.run_ctx.config.codec;
        let csd = nal::find_config_prefix(packet, codec);
        if !csd.is_empty() && self.needs_session(csd) {
            self.rebuild_session(csd);
        }

        let Some(ctx) = self.current() else {
            return false;
        };
        let state = ctx.state.load();
        if state != SessionState::Running {
            debug!("decoder session {state:?}, dropping packet");
            return false;
        }

        let input_id = match ctx.input_rx.recv_timeout(INPUT_BUFFER_WAIT) {
            Ok(id) => id,
            Err(_) => {
                warn!("waiting for input buffer took too long, skipping this frame");
                return false;
            }
        };

        // Parameter sets already went out as csd-0; a config-only packet is resent as config.
        let payload = if csd.len() == packet.len() {
            packet
        } else {
            &packet[csd.len()..]
        };

        let is_idr = nal::is_idr(payload, codec);
        if is_idr {
            if let Some(client) = &self.run_ctx.client {
                client.set_waiting_next_idr(false);
            }
        }

        let is_config_packet = nal::is_config(payload, codec);
        if !is_config_packet {
            if let Some(latency) = &self.run_ctx.latency {
                latency.decoder_input(tracking_frame_index);
            }
        }

        let capacity = match ctx.session.input_buffer_capacity(input_id) {
            Ok(capacity) => capacity,
            Err(err) => {
                warn!("input buffer {input_id}: {err}");
                return false;
            }
        };
        if payload.len() > capacity {
            warn!(
                "packet of {} bytes truncated to input buffer capacity {capacity}",
                payload.len()
            );
        }
        let data = &payload[..payload.len().min(capacity)];

        let (pts, flags) = if is_config_packet {
            (0, BufferFlags::CODEC_CONFIG)
        } else if is_idr {
            (self.clock.make_pts(), BufferFlags::KEY_FRAME)
        } else {
            (self.clock.make_pts(), BufferFlags::empty())
        };
        if !is_config_packet {
            ctx.frame_index_map.set(pts, tracking_frame_index);
        }

        match ctx.session.queue_input(input_id, data, pts, flags) {
            Ok(()) => true,
            Err(err) => {
                warn!("queue input buffer {input_id}: {err}");
                false
            }
        }
    }

    fn run(&self, running: &AtomicBool) -> bool {
        if !running.load(Ordering::Acquire) {
            error!("decoder run parameters not valid");
            return false;
        }

        while running.load(Ordering::Acquire) {
            // Re-resolved every iteration so a rebuilt session is picked up.
            let Some(ctx) = self.wait_for_codec_ctx(running) else {
                break;
            };
            match ctx.events_rx.recv_timeout(OUTPUT_BUFFER_WAIT) {
                Ok(event) => self.on_output(&ctx, event),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("waiting for decoder output buffer took longer than 100ms, retrying");
                }
                Err(RecvTimeoutError::Disconnected) => thread::sleep(CODEC_CTX_POLL),
            }
        }
        info!("decoder thread exiting");
        true
    }

    fn stop(&self) {
        if let Some(ctx) = self.replace(None) {
            ctx.shutdown();
        }
        self.idle_state.store(SessionState::Stopped);
    }
}

impl Drop for HardwareDecoderPlugin {
    fn drop(&mut self) {
        self.stop();
        info!("hardware decoder plugin destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_strictly_increasing() {
        let clock = PtsClock::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let pts = clock.make_pts();
            assert!(pts > last);
            last = pts;
        }
    }
}
