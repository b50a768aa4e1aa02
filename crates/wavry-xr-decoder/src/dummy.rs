//! Software stand-in for a hardware codec.
//!
//! `Loopback` turns every submitted data buffer straight into an output buffer
//! and, once released, into a small blank image. `Manual` records submissions
//! and leaves every callback to the caller, so tests can fire them in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::debug;

use wavry_xr::ImageData;

use crate::backend::{
    BufferFlags, CodecBackend, CodecEvents, CodecSession, InputBufferId, MediaFormat,
    OutputBuffer, OutputBufferId,
};
use crate::surface::{SurfaceHandle, SurfaceImage};
use crate::{DecoderError, DecoderResult};

const INPUT_BUFFER_CAPACITY: usize = 1 << 20;
const DEFAULT_INPUT_BUFFERS: usize = 4;
const FRAME_WIDTH: u32 = 64;
const FRAME_HEIGHT: u32 = 32;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DummyMode {
    Loopback,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedInput {
    pub buffer_id: InputBufferId,
    pub data: Vec<u8>,
    pub presentation_time_us: u64,
    pub flags: BufferFlags,
}

#[derive(Clone)]
pub struct DummyCodec {
    mode: DummyMode,
    input_buffers: usize,
    stop_delay: Duration,
    sessions: Arc<Mutex<Vec<DummySession>>>,
    fail_next: Arc<AtomicBool>,
}

impl DummyCodec {
    pub fn new(mode: DummyMode) -> Self {
        Self {
            mode,
            input_buffers: DEFAULT_INPUT_BUFFERS,
            stop_delay: Duration::ZERO,
            sessions: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn loopback() -> Self {
        Self::new(DummyMode::Loopback)
    }

    pub fn manual() -> Self {
        Self::new(DummyMode::Manual)
    }

    /// Input buffers offered when a session starts.
    pub fn with_input_buffers(mut self, count: usize) -> Self {
        self.input_buffers = count;
        self
    }

    /// Time `stop` blocks before the session reports stopped, like a slow hardware flush.
    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Makes the next `create_session` fail once.
    pub fn fail_next_session(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn latest_session(&self) -> Option<DummySession> {
        lock(&self.sessions).last().cloned()
    }
}

impl CodecBackend for DummyCodec {
    fn name(&self) -> &str {
        match self.mode {
            DummyMode::Loopback => "dummy-loopback",
            DummyMode::Manual => "dummy-manual",
        }
    }

    fn create_session(
        &self,
        format: &MediaFormat,
        surface: SurfaceHandle,
        events: CodecEvents,
    ) -> DecoderResult<Box<dyn CodecSession>> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(DecoderError::Codec {
                code: -1,
                context: "injected configure failure".to_string(),
            });
        }
        let session = DummySession {
            inner: Arc::new(DummyInner {
                mode: self.mode,
                input_buffers: self.input_buffers,
                stop_delay: self.stop_delay,
                format: format.clone(),
                surface,
                events,
                stopped: AtomicBool::new(false),
                format_reported: AtomicBool::new(false),
                next_output: AtomicUsize::new(0),
                submitted: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                released: Mutex::new(Vec::new()),
            }),
        };
        lock(&self.sessions).push(session.clone());
        Ok(Box::new(session))
    }
}

struct DummyInner {
    mode: DummyMode,
    input_buffers: usize,
    stop_delay: Duration,
    format: MediaFormat,
    surface: SurfaceHandle,
    events: CodecEvents,
    stopped: AtomicBool,
    format_reported: AtomicBool,
    next_output: AtomicUsize,
    submitted: Mutex<Vec<SubmittedInput>>,
    pending: Mutex<HashMap<OutputBufferId, u64>>,
    released: Mutex<Vec<(OutputBufferId, bool)>>,
}

/// Test handle onto one dummy codec session.
#[derive(Clone)]
pub struct DummySession {
    inner: Arc<DummyInner>,
}

impl DummySession {
    pub fn format(&self) -> &MediaFormat {
        &self.inner.format
    }

    pub fn submitted(&self) -> Vec<SubmittedInput> {
        lock(&self.inner.submitted).clone()
    }

    pub fn released(&self) -> Vec<(OutputBufferId, bool)> {
        lock(&self.inner.released).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Input-available callback.
    pub fn offer_input(&self, buffer_id: InputBufferId) {
        self.inner.events.input_available(buffer_id);
    }

    /// Output-available callback for the buffer submitted with `presentation_time_us`.
    pub fn complete_output(&self, presentation_time_us: u64) -> OutputBufferId {
        if !self.inner.format_reported.swap(true, Ordering::AcqRel) {
            self.inner
                .events
                .format_changed(FRAME_WIDTH as i32, FRAME_HEIGHT as i32);
        }
        let buffer_id = self.inner.next_output.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.pending).insert(buffer_id, presentation_time_us);
        self.inner.events.output_available(OutputBuffer {
            buffer_id,
            presentation_time_us,
        });
        buffer_id
    }

    /// Image-available callback, timestamped in nanoseconds like a display surface.
    pub fn present_image(&self, presentation_time_us: u64) -> bool {
        let stride = FRAME_WIDTH * 4;
        self.inner.surface.present(SurfaceImage {
            timestamp_ns: presentation_time_us * 1000,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            data: ImageData::Cpu {
                bytes: Bytes::from(vec![0u8; (stride * FRAME_HEIGHT) as usize]),
                stride,
            },
        })
    }

    /// Error callback.
    pub fn raise_error(&self, code: i32, details: &str) {
        self.inner.events.error(code, 0, details);
    }

    fn ensure_running(&self) -> DecoderResult<()> {
        if self.is_stopped() {
            Err(DecoderError::SessionStopped)
        } else {
            Ok(())
        }
    }
}

impl CodecSession for DummySession {
    fn start(&self) -> DecoderResult<()> {
        self.ensure_running()?;
        for buffer_id in 0..self.inner.input_buffers {
            self.offer_input(buffer_id);
        }
        Ok(())
    }

    fn input_buffer_capacity(&self, _buffer_id: InputBufferId) -> DecoderResult<usize> {
        self.ensure_running()?;
        Ok(INPUT_BUFFER_CAPACITY)
    }

    fn queue_input(
        &self,
        buffer_id: InputBufferId,
        data: &[u8],
        presentation_time_us: u64,
        flags: BufferFlags,
    ) -> DecoderResult<()> {
        self.ensure_running()?;
        lock(&self.inner.submitted).push(SubmittedInput {
            buffer_id,
            data: data.to_vec(),
            presentation_time_us,
            flags,
        });

        if self.inner.mode == DummyMode::Loopback {
            if !flags.contains(BufferFlags::CODEC_CONFIG) {
                self.complete_output(presentation_time_us);
            }
            self.offer_input(buffer_id);
        }
        Ok(())
    }

    fn release_output(&self, buffer_id: OutputBufferId, render: bool) -> DecoderResult<()> {
        self.ensure_running()?;
        let presentation_time_us = lock(&self.inner.pending)
            .remove(&buffer_id)
            .ok_or(DecoderError::UnknownBuffer(buffer_id))?;
        lock(&self.inner.released).push((buffer_id, render));

        if self.inner.mode == DummyMode::Loopback && render {
            self.present_image(presentation_time_us);
        }
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.stop_delay.is_zero() {
            thread::sleep(self.inner.stop_delay);
        }
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!("dummy codec session stopped");
        }
    }
}
