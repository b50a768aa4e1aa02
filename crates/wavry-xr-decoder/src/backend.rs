//! Seam between the decoder plugin and a platform codec.
//!
//! A codec reports buffer availability asynchronously from its own threads.
//! Those reports never touch plugin state directly: [`CodecEvents`] turns each
//! one into a message on a bounded per-session channel that the plugin drains.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use crossbeam_channel::Sender;
use log::{error, warn};

use wavry_xr::{OptionMap, VideoCodec};

use crate::{surface::SurfaceHandle, DecoderResult};

pub type InputBufferId = usize;
pub type OutputBufferId = usize;

/// Bounded wait used by codec callbacks when a queue is full.
pub const CALLBACK_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(50);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1;
        const CODEC_CONFIG = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBuffer {
    pub buffer_id: OutputBufferId,
    pub presentation_time_us: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    OutputAvailable(OutputBuffer),
    FormatChanged { width: i32, height: i32 },
    Error { code: i32, action: i32, details: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatValue {
    String(String),
    Float(f32),
    Int64(i64),
    Int32(i32),
    Buffer(Vec<u8>),
}

/// Key/value format description handed to the codec at configure time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaFormat {
    entries: BTreeMap<String, FormatValue>,
}

impl MediaFormat {
    pub const KEY_MIME: &'static str = "mime";
    pub const KEY_WIDTH: &'static str = "width";
    pub const KEY_HEIGHT: &'static str = "height";
    pub const KEY_CSD_0: &'static str = "csd-0";
    pub const KEY_OPERATING_RATE: &'static str = "operating-rate";
    pub const KEY_PRIORITY: &'static str = "priority";
    pub const KEY_LOW_LATENCY: &'static str = "low-latency";

    /// Placeholder size; the real size arrives with the first format change.
    const INITIAL_WIDTH: i32 = 512;
    const INITIAL_HEIGHT: i32 = 1024;

    pub fn video(codec: VideoCodec, csd0: &[u8], options: &OptionMap, realtime: bool) -> Self {
        let mut format = Self::default();
        format.set_string(Self::KEY_MIME, codec.mime());
        format.set_i32(Self::KEY_WIDTH, Self::INITIAL_WIDTH);
        format.set_i32(Self::KEY_HEIGHT, Self::INITIAL_HEIGHT);

        for (key, value) in &options.string {
            format.set_string(key, value);
        }
        for (key, value) in &options.float {
            format.set(key, FormatValue::Float(*value));
        }
        for (key, value) in &options.int64 {
            format.set(key, FormatValue::Int64(*value));
        }
        for (key, value) in &options.int32 {
            format.set_i32(key, *value);
        }

        format.set_i32(Self::KEY_OPERATING_RATE, i16::MAX as i32);
        format.set_i32(Self::KEY_PRIORITY, if realtime { 0 } else { 1 });
        format.set_i32(Self::KEY_LOW_LATENCY, 1);
        format.set(Self::KEY_CSD_0, FormatValue::Buffer(csd0.to_vec()));
        format
    }

    pub fn set(&mut self, key: &str, value: FormatValue) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, FormatValue::String(value.to_string()));
    }

    pub fn set_i32(&mut self, key: &str, value: i32) {
        self.set(key, FormatValue::Int32(value));
    }

    pub fn get(&self, key: &str) -> Option<&FormatValue> {
        self.entries.get(key)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(FormatValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(FormatValue::String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_buffer(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(FormatValue::Buffer(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormatValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Uninitialized = 0,
    Configuring = 1,
    Running = 2,
    Error = 3,
    Stopped = 4,
}

#[derive(Debug)]
pub(crate) struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> SessionState {
        match self.0.load(Ordering::Acquire) {
            0 => SessionState::Uninitialized,
            1 => SessionState::Configuring,
            2 => SessionState::Running,
            3 => SessionState::Error,
            _ => SessionState::Stopped,
        }
    }

    pub(crate) fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from` to `to`, failing if another transition got there first.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Error` unless the session is already stopped.
    pub(crate) fn degrade(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Stopped as u8).then_some(SessionState::Error as u8)
            });
    }
}

/// Callback sink handed to a codec session.
#[derive(Debug, Clone)]
pub struct CodecEvents {
    input: Sender<InputBufferId>,
    events: Sender<CodecEvent>,
    state: Arc<SessionStateCell>,
}

impl CodecEvents {
    pub(crate) fn new(
        input: Sender<InputBufferId>,
        events: Sender<CodecEvent>,
        state: Arc<SessionStateCell>,
    ) -> Self {
        Self {
            input,
            events,
            state,
        }
    }

    pub fn input_available(&self, buffer_id: InputBufferId) {
        if self
            .input
            .send_timeout(buffer_id, CALLBACK_ENQUEUE_TIMEOUT)
            .is_err()
        {
            warn!("input buffer queue full, dropping input buffer {buffer_id}");
        }
    }

    pub fn output_available(&self, buffer: OutputBuffer) {
        self.push(CodecEvent::OutputAvailable(buffer));
    }

    pub fn format_changed(&self, width: i32, height: i32) {
        self.push(CodecEvent::FormatChanged { width, height });
    }

    /// Marks the session degraded immediately, then reports the error.
    pub fn error(&self, code: i32, action: i32, details: impl Into<String>) {
        let details = details.into();
        error!("codec error: error-code: {code} action-code: {action} details: {details}");
        self.state.degrade();
        self.push(CodecEvent::Error {
            code,
            action,
            details,
        });
    }

    fn push(&self, event: CodecEvent) {
        if let Err(err) = self.events.send_timeout(event, CALLBACK_ENQUEUE_TIMEOUT) {
            warn!("codec event queue full, dropping {:?}", err.into_inner());
        }
    }
}

pub trait CodecBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Configures a codec session bound to `surface`; it reports through `events`.
    fn create_session(
        &self,
        format: &MediaFormat,
        surface: SurfaceHandle,
        events: CodecEvents,
    ) -> DecoderResult<Box<dyn CodecSession>>;
}

pub trait CodecSession: Send + Sync {
    fn start(&self) -> DecoderResult<()>;

    fn input_buffer_capacity(&self, buffer_id: InputBufferId) -> DecoderResult<usize>;

    /// Copies `data` into the input buffer and submits it.
    fn queue_input(
        &self,
        buffer_id: InputBufferId,
        data: &[u8],
        presentation_time_us: u64,
        flags: BufferFlags,
    ) -> DecoderResult<()>;

    /// Returns an output buffer, presenting it on the bound surface when `render` is set.
    fn release_output(&self, buffer_id: OutputBufferId, render: bool) -> DecoderResult<()>;

    /// Must tolerate later calls on any method, which fail with `SessionStopped`.
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_video_format_keys() {
        let mut options = OptionMap::default();
        options.int32.insert("vendor.qti-ext-dec-low-latency.enable".into(), 1);
        options.float.insert("operating-rate".into(), 60.0);
        let format = MediaFormat::video(VideoCodec::Hevc, &[0, 0, 0, 1, 0x40], &options, false);

        assert_eq!(format.get_string(MediaFormat::KEY_MIME), Some("video/hevc"));
        assert_eq!(format.get_i32(MediaFormat::KEY_WIDTH), Some(512));
        assert_eq!(format.get_i32(MediaFormat::KEY_HEIGHT), Some(1024));
        assert_eq!(format.get_i32(MediaFormat::KEY_PRIORITY), Some(1));
        assert_eq!(format.get_i32(MediaFormat::KEY_LOW_LATENCY), Some(1));
        assert_eq!(format.get_buffer(MediaFormat::KEY_CSD_0), Some(&[0u8, 0, 0, 1, 0x40][..]));
        assert_eq!(
            format.get_i32("vendor.qti-ext-dec-low-latency.enable"),
            Some(1)
        );
        // Fixed keys are applied after the free-form options.
        assert_eq!(
            format.get_i32(MediaFormat::KEY_OPERATING_RATE),
            Some(i16::MAX as i32)
        );
    }

    #[test]
    fn test_error_degrades_state() {
        let (input_tx, _input_rx) = bounded(1);
        let (event_tx, event_rx) = bounded(4);
        let state = Arc::new(SessionStateCell::new(SessionState::Running));
        let events = CodecEvents::new(input_tx, event_tx, state.clone());

        events.error(-10000, 0, "hw fault");
        assert_eq!(state.load(), SessionState::Error);
        assert!(matches!(
            event_rx.try_recv(),
            Ok(CodecEvent::Error { code: -10000, .. })
        ));
    }

    #[test]
    fn test_stopped_state_is_terminal() {
        let state = SessionStateCell::new(SessionState::Stopped);
        state.degrade();
        assert_eq!(state.load(), SessionState::Stopped);
    }

    #[test]
    fn test_full_queue_drops() {
        let (input_tx, input_rx) = bounded(1);
        let (event_tx, _event_rx) = bounded(1);
        let state = Arc::new(SessionStateCell::new(SessionState::Running));
        let events = CodecEvents::new(input_tx, event_tx, state);

        events.input_available(1);
        events.input_available(2);
        assert_eq!(input_rx.try_recv(), Ok(1));
        assert!(input_rx.try_recv().is_err());
    }
}
