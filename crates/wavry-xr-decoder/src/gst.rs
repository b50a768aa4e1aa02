use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info};

use wavry_xr::{ImageData, VideoCodec};

use crate::backend::{
    BufferFlags, CodecBackend, CodecEvents, CodecSession, InputBufferId, MediaFormat,
    OutputBuffer, OutputBufferId,
};
use crate::surface::{SurfaceHandle, SurfaceImage};
use crate::{DecoderError, DecoderResult};

const INPUT_BUFFER_COUNT: usize = 8;
const INPUT_BUFFER_CAPACITY: usize = 4 << 20;
const PIPELINE_ERROR_CODE: i32 = -1;

fn adapter(context: impl Into<String>) -> DecoderError {
    DecoderError::Codec {
        code: PIPELINE_ERROR_CODE,
        context: context.into(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Decodes through `appsrc ! parse ! decodebin ! videoconvert ! appsink`.
#[derive(Debug, Default)]
pub struct GstCodecBackend;

impl GstCodecBackend {
    pub fn new() -> DecoderResult<Self> {
        gst::init().map_err(|e| adapter(format!("gstreamer init: {e}")))?;
        Ok(Self)
    }
}

fn codec_from_mime(mime: Option<&str>) -> DecoderResult<VideoCodec> {
    match mime {
        Some(m) if m == VideoCodec::H264.mime() => Ok(VideoCodec::H264),
        Some(m) if m == VideoCodec::Hevc.mime() => Ok(VideoCodec::Hevc),
        other => Err(DecoderError::Configuration(format!(
            "unsupported mime type {other:?}"
        ))),
    }
}

impl CodecBackend for GstCodecBackend {
    fn name(&self) -> &str {
        "gstreamer-decodebin"
    }

    fn create_session(
        &self,
        format: &MediaFormat,
        surface: SurfaceHandle,
        events: CodecEvents,
    ) -> DecoderResult<Box<dyn CodecSession>> {
        let codec = codec_from_mime(format.get_string(MediaFormat::KEY_MIME))?;
        let (parser, caps_str) = match codec {
            VideoCodec::H264 => (
                "h264parse",
                "video/x-h264,stream-format=(string)byte-stream,alignment=(string)au",
            ),
            VideoCodec::Hevc => (
                "h265parse",
                "video/x-h265,stream-format=(string)byte-stream,alignment=(string)au",
            ),
        };

        let pipeline_str = format!(
            "appsrc name=src is-live=true format=time ! {parser} ! decodebin ! videoconvert ! video/x-raw,format=RGBA ! appsink name=sink sync=false"
        );
        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| adapter(format!("gst parse: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| adapter("gst pipeline downcast failed"))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| adapter("gst appsrc missing"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| adapter("gst appsrc type mismatch"))?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| adapter("gst appsink missing"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| adapter("gst appsink type mismatch"))?;

        let caps = gst::Caps::from_str(caps_str).map_err(|e| adapter(format!("gst caps: {e}")))?;
        appsrc.set_caps(Some(&caps));

        let shared = Arc::new(GstShared {
            events,
            surface,
            stopped: AtomicBool::new(false),
            next_output: AtomicUsize::new(0),
            width: AtomicI32::new(0),
            height: AtomicI32::new(0),
            pending: Mutex::new(HashMap::new()),
        });

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample({
                    let shared = shared.clone();
                    move |sink| {
                        let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                        shared.on_sample(sample);
                        Ok(gst::FlowSuccess::Ok)
                    }
                })
                .build(),
        );

        if let Some(bus) = pipeline.bus() {
            let shared = shared.clone();
            bus.set_sync_handler(move |_, msg| {
                if let gst::MessageView::Error(err) = msg.view() {
                    shared
                        .events
                        .error(PIPELINE_ERROR_CODE, 0, err.error().to_string());
                }
                gst::BusSyncReply::Drop
            });
        }

        // The parser wants parameter sets in-band ahead of the first frame.
        let csd = format
            .get_buffer(MediaFormat::KEY_CSD_0)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        Ok(Box::new(GstCodecSession {
            pipeline,
            appsrc,
            csd,
            shared,
        }))
    }
}

struct GstShared {
    events: CodecEvents,
    surface: SurfaceHandle,
    stopped: AtomicBool,
    next_output: AtomicUsize,
    width: AtomicI32,
    height: AtomicI32,
    pending: Mutex<HashMap<OutputBufferId, gst::Sample>>,
}

impl GstShared {
    fn on_sample(&self, sample: gst::Sample) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if let Some(s) = sample.caps().and_then(|caps| caps.structure(0)) {
            let width = s.get::<i32>("width").unwrap_or(0);
            let height = s.get::<i32>("height").unwrap_or(0);
            let changed = self.width.swap(width, Ordering::AcqRel) != width
                | (self.height.swap(height, Ordering::AcqRel) != height);
            if changed {
                self.events.format_changed(width, height);
            }
        }

        let Some(presentation_time_us) = sample
            .buffer()
            .and_then(|buffer| buffer.pts())
            .map(|pts| pts.useconds())
        else {
            debug!("decoded sample without pts, dropping");
            return;
        };

        let buffer_id = self.next_output.fetch_add(1, Ordering::Relaxed);
        lock(&self.pending).insert(buffer_id, sample);
        self.events.output_available(OutputBuffer {
            buffer_id,
            presentation_time_us,
        });
    }
}

struct GstCodecSession {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    csd: Vec<u8>,
    shared: Arc<GstShared>,
}

impl GstCodecSession {
    fn ensure_running(&self) -> DecoderResult<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            Err(DecoderError::SessionStopped)
        } else {
            Ok(())
        }
    }

    fn push(
        &self,
        data: &[u8],
        presentation_time_us: Option<u64>,
        flags: BufferFlags,
    ) -> DecoderResult<()> {
        let mut buffer =
            gst::Buffer::with_size(data.len()).map_err(|e| adapter(format!("gst buffer: {e}")))?;
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| adapter("gst buffer mut failed"))?;
            buffer
                .copy_from_slice(0, data)
                .map_err(|_| adapter("gst buffer copy failed"))?;
            if let Some(pts) = presentation_time_us {
                buffer.set_pts(gst::ClockTime::from_useconds(pts));
                if !flags.contains(BufferFlags::KEY_FRAME) {
                    buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
                }
            }
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| adapter(format!("gst push: {e}")))?;
        Ok(())
    }
}

impl CodecSession for GstCodecSession {
    fn start(&self) -> DecoderResult<()> {
        self.ensure_running()?;
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| adapter(format!("gst state: {e:?}")))?;
        if !self.csd.is_empty() {
            self.push(&self.csd, None, BufferFlags::CODEC_CONFIG)?;
        }
        info!("gstreamer decode pipeline playing");
        for buffer_id in 0..INPUT_BUFFER_COUNT {
            self.shared.events.input_available(buffer_id);
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
        let pts = (!flags.contains(BufferFlags::CODEC_CONFIG)).then_some(presentation_time_us);
        let pushed = self.push(data, pts, flags);
        // appsrc copies synchronously, so the slot is free again right away.
        self.shared.events.input_available(buffer_id);
        pushed
    }

    fn release_output(&self, buffer_id: OutputBufferId, render: bool) -> DecoderResult<()> {
        self.ensure_running()?;
        let sample = lock(&self.shared.pending)
            .remove(&buffer_id)
            .ok_or(DecoderError::UnknownBuffer(buffer_id))?;
        if !render {
            return Ok(());
        }

        let buffer = sample
            .buffer()
            .ok_or_else(|| adapter("gst missing buffer"))?;
        let timestamp_ns = buffer.pts().map(|pts| pts.nseconds()).unwrap_or(0);
        let map = buffer
            .map_readable()
            .map_err(|e| adapter(format!("gst map: {e}")))?;
        let width = self.shared.width.load(Ordering::Acquire).max(0) as u32;
        let height = self.shared.height.load(Ordering::Acquire).max(0) as u32;
        self.shared.surface.present(SurfaceImage {
            timestamp_ns,
            width,
            height,
            data: ImageData::Cpu {
                bytes: Bytes::copy_from_slice(map.as_slice()),
                stride: width * 4,
            },
        });
        Ok(())
    }

    fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.appsrc.end_of_stream();
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            debug!("gst pipeline shutdown: {err:?}");
        }
        lock(&self.shared.pending).clear();
    }
}

impl Drop for GstCodecSession {
    fn drop(&mut self) {
        self.stop();
    }
}
