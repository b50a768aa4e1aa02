use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use wavry_xr::{TimeSync, VideoCodec};
use wavry_xr_client::protocol::{encode_time_sync, TIME_SYNC_PING};
use wavry_xr_client::{
    init_tracing, ChannelClientContext, ClientConfig, ClientMessage, HeadlessGraphics,
    HeadlessRuntime, VideoFrameHeader, XrClient,
};
use wavry_xr_decoder::{create_backend, BackendFactory, BackendKind};

#[derive(Parser, Debug)]
#[command(name = "wavry-xr-client")]
struct Args {
    /// JSON client configuration
    #[arg(long, env = "WAVRY_XR_CONFIG")]
    config: Option<PathBuf>,
    /// Override the configured codec (h264 or hevc)
    #[arg(long)]
    codec: Option<String>,
    /// Decoder backend (loopback or gstreamer)
    #[arg(long, env = "WAVRY_XR_BACKEND")]
    backend: Option<String>,
    /// Seconds of synthetic stream to play
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,
    /// Drop every Nth video packet to exercise IDR recovery (0 disables)
    #[arg(long, default_value_t = 0)]
    drop_every: u32,
    /// Enable foveated decode with the configured ratios
    #[arg(long, default_value_t = false)]
    foveation: bool,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn parse_codec(value: &str) -> Result<VideoCodec> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .with_context(|| format!("unknown codec {value}"))
}

fn parse_backend(value: &str) -> Result<BackendKind> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .with_context(|| format!("unknown backend {value}"))
}

/// Annex-B access units for a stream that only needs to classify correctly.
struct SyntheticStream {
    codec: VideoCodec,
    frame: u64,
    keyframe_interval: u64,
}

impl SyntheticStream {
    fn config(&self) -> &'static [u8] {
        match self.codec {
            VideoCodec::H264 => &[
                0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80,
            ],
            VideoCodec::Hevc => &[
                0, 0, 0, 1, 0x40, 0x01, 0x0c, 0, 0, 0, 1, 0x42, 0x01, 0x01, 0, 0, 0, 1, 0x44,
                0x01, 0xc1,
            ],
        }
    }

    fn next_access_unit(&mut self, force_keyframe: bool) -> Vec<u8> {
        let keyframe = force_keyframe || self.frame % self.keyframe_interval == 0;
        self.frame += 1;
        let slice: &[u8] = match (self.codec, keyframe) {
            (VideoCodec::H264, true) => &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00],
            (VideoCodec::H264, false) => &[0, 0, 0, 1, 0x41, 0x9a, 0x02],
            (VideoCodec::Hevc, true) => &[0, 0, 0, 1, 0x26, 0x01, 0xaf],
            (VideoCodec::Hevc, false) => &[0, 0, 0, 1, 0x02, 0x01, 0xd0],
        };
        if keyframe {
            [self.config(), slice].concat()
        } else {
            slice.to_vec()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(codec) = &args.codec {
        config.codec = parse_codec(codec)?;
    }
    if let Some(backend) = &args.backend {
        config.backend = parse_backend(backend)?;
    }
    if args.foveation {
        config.foveation.enabled = true;
    }
    config.verbose |= args.verbose;
    config.validate()?;

    init_tracing(config.verbose);
    info!(codec = ?config.codec, backend = ?config.backend, "wavry-xr-client starting");

    let graphics = Arc::new(HeadlessGraphics::new());
    let runtime = Arc::new(HeadlessRuntime::new(graphics.clone()));
    let (client_ctx, upstream) = ChannelClientContext::new(1024);
    let client_ctx = Arc::new(client_ctx);

    let backend_kind = config.backend;
    let backend: BackendFactory = Arc::new(move || create_backend(backend_kind));
    let client = XrClient::new(runtime.clone(), client_ctx, backend, config.pose_filter);

    // Stand-in for the upstream socket.
    let stop = Arc::new(AtomicBool::new(false));
    let idr_requests = Arc::new(AtomicU64::new(0));
    let tracking_sent = Arc::new(AtomicU64::new(0));
    let upstream_thread = thread::Builder::new()
        .name("wavry-xr-upstream".to_string())
        .spawn({
            let stop = stop.clone();
            let idr_requests = idr_requests.clone();
            let tracking_sent = tracking_sent.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    match upstream.recv_timeout(Duration::from_millis(100)) {
                        Ok(ClientMessage::IdrRequest) => {
                            idr_requests.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(ClientMessage::Tracking(_)) => {
                            tracking_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(_) => {}
                    }
                }
            }
        })
        .context("failed to spawn upstream thread")?;

    client.set_stream_config(config.stream_config());

    let frame_period = Duration::from_secs_f32(1.0 / config.refresh_rate);
    let mut stream = SyntheticStream {
        codec: config.codec,
        frame: 0,
        keyframe_interval: (config.refresh_rate as u64).max(1) * 2,
    };
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut packet_counter = 0u32;
    let mut tracking_frame_index = 0u64;
    let mut pending_idr = false;

    while Instant::now() < deadline {
        let tick = Instant::now();
        let before = idr_requests.load(Ordering::Relaxed);

        let payload = stream.next_access_unit(pending_idr);
        pending_idr = false;
        let header = VideoFrameHeader {
            packet_counter,
            tracking_frame_index,
            video_frame_index: stream.frame,
            sent_time_us: client.latency().now_us(),
            frame_byte_size: payload.len() as u32,
            flags: 0,
        };
        packet_counter = packet_counter.wrapping_add(1);
        tracking_frame_index += 1;

        let dropped = args.drop_every > 0 && packet_counter % args.drop_every == 0;
        if !dropped {
            if let Err(err) = client.on_receive(&header.encode(&payload)) {
                warn!("bad packet: {err}");
            }
        }
        if stream.frame % 30 == 0 {
            let ping = TimeSync {
                mode: TIME_SYNC_PING,
                sequence: stream.frame,
                server_time_us: client.latency().now_us(),
                client_time_us: 0,
            };
            client.on_receive(&encode_time_sync(&ping))?;
        }

        client.render_frame();
        if idr_requests.load(Ordering::Relaxed) != before {
            pending_idr = true;
        }
        thread::sleep(frame_period.saturating_sub(tick.elapsed()));
    }

    let stats = client.latency().stats();
    info!(
        frames_received = stats.frames_received,
        frames_decoded = stats.frames_decoded,
        frames_rendered = stats.frames_rendered,
        images = graphics.images_received(),
        avg_decode_us = stats.avg_decode_us.unwrap_or_default(),
        idr_requests = idr_requests.load(Ordering::Relaxed),
        tracking_sent = tracking_sent.load(Ordering::Relaxed),
        action_polls = runtime.action_polls(),
        "stream finished"
    );

    client.on_server_disconnect();
    drop(client);
    stop.store(true, Ordering::Release);
    let _ = upstream_thread.join();
    Ok(())
}
