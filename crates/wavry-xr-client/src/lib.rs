//! XR streaming client: packet routing, decode and input threads, headless collaborators.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod decoder_thread;
pub mod headless;
pub mod input_thread;
pub mod latency;
pub mod protocol;

pub use client::XrClient;
pub use config::{ClientConfig, FoveationSettings};
pub use decoder_thread::{DecoderThread, DecoderThreadCtx};
pub use headless::{ChannelClientContext, ClientMessage, HeadlessGraphics, HeadlessRuntime};
pub use input_thread::{InputCtx, InputThread};
pub use latency::{LatencyCollector, LatencyStats};
pub use protocol::{parse_packet, InboundPacket, ProtocolError, VideoFrameHeader};

/// Installs the fmt subscriber. `RUST_LOG` wins over `verbose`.
///
/// Records from the `log` facade used by the library crates are forwarded too.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
