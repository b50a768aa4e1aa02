use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::backend::CodecBackend;
use crate::dummy::DummyCodec;
use crate::plugin::{DecoderPlugin, HardwareDecoderPlugin, RunCtx};
use crate::DecoderResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Software loopback, decodes nothing but exercises the whole pipeline.
    #[default]
    Loopback,
    GStreamer,
}

/// Produces a fresh backend for each decoder plugin.
pub type BackendFactory = Arc<dyn Fn() -> DecoderResult<Box<dyn CodecBackend>> + Send + Sync>;

pub fn create_backend(kind: BackendKind) -> DecoderResult<Box<dyn CodecBackend>> {
    match kind {
        BackendKind::Loopback => Ok(Box::new(DummyCodec::loopback())),
        #[cfg(all(feature = "gstreamer", target_os = "linux"))]
        BackendKind::GStreamer => Ok(Box::new(crate::gst::GstCodecBackend::new()?)),
        #[cfg(not(all(feature = "gstreamer", target_os = "linux")))]
        BackendKind::GStreamer => Err(crate::DecoderError::Configuration(
            "gstreamer backend not compiled in (enable the `gstreamer` feature on linux)"
                .to_string(),
        )),
    }
}

pub fn create_decoder_plugin(
    run_ctx: RunCtx,
    backend: Box<dyn CodecBackend>,
) -> Arc<dyn DecoderPlugin> {
    info!(
        "creating {:?} decoder plugin on {}",
        run_ctx.config.codec,
        backend.name()
    );
    Arc::new(HardwareDecoderPlugin::new(run_ctx, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DecoderError;

    #[test]
    fn test_loopback_backend() {
        let backend = create_backend(BackendKind::Loopback).unwrap();
        assert_eq!(backend.name(), "dummy-loopback");
    }

    #[cfg(not(all(feature = "gstreamer", target_os = "linux")))]
    #[test]
    fn test_gstreamer_requires_feature() {
        assert!(matches!(
            create_backend(BackendKind::GStreamer),
            Err(DecoderError::Configuration(_))
        ));
    }

    #[test]
    fn test_backend_kind_serde() {
        let kind: BackendKind = serde_json::from_str("\"gstreamer\"").unwrap();
        assert_eq!(kind, BackendKind::GStreamer);
    }
}
