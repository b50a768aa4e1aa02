use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use glam::Vec2;
use serde::{Deserialize, Serialize};
use wavry_xr::{
    DecoderConfig, FoveationConfig, OptionMap, PoseFilterParams, RenderConfig, StreamConfig,
    VideoCodec,
};
use wavry_xr_decoder::frame_index_map::DEFAULT_CAPACITY;
use wavry_xr_decoder::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoveationSettings {
    pub enabled: bool,
    pub center_size_x: f32,
    pub center_size_y: f32,
    pub center_shift_x: f32,
    pub center_shift_y: f32,
    pub edge_ratio_x: f32,
    pub edge_ratio_y: f32,
}

impl Default for FoveationSettings {
    fn default() -> Self {
        let base = FoveationConfig::default();
        Self {
            enabled: false,
            center_size_x: base.center_size.x,
            center_size_y: base.center_size.y,
            center_shift_x: base.center_shift.x,
            center_shift_y: base.center_shift.y,
            edge_ratio_x: base.edge_ratio.x,
            edge_ratio_y: base.edge_ratio.y,
        }
    }
}

impl FoveationSettings {
    pub fn to_config(&self) -> Option<FoveationConfig> {
        self.enabled.then(|| FoveationConfig {
            center_size: Vec2::new(self.center_size_x, self.center_size_y),
            center_shift: Vec2::new(self.center_shift_x, self.center_shift_y),
            edge_ratio: Vec2::new(self.edge_ratio_x, self.edge_ratio_y),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub codec: VideoCodec,
    pub backend: BackendKind,
    pub realtime_priority: bool,
    pub foveation: FoveationSettings,
    pub eye_width: u32,
    pub eye_height: u32,
    pub refresh_rate: f32,
    pub client_prediction: bool,
    pub decoder_options: OptionMap,
    pub frame_index_capacity: usize,
    pub pose_filter: PoseFilterParams,
    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let render = RenderConfig::default();
        Self {
            codec: VideoCodec::H264,
            backend: BackendKind::default(),
            realtime_priority: true,
            foveation: FoveationSettings::default(),
            eye_width: render.eye_width,
            eye_height: render.eye_height,
            refresh_rate: render.refresh_rate,
            client_prediction: false,
            decoder_options: OptionMap::default(),
            frame_index_capacity: DEFAULT_CAPACITY,
            pose_filter: PoseFilterParams::default(),
            verbose: false,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid client config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_index_capacity == 0 {
            bail!("frame_index_capacity must be non-zero");
        }
        self.stream_config()
            .render
            .validate()
            .context("invalid render configuration")?;
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            render: RenderConfig {
                eye_width: self.eye_width,
                eye_height: self.eye_height,
                refresh_rate: self.refresh_rate,
                foveation: self.foveation.to_config(),
            },
            decoder: DecoderConfig {
                codec: self.codec,
                realtime_priority: self.realtime_priority,
                options: self.decoder_options.clone(),
                frame_index_capacity: self.frame_index_capacity,
            },
            client_prediction: self.client_prediction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "codec": "hevc",
                "foveation": { "enabled": true, "edge_ratio_x": 3.0 },
                "decoder_options": { "int32": { "vendor.qti-ext-dec-low-latency.enable": 1 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.codec, VideoCodec::Hevc);
        assert_eq!(config.frame_index_capacity, 4096);
        assert!(config.validate().is_ok());

        let stream = config.stream_config();
        let foveation = stream.render.foveation.unwrap();
        assert_eq!(foveation.edge_ratio, Vec2::new(3.0, 5.0));
        assert_eq!(foveation.center_size, Vec2::new(0.4, 0.35));
        assert_eq!(stream.decoder.codec, VideoCodec::Hevc);
        assert_eq!(
            stream
                .decoder
                .options
                .int32
                .get("vendor.qti-ext-dec-low-latency.enable"),
            Some(&1)
        );
    }

    #[test]
    fn test_foveation_disabled_by_default() {
        assert!(ClientConfig::default().stream_config().render.foveation.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = ClientConfig {
            frame_index_capacity: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            refresh_rate: 0.0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClientConfig::load(Path::new("/nonexistent/wavry-xr.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
