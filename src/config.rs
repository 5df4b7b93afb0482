use std::path::{Path, PathBuf};

use anyhow::Context;
use frame_bus::config::PipelineConfig;
use frame_bus::frame::PixelFormat;
use frame_bus::sink::DeliveryPolicy;
use serde::{Deserialize, Serialize};

pub const MIN_QUALITY: u8 = 10;
pub const MAX_QUALITY: u8 = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub device: Option<DeviceConfig>,
    pub preview: PreviewConfig,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8554,
            device: None,
            preview: PreviewConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON config file; missing fields keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("remote host is empty");
        }
        if self.port == 0 {
            anyhow::bail!("remote port must not be 0");
        }
        if let Some(device) = &self.device {
            if device.width == 0 || device.height == 0 {
                anyhow::bail!("device resolution must be non-zero");
            }
            if device.format == PixelFormat::Yuyv422 && device.width % 2 != 0 {
                anyhow::bail!("yuyv devices need an even width, got {}", device.width);
            }
        }
        self.pipeline.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub policy: DeliveryPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            width: 1280,
            height: 720,
            format: PixelFormat::Rgb24,
            policy: DeliveryPolicy::DropOldest,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub enabled: bool,
    pub addr: String,
    quality: u8,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "127.0.0.1:8080".to_string(),
            quality: 60,
        }
    }
}

impl PreviewConfig {
    /// JPEG quality, always within 10..=100.
    pub fn quality(&self) -> u8 {
        self.quality.clamp(MIN_QUALITY, MAX_QUALITY)
    }

    pub fn set_quality(&mut self, quality: u32) {
        self.quality = quality.clamp(MIN_QUALITY as u32, MAX_QUALITY as u32) as u8;
    }
}
