use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel layouts a frame can carry. All layouts are tightly packed, no row padding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar Y, U, V with 2x2 chroma subsampling (I420).
    Yuv420p,
    /// Y plane followed by interleaved UV at 2x2 subsampling.
    Nv12,
    Rgb24,
    Bgr24,
    /// Packed Y0 U Y1 V.
    Yuyv422,
}

impl PixelFormat {
    /// Size in bytes of one `width x height` image in this layout.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => w * h * 3,
            PixelFormat::Yuyv422 => w.div_ceil(2) * 4 * h,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Yuyv422 => "yuyv422",
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(self.as_str())
    }
}

/// Negotiated stream geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl StreamFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    pub fn with_pixel_format(self, pixel_format: PixelFormat) -> Self {
        Self {
            pixel_format,
            ..self
        }
    }
}

impl Display for StreamFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// A decoded picture. Cloning shares the pixel buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Bytes,
    pub format: StreamFormat,
    /// Assigned by the decoder, starting at 1.
    pub seq: u64,
    /// Bumped by the decoder every time the stream format changes.
    pub epoch: u32,
    pub pts: Option<i64>,
}

impl Frame {
    pub fn new(data: Bytes, format: StreamFormat, seq: u64, epoch: u32, pts: Option<i64>) -> Self {
        Self {
            data,
            format,
            seq,
            epoch,
            pts,
        }
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format.pixel_format
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame seq: {}, format: {}, epoch: {}, data_len: {}, pts: {:?}",
            self.seq,
            self.format,
            self.epoch,
            self.data.len(),
            self.pts
        )
    }
}
