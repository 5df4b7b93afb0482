use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{self, Flags};

use crate::error::CodecError;

/// Software pixel-format conversion for codec output the rest of the crate
/// has no native layout for. Keeps the output size.
pub struct Scaler {
    context: scaling::Context,
    src: (Pixel, u32, u32),
}

impl Scaler {
    pub fn new(src: Pixel, width: u32, height: u32, dst: Pixel) -> Result<Self, CodecError> {
        let context = scaling::Context::get(src, width, height, dst, width, height, Flags::BILINEAR)
            .map_err(|e| CodecError::Internal(format!("scaler {:?} -> {:?}: {}", src, dst, e)))?;
        Ok(Self {
            context,
            src: (src, width, height),
        })
    }

    /// Whether this scaler was built for frames of this layout.
    pub fn accepts(&self, format: Pixel, width: u32, height: u32) -> bool {
        self.src == (format, width, height)
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> Result<(), CodecError> {
        self.context
            .run(frame, dst)
            .map_err(|e| CodecError::Internal(e.to_string()))
    }
}

unsafe impl Send for Scaler {}
