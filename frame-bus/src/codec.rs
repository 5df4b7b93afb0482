use bytes::Bytes;

use crate::error::CodecError;
use crate::frame::StreamFormat;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

/// Picture produced by a codec, before the decoder assigns it a sequence number.
#[derive(Clone, Debug)]
pub struct Picture {
    pub data: Bytes,
    pub format: StreamFormat,
    pub pts: Option<i64>,
}

/// The bitstream decoding capability. Fed one complete access unit at a time
/// (Annex B, start codes included).
///
/// A codec may hold pictures back for reordering, so `decode` returning nothing
/// is normal; `flush` drains whatever is still held.
pub trait Codec: Send {
    fn decode(&mut self, unit: &[u8]) -> Result<Vec<Picture>, CodecError>;

    fn flush(&mut self) -> Result<Vec<Picture>, CodecError>;

    /// Width, height and pixel format negotiated from the parameter sets.
    fn format(&self) -> Option<StreamFormat>;

    fn name(&self) -> &str {
        "codec"
    }
}

impl<C: Codec + ?Sized> Codec for Box<C> {
    fn decode(&mut self, unit: &[u8]) -> Result<Vec<Picture>, CodecError> {
        (**self).decode(unit)
    }

    fn flush(&mut self) -> Result<Vec<Picture>, CodecError> {
        (**self).flush()
    }

    fn format(&self) -> Option<StreamFormat> {
        (**self).format()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
