use bytes::{Bytes, BytesMut};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{codec, decoder, frame, Packet};

use crate::codec::{Codec, Picture};
use crate::error::CodecError;
use crate::frame::{PixelFormat, StreamFormat};
use crate::scaler::Scaler;

/// H.264 decoding through libavcodec.
pub struct FfmpegCodec {
    decoder: decoder::Video,
    scaler: Option<Scaler>,
    format: Option<StreamFormat>,
}

impl FfmpegCodec {
    pub fn h264() -> Result<Self, CodecError> {
        let h264 = decoder::find(codec::Id::H264)
            .ok_or_else(|| CodecError::Internal("h264 decoder not available".to_string()))?;
        let decoder = codec::Context::new_with_codec(h264)
            .decoder()
            .video()
            .map_err(|e| CodecError::Internal(format!("open h264 decoder: {}", e)))?;
        log::info!("using ffmpeg decoder {}", h264.name());

        Ok(Self {
            decoder,
            scaler: None,
            format: None,
        })
    }

    fn drain(&mut self) -> Result<Vec<Picture>, CodecError> {
        let mut pictures = Vec::new();
        loop {
            let mut frame = frame::Video::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => pictures.push(self.picture(&frame)?),
                Err(ffmpeg_next::Error::Eof) => break,
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    break;
                }
                Err(err) => return Err(CodecError::Corrupt(err.to_string())),
            }
        }
        Ok(pictures)
    }

    fn picture(&mut self, frame: &frame::Video) -> Result<Picture, CodecError> {
        let (width, height) = (frame.width(), frame.height());
        let (data, pixel_format) = match frame.format() {
            Pixel::YUV420P | Pixel::YUVJ420P => (copy_yuv420p(frame), PixelFormat::Yuv420p),
            Pixel::NV12 => (copy_nv12(frame), PixelFormat::Nv12),
            other => {
                let reuse = self
                    .scaler
                    .as_ref()
                    .is_some_and(|s| s.accepts(other, width, height));
                if !reuse {
                    log::info!("converting decoder output {:?} to yuv420p", other);
                    self.scaler = Some(Scaler::new(other, width, height, Pixel::YUV420P)?);
                }
                let mut scaled = frame::Video::empty();
                if let Some(scaler) = self.scaler.as_mut() {
                    scaler.run(frame, &mut scaled)?;
                }
                (copy_yuv420p(&scaled), PixelFormat::Yuv420p)
            }
        };

        let format = StreamFormat::new(width, height, pixel_format);
        self.format = Some(format);
        Ok(Picture {
            data,
            format,
            pts: frame.pts(),
        })
    }
}

impl Codec for FfmpegCodec {
    fn decode(&mut self, unit: &[u8]) -> Result<Vec<Picture>, CodecError> {
        let packet = Packet::copy(unit);
        match self.decoder.send_packet(&packet) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::InvalidData) => {
                return Err(CodecError::Corrupt("invalid data in access unit".to_string()));
            }
            Err(err) => return Err(CodecError::Internal(err.to_string())),
        }
        self.drain()
    }

    fn flush(&mut self) -> Result<Vec<Picture>, CodecError> {
        self.decoder
            .send_eof()
            .map_err(|e| CodecError::Internal(e.to_string()))?;
        let pictures = self.drain()?;
        self.decoder.flush();
        Ok(pictures)
    }

    fn format(&self) -> Option<StreamFormat> {
        self.format.or_else(|| {
            let (width, height) = (self.decoder.width(), self.decoder.height());
            let pixel_format = match self.decoder.format() {
                Pixel::None => return None,
                Pixel::NV12 => PixelFormat::Nv12,
                _ => PixelFormat::Yuv420p,
            };
            (width > 0 && height > 0).then(|| StreamFormat::new(width, height, pixel_format))
        })
    }

    fn name(&self) -> &str {
        "ffmpeg-h264"
    }
}

// the decoder context is only ever touched from the pipeline thread
unsafe impl Send for FfmpegCodec {}

fn copy_yuv420p(frame: &frame::Video) -> Bytes {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let mut buf = BytesMut::with_capacity(width * height + 2 * cw * ch);
    copy_plane(frame, 0, width, height, &mut buf);
    copy_plane(frame, 1, cw, ch, &mut buf);
    copy_plane(frame, 2, cw, ch, &mut buf);
    buf.freeze()
}

fn copy_nv12(frame: &frame::Video) -> Bytes {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let mut buf = BytesMut::with_capacity(width * height + 2 * cw * ch);
    copy_plane(frame, 0, width, height, &mut buf);
    copy_plane(frame, 1, 2 * cw, ch, &mut buf);
    buf.freeze()
}

/// Appends one plane without its line padding.
fn copy_plane(frame: &frame::Video, plane: usize, row_bytes: usize, rows: usize, buf: &mut BytesMut) {
    let stride = frame.stride(plane);
    let data = frame.data(plane);
    for row in 0..rows {
        let start = row * stride;
        buf.extend_from_slice(&data[start..start + row_bytes]);
    }
}
