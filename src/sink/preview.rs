use std::sync::{Arc, Mutex};

use bytes::Bytes;
use frame_bus::error::SinkError;
use frame_bus::frame::{Frame, PixelFormat, StreamFormat};
use frame_bus::sink::Sink;
use jpeg_encoder::{ColorType, Encoder};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, Serialize)]
pub struct PreviewStats {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub last_seq: u64,
}

/// Latest-frame slot shared by the preview sink and the HTTP server. Readers
/// only ever see the newest JPEG.
pub struct PreviewSurface {
    latest: watch::Sender<Option<Bytes>>,
    stats: Mutex<PreviewStats>,
    closed: CancellationToken,
}

impl PreviewSurface {
    pub fn new(closed: CancellationToken) -> Arc<Self> {
        let (latest, _) = watch::channel(None);
        Arc::new(Self {
            latest,
            stats: Mutex::new(PreviewStats::default()),
            closed,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Bytes>> {
        self.latest.subscribe()
    }

    pub fn stats(&self) -> PreviewStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn publish(&self, jpeg: Bytes, frame: &Frame) {
        self.latest.send_replace(Some(jpeg));
        if let Ok(mut stats) = self.stats.lock() {
            stats.frames += 1;
            stats.width = frame.width();
            stats.height = frame.height();
            stats.last_seq = frame.seq;
        }
    }
}

/// Encodes frames to JPEG for the browser preview.
pub struct PreviewSink {
    surface: Arc<PreviewSurface>,
    quality: u8,
    buf: Vec<u8>,
}

impl PreviewSink {
    pub fn new(surface: Arc<PreviewSurface>, quality: u8) -> Self {
        Self {
            surface,
            quality,
            buf: Vec::new(),
        }
    }
}

impl Sink for PreviewSink {
    fn name(&self) -> &str {
        "preview"
    }

    fn required_format(&self) -> Option<PixelFormat> {
        Some(PixelFormat::Bgr24)
    }

    fn configure(&mut self, format: &StreamFormat) -> Result<(), SinkError> {
        if self.surface.is_closed() {
            return Err(SinkError::Fatal("preview surface is gone".to_string()));
        }
        if format.width > u16::MAX as u32 || format.height > u16::MAX as u32 {
            return Err(SinkError::Config(format!("{} too large for jpeg", format)));
        }
        self.buf = Vec::with_capacity(format.frame_size() / 8);
        Ok(())
    }

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.surface.is_closed() {
            return Err(SinkError::Fatal("preview surface is gone".to_string()));
        }

        self.buf.clear();
        let encoder = Encoder::new(&mut self.buf, self.quality);
        encoder
            .encode(
                &frame.data,
                frame.width() as u16,
                frame.height() as u16,
                ColorType::Bgr,
            )
            .map_err(|e| SinkError::Fatal(format!("jpeg encode: {}", e)))?;

        self.surface.publish(Bytes::copy_from_slice(&self.buf), frame);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        log::debug!("preview sink finished after {} frames", self.surface.stats().frames);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr_frame(seq: u64) -> Frame {
        let format = StreamFormat::new(16, 8, PixelFormat::Bgr24);
        Frame::new(Bytes::from(vec![200; format.frame_size()]), format, seq, 0, None)
    }

    #[test]
    fn test_publishes_jpeg() {
        let surface = PreviewSurface::new(CancellationToken::new());
        let mut sink = PreviewSink::new(surface.clone(), 60);
        let frame = bgr_frame(3);
        sink.configure(&frame.format).unwrap();
        sink.consume(&frame).unwrap();

        let jpeg = surface.subscribe().borrow().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        let stats = surface.stats();
        assert_eq!((stats.frames, stats.width, stats.height, stats.last_seq), (1, 16, 8, 3));
    }

    #[test]
    fn test_closed_surface_is_fatal() {
        let surface = PreviewSurface::new(CancellationToken::new());
        let mut sink = PreviewSink::new(surface.clone(), 60);
        let frame = bgr_frame(1);
        sink.configure(&frame.format).unwrap();
        surface.close();
        assert!(matches!(sink.consume(&frame), Err(SinkError::Fatal(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let surface = PreviewSurface::new(CancellationToken::new());
        let mut sink = PreviewSink::new(surface, 60);
        let format = StreamFormat::new(70_000, 2, PixelFormat::Bgr24);
        assert!(matches!(sink.configure(&format), Err(SinkError::Config(_))));
    }
}
