use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use frame_bus::error::SinkError;
use frame_bus::frame::{Frame, PixelFormat, StreamFormat};
use frame_bus::sink::Sink;

/// Where a [`DeviceSink`] puts its frames.
pub trait FrameOutput: Send {
    /// Asks the device for `format` and returns what it settled on.
    fn set_format(&mut self, format: &StreamFormat) -> io::Result<StreamFormat>;

    fn write_frame(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Output side of a v4l2loopback node. The format is set with `VIDIOC_S_FMT`
/// on the device handle, which stays open for as long as frames are written.
#[cfg(target_os = "linux")]
pub struct V4l2Output {
    device: v4l::Device,
    file: File,
}

#[cfg(target_os = "linux")]
impl V4l2Output {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        use v4l::capability::Flags;

        let device = v4l::Device::with_path(path)
            .with_context(|| format!("open virtual device {}", path.display()))?;
        let caps = device
            .query_caps()
            .with_context(|| format!("{} is not a v4l2 device", path.display()))?;
        if !caps.capabilities.contains(Flags::VIDEO_OUTPUT) {
            anyhow::bail!(
                "{} ({}, {}) does not accept video output",
                path.display(),
                caps.card,
                caps.driver
            );
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .with_context(|| format!("open {} for writing", path.display()))?;
        log::debug!("{} is {} ({})", path.display(), caps.card, caps.driver);
        Ok(Self { device, file })
    }
}

#[cfg(target_os = "linux")]
impl FrameOutput for V4l2Output {
    fn set_format(&mut self, format: &StreamFormat) -> io::Result<StreamFormat> {
        use v4l::video::Output;

        let wanted = v4l::Format::new(format.width, format.height, fourcc(format.pixel_format));
        let applied = Output::set_format(&self.device, &wanted)?;
        let pixel_format = pixel_format(applied.fourcc).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "device chose unsupported pixel format {}",
                    String::from_utf8_lossy(&applied.fourcc.repr)
                ),
            )
        })?;
        Ok(StreamFormat::new(applied.width, applied.height, pixel_format))
    }

    fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(target_os = "linux")]
fn fourcc(format: PixelFormat) -> v4l::FourCC {
    let code = match format {
        PixelFormat::Yuv420p => b"YU12",
        PixelFormat::Nv12 => b"NV12",
        PixelFormat::Rgb24 => b"RGB3",
        PixelFormat::Bgr24 => b"BGR3",
        PixelFormat::Yuyv422 => b"YUYV",
    };
    v4l::FourCC::new(code)
}

#[cfg(target_os = "linux")]
fn pixel_format(fourcc: v4l::FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"YU12" => Some(PixelFormat::Yuv420p),
        b"NV12" => Some(PixelFormat::Nv12),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"YUYV" => Some(PixelFormat::Yuyv422),
        _ => None,
    }
}

/// Writes raw frames to a virtual camera.
///
/// The device is switched to `width x height` in `format` when the stream is
/// negotiated; streams of any other size are refused.
pub struct DeviceSink {
    label: String,
    output: Box<dyn FrameOutput>,
    width: u32,
    height: u32,
    format: PixelFormat,
    written: u64,
}

impl DeviceSink {
    #[cfg(target_os = "linux")]
    pub fn open(path: &Path, width: u32, height: u32, format: PixelFormat) -> anyhow::Result<Self> {
        let output = V4l2Output::open(path)?;
        log::info!(
            "virtual device {} opened for {}x{} {}",
            path.display(),
            width,
            height,
            format
        );
        Ok(Self::with_output(
            &path.display().to_string(),
            Box::new(output),
            width,
            height,
            format,
        ))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(path: &Path, _width: u32, _height: u32, _format: PixelFormat) -> anyhow::Result<Self> {
        anyhow::bail!("cannot open {}: virtual devices need v4l2", path.display())
    }

    pub fn with_output(
        label: &str,
        output: Box<dyn FrameOutput>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            label: label.to_string(),
            output,
            width,
            height,
            format,
            written: 0,
        }
    }
}

impl Sink for DeviceSink {
    fn name(&self) -> &str {
        "virtual-device"
    }

    fn required_format(&self) -> Option<PixelFormat> {
        Some(self.format)
    }

    fn configure(&mut self, format: &StreamFormat) -> Result<(), SinkError> {
        if format.width != self.width || format.height != self.height {
            return Err(SinkError::Config(format!(
                "stream is {}x{} but {} expects {}x{}",
                format.width, format.height, self.label, self.width, self.height
            )));
        }

        let wanted = StreamFormat::new(self.width, self.height, self.format);
        let applied = self
            .output
            .set_format(&wanted)
            .map_err(|e| SinkError::Config(format!("{} rejected {}: {}", self.label, wanted, e)))?;
        if applied != wanted {
            return Err(SinkError::Config(format!(
                "{} switched to {} instead of {}",
                self.label, applied, wanted
            )));
        }
        log::info!("{} set to {}", self.label, applied);
        Ok(())
    }

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.output
            .write_frame(&frame.data)
            .map_err(|e| SinkError::Fatal(format!("write to {}: {}", self.label, e)))?;
        self.written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        log::info!("{} frames written to {}", self.written, self.label);
        self.output.flush()?;
        Ok(())
    }
}
