use bytes::BytesMut;

use crate::{
    error::ConvertError,
    frame::{Frame, PixelFormat, StreamFormat},
};

/// Whether [`convert_into`] can produce `to` from `from`.
pub fn supported(from: PixelFormat, to: PixelFormat) -> bool {
    use PixelFormat::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Yuv420p | Nv12, _) => true,
        (Rgb24 | Bgr24, Rgb24 | Bgr24 | Yuyv422) => true,
        _ => false,
    }
}

/// Converts one tightly packed image of `format` into `to`, writing `dst`.
pub fn convert_into(
    src: &[u8],
    format: StreamFormat,
    to: PixelFormat,
    dst: &mut [u8],
) -> Result<(), ConvertError> {
    let from = format.pixel_format;
    if !supported(from, to) {
        return Err(ConvertError::Unsupported { from, to });
    }
    if to == PixelFormat::Yuyv422 && format.width % 2 != 0 {
        return Err(ConvertError::OddDimensions(to, format.width, format.height));
    }
    let expected = format.frame_size();
    if src.len() < expected {
        return Err(ConvertError::ShortBuffer {
            expected,
            actual: src.len(),
        });
    }
    let out = format.with_pixel_format(to).frame_size();
    if dst.len() < out {
        return Err(ConvertError::ShortBuffer {
            expected: out,
            actual: dst.len(),
        });
    }
    let width = format.width as usize;
    let height = format.height as usize;

    if from == to {
        dst[..expected].copy_from_slice(&src[..expected]);
        return Ok(());
    }

    match (from, to) {
        (PixelFormat::Rgb24, PixelFormat::Bgr24) | (PixelFormat::Bgr24, PixelFormat::Rgb24) => {
            for (s, d) in src[..expected].chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
                d[0] = s[2];
                d[1] = s[1];
                d[2] = s[0];
            }
        }
        (PixelFormat::Rgb24 | PixelFormat::Bgr24, PixelFormat::Yuyv422) => {
            let (ri, bi) = if from == PixelFormat::Rgb24 { (0, 2) } else { (2, 0) };
            for j in 0..height {
                for i in (0..width).step_by(2) {
                    let p0 = (j * width + i) * 3;
                    let p1 = p0 + 3;
                    let (y0, u0, v0) = rgb_to_yuv(src[p0 + ri], src[p0 + 1], src[p0 + bi]);
                    let (y1, u1, v1) = rgb_to_yuv(src[p1 + ri], src[p1 + 1], src[p1 + bi]);
                    let o = (j * width + i) * 2;
                    dst[o] = y0;
                    dst[o + 1] = ((u0 as u16 + u1 as u16) / 2) as u8;
                    dst[o + 2] = y1;
                    dst[o + 3] = ((v0 as u16 + v1 as u16) / 2) as u8;
                }
            }
        }
        (PixelFormat::Yuv420p | PixelFormat::Nv12, _) => {
            let planes = Planes420::new(src, format);
            match to {
                PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                    let (ri, bi) = if to == PixelFormat::Rgb24 { (0, 2) } else { (2, 0) };
                    for j in 0..height {
                        for i in 0..width {
                            let (y, u, v) = planes.at(i, j);
                            let (r, g, b) = yuv_to_rgb(y, u, v);
                            let o = (j * width + i) * 3;
                            dst[o + ri] = r;
                            dst[o + 1] = g;
                            dst[o + bi] = b;
                        }
                    }
                }
                PixelFormat::Yuyv422 => {
                    for j in 0..height {
                        for i in (0..width).step_by(2) {
                            let (y0, u, v) = planes.at(i, j);
                            let (y1, _, _) = planes.at(i + 1, j);
                            let o = (j * width + i) * 2;
                            dst[o] = y0;
                            dst[o + 1] = u;
                            dst[o + 2] = y1;
                            dst[o + 3] = v;
                        }
                    }
                }
                PixelFormat::Yuv420p | PixelFormat::Nv12 => {
                    let y_size = width * height;
                    dst[..y_size].copy_from_slice(&src[..y_size]);
                    let cw = width.div_ceil(2);
                    let ch = height.div_ceil(2);
                    let c_size = cw * ch;
                    for k in 0..c_size {
                        let (u, v) = planes.chroma(k);
                        if to == PixelFormat::Nv12 {
                            dst[y_size + 2 * k] = u;
                            dst[y_size + 2 * k + 1] = v;
                        } else {
                            dst[y_size + k] = u;
                            dst[y_size + c_size + k] = v;
                        }
                    }
                }
            }
        }
        _ => return Err(ConvertError::Unsupported { from, to }),
    }
    Ok(())
}

/// Converts frames into one target format, reusing its output buffer between
/// frames of the same geometry.
pub struct Converter {
    target: PixelFormat,
    source: Option<StreamFormat>,
    buf: BytesMut,
}

impl Converter {
    pub fn new(target: PixelFormat) -> Self {
        Self {
            target,
            source: None,
            buf: BytesMut::new(),
        }
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    /// Checks `source` can be converted and drops buffers sized for the previous format.
    pub fn reset(&mut self, source: StreamFormat) -> Result<(), ConvertError> {
        if !supported(source.pixel_format, self.target) {
            return Err(ConvertError::Unsupported {
                from: source.pixel_format,
                to: self.target,
            });
        }
        if self.target == PixelFormat::Yuyv422 && source.width % 2 != 0 {
            return Err(ConvertError::OddDimensions(self.target, source.width, source.height));
        }
        self.buf = BytesMut::with_capacity(source.with_pixel_format(self.target).frame_size());
        self.source = Some(source);
        Ok(())
    }

    pub fn convert(&mut self, frame: &Frame) -> Result<Frame, ConvertError> {
        if frame.pixel_format() == self.target {
            return Ok(frame.clone());
        }
        if self.source != Some(frame.format) {
            self.reset(frame.format)?;
        }

        let out_format = frame.format.with_pixel_format(self.target);
        // reclaims the previous allocation once its frame has been dropped
        self.buf.clear();
        self.buf.resize(out_format.frame_size(), 0);
        convert_into(&frame.data, frame.format, self.target, &mut self.buf)?;

        Ok(Frame::new(
            self.buf.split().freeze(),
            out_format,
            frame.seq,
            frame.epoch,
            frame.pts,
        ))
    }
}

struct Planes420<'a> {
    src: &'a [u8],
    nv12: bool,
    width: usize,
    y_size: usize,
    cw: usize,
    c_size: usize,
}

impl<'a> Planes420<'a> {
    fn new(src: &'a [u8], format: StreamFormat) -> Self {
        let width = format.width as usize;
        let height = format.height as usize;
        let cw = width.div_ceil(2);
        Self {
            src,
            nv12: format.pixel_format == PixelFormat::Nv12,
            width,
            y_size: width * height,
            cw,
            c_size: cw * height.div_ceil(2),
        }
    }

    fn at(&self, i: usize, j: usize) -> (u8, u8, u8) {
        let (u, v) = self.chroma((j / 2) * self.cw + i / 2);
        (self.src[j * self.width + i], u, v)
    }

    fn chroma(&self, k: usize) -> (u8, u8) {
        if self.nv12 {
            (self.src[self.y_size + 2 * k], self.src[self.y_size + 2 * k + 1])
        } else {
            (self.src[self.y_size + k], self.src[self.y_size + self.c_size + k])
        }
    }
}

// BT.601
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = (y + 1.402 * v).round().clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).round().clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).round().clamp(0.0, 255.0) as u8;
    (r, g, b)
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.168736 * r - 0.331264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418688 * g - 0.081312 * b + 128.0;
    (
        y.round().clamp(0.0, 255.0) as u8,
        u.round().clamp(0.0, 255.0) as u8,
        v.round().clamp(0.0, 255.0) as u8,
    )
}

#[cfg(test)]
#[path = "convert_test.rs"]
mod convert_test;
