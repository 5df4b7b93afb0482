//! Doubles shared by the unit tests: a scripted codec, Annex B stream builders
//! and an instrumented sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use crate::annexb::{self, NAL_SPS};
use crate::codec::{Codec, Picture};
use crate::error::{CodecError, SinkError};
use crate::frame::{Frame, PixelFormat, StreamFormat};
use crate::sink::Sink;

/// Payload byte that makes [`FakeCodec`] report corruption.
pub const CORRUPT: u8 = 0xEE;

/// Payload byte that makes [`FakeCodec`] fail internally.
pub const BROKEN: u8 = 0xEF;

/// Understands the toy bitstream built by the helpers below: an SPS carries
/// `[width, height]`, the third byte of the first slice is the picture id and
/// every sample of the output picture is set to it.
#[derive(Default)]
pub struct FakeCodec {
    format: Option<StreamFormat>,
    delay: usize,
    held: VecDeque<Picture>,
}

impl FakeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds back `delay` pictures, like a decoder with B-frame reordering.
    pub fn with_delay(delay: usize) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

impl Codec for FakeCodec {
    fn decode(&mut self, unit: &[u8]) -> Result<Vec<Picture>, CodecError> {
        let mut picture_id = None;
        for nal in annexb::split_nals(unit) {
            if nal.contains(&BROKEN) {
                return Err(CodecError::Internal("send_packet: out of memory".to_string()));
            }
            if nal.contains(&CORRUPT) {
                return Err(CodecError::Corrupt(format!(
                    "invalid nal type {}",
                    annexb::nal_type(nal[0])
                )));
            }
            match annexb::nal_type(nal[0]) {
                NAL_SPS if nal.len() >= 3 => {
                    self.format = Some(StreamFormat::new(
                        nal[1] as u32,
                        nal[2] as u32,
                        PixelFormat::Yuv420p,
                    ));
                }
                t if annexb::is_vcl(t) && picture_id.is_none() => {
                    picture_id = Some(nal.get(2).copied().unwrap_or(0));
                }
                _ => {}
            }
        }

        let Some(id) = picture_id else {
            return Ok(Vec::new());
        };
        let format = self
            .format
            .ok_or_else(|| CodecError::Corrupt("slice before sps".to_string()))?;
        self.held.push_back(Picture {
            data: Bytes::from(vec![id; format.frame_size()]),
            format,
            pts: Some(id as i64),
        });

        let mut out = Vec::new();
        while self.held.len() > self.delay {
            out.extend(self.held.pop_front());
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Picture>, CodecError> {
        Ok(self.held.drain(..).collect())
    }

    fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    fn name(&self) -> &str {
        "fake"
    }
}

fn nal(payload: &[u8]) -> Vec<u8> {
    let mut out = annexb::START_CODE.to_vec();
    out.extend_from_slice(payload);
    out
}

pub fn sps(width: u8, height: u8) -> Vec<u8> {
    nal(&[0x67, width, height])
}

pub fn pps() -> Vec<u8> {
    nal(&[0x68, 0xCE])
}

/// IDR slice starting a new picture.
pub fn idr(id: u8) -> Vec<u8> {
    nal(&[0x65, 0x88, id, 0x84])
}

/// Non-IDR slice starting a new picture.
pub fn slice(id: u8) -> Vec<u8> {
    nal(&[0x41, 0x9A, id, 0x84])
}

/// Further slice of the current picture (`first_mb_in_slice` != 0).
pub fn continuation(id: u8) -> Vec<u8> {
    nal(&[0x41, 0x1A, id, 0x84])
}

pub fn corrupt_slice() -> Vec<u8> {
    nal(&[0x41, 0x9A, CORRUPT, 0x84])
}

pub fn broken_slice() -> Vec<u8> {
    nal(&[0x41, 0x9A, BROKEN, 0x84])
}

pub fn aud() -> Vec<u8> {
    nal(&[0x09, 0xF0])
}

pub fn stream(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}

/// A 4x2 yuv420p frame filled with `id`.
pub fn frame(seq: u64, id: u8) -> Frame {
    let format = StreamFormat::new(4, 2, PixelFormat::Yuv420p);
    Frame::new(
        Bytes::from(vec![id; format.frame_size()]),
        format,
        seq,
        0,
        None,
    )
}

/// What a [`TestSink`] observed, readable after the sink moved to its worker.
#[derive(Clone, Default)]
pub struct Record {
    seqs: Arc<Mutex<Vec<u64>>>,
    formats: Arc<Mutex<Vec<StreamFormat>>>,
    finalized: Arc<AtomicBool>,
}

impl Record {
    pub fn seqs(&self) -> Vec<u64> {
        self.seqs.lock().unwrap().clone()
    }

    pub fn formats(&self) -> Vec<StreamFormat> {
        self.formats.lock().unwrap().clone()
    }

    pub fn finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

pub struct TestSink {
    name: String,
    record: Record,
    gate: Option<Receiver<()>>,
    fail_at: Option<u64>,
    reject_config: bool,
    required: Option<PixelFormat>,
    pace: Option<Duration>,
}

impl TestSink {
    pub fn new(name: &str) -> (Self, Record) {
        let record = Record::default();
        let sink = Self {
            name: name.to_string(),
            record: record.clone(),
            gate: None,
            fail_at: None,
            reject_config: false,
            required: None,
            pace: None,
        };
        (sink, record)
    }

    /// Each `consume` waits for one message on the returned sender; dropping it
    /// opens the gate for good.
    pub fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.gate = Some(rx);
        (self, tx)
    }

    pub fn fail_at(mut self, seq: u64) -> Self {
        self.fail_at = Some(seq);
        self
    }

    pub fn reject_config(mut self) -> Self {
        self.reject_config = true;
        self
    }

    pub fn requiring(mut self, format: PixelFormat) -> Self {
        self.required = Some(format);
        self
    }

    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

impl Sink for TestSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_format(&self) -> Option<PixelFormat> {
        self.required
    }

    fn configure(&mut self, format: &StreamFormat) -> Result<(), SinkError> {
        if self.reject_config {
            return Err(SinkError::Config(format!("{} not accepted", format)));
        }
        self.record.formats.lock().unwrap().push(*format);
        Ok(())
    }

    fn consume(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        if self.fail_at == Some(frame.seq) {
            return Err(SinkError::Fatal(format!("failed at frame {}", frame.seq)));
        }
        self.record.seqs.lock().unwrap().push(frame.seq);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SinkError> {
        self.record.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }
}
