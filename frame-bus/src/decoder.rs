use bytes::{Buf, Bytes, BytesMut};

use crate::{
    annexb::{self, AccessUnitAssembler},
    codec::{Codec, Picture},
    config::{DEFAULT_MAX_UNIT_BYTES, DecodePolicy},
    error::{CodecError, DecodeError},
    frame::{Frame, StreamFormat},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    /// Nothing buffered.
    AwaitingUnit,
    /// A partial unit is buffered, waiting for more bytes.
    HaveResidual,
    /// Discarding input until the next access unit begins.
    Resyncing,
}

/// Turns an arbitrarily chunked Annex B byte stream into sequenced frames.
///
/// Bytes are accumulated until a NAL unit is delimited by the following start
/// code. NAL units are grouped into access units; an access unit is released to
/// the codec as soon as the header of the next one is visible.
pub struct Decoder<C> {
    codec: C,
    policy: DecodePolicy,
    max_unit_bytes: usize,
    buf: BytesMut,
    // resume offset for the start code scan, relative to `buf`
    scan_from: usize,
    assembler: AccessUnitAssembler,
    state: DecoderState,
    next_seq: u64,
    format: Option<StreamFormat>,
    epoch: u32,
    units: u64,
    resyncs: u64,
}

impl<C: Codec> Decoder<C> {
    pub fn new(codec: C, policy: DecodePolicy) -> Self {
        Self {
            codec,
            policy,
            max_unit_bytes: DEFAULT_MAX_UNIT_BYTES,
            buf: BytesMut::new(),
            scan_from: 0,
            assembler: AccessUnitAssembler::new(),
            state: DecoderState::AwaitingUnit,
            next_seq: 1,
            format: None,
            epoch: 0,
            units: 0,
            resyncs: 0,
        }
    }

    /// Caps the bytes buffered for one access unit. Going past it counts as
    /// corruption and is handled by the decode policy.
    pub fn with_max_unit_bytes(mut self, max_unit_bytes: usize) -> Self {
        self.max_unit_bytes = max_unit_bytes.max(1);
        self
    }

    /// Appends `chunk` and decodes every access unit that became complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        let mut resync_spent = false;
        self.buf.extend_from_slice(chunk);

        while let Some(nal) = self.next_nal() {
            self.accept_nal(&nal, &mut frames, &mut resync_spent)?;
        }

        let pending = self.buf.len() + self.assembler.len();
        if pending > self.max_unit_bytes {
            self.buf.clear();
            self.scan_from = 0;
            let err = CodecError::Corrupt(format!(
                "{} bytes buffered without completing an access unit, limit is {}",
                pending, self.max_unit_bytes
            ));
            self.on_decode_error(err, &mut resync_spent)?;
        }

        // release the pending unit early when the next one has visibly started
        if self.state != DecoderState::Resyncing {
            if let Some((header, next)) = self.peek_header() {
                if self.assembler.begins_new_unit(header, next) {
                    if let Some(unit) = self.assembler.take() {
                        self.decode_unit(&unit, &mut frames, &mut resync_spent)?;
                    }
                }
            }
        }

        self.update_state();
        Ok(frames)
    }

    /// Called when the source has gone quiet for a read timeout.
    ///
    /// A buffered NAL unit ending on a non-zero byte is taken as complete, and
    /// the pending access unit is decoded if it holds a slice. The last picture
    /// before a pause is then not held back until the next start code arrives.
    /// Codec state is kept, unlike [`Decoder::flush`].
    pub fn idle(&mut self) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        let mut resync_spent = false;

        if self.buf.last().is_some_and(|b| *b != 0) {
            if let Some(nal) = self.take_residual() {
                self.buf.clear();
                self.scan_from = 0;
                self.accept_nal(&nal, &mut frames, &mut resync_spent)?;
            }
        }
        if self.state != DecoderState::Resyncing && self.assembler.has_vcl() {
            if let Some(unit) = self.assembler.take() {
                self.decode_unit(&unit, &mut frames, &mut resync_spent)?;
            }
        }

        self.update_state();
        Ok(frames)
    }

    /// Treats the buffered residual as the final unit and drains the codec.
    pub fn flush(&mut self) -> Result<Vec<Frame>, DecodeError> {
        let mut frames = Vec::new();
        let mut resync_spent = false;

        if let Some(nal) = self.take_residual() {
            self.accept_nal(&nal, &mut frames, &mut resync_spent)?;
        }
        if self.state != DecoderState::Resyncing {
            if let Some(unit) = self.assembler.take() {
                self.decode_unit(&unit, &mut frames, &mut resync_spent)?;
            }
        }
        self.assembler.clear();

        let pictures = self.codec.flush().map_err(DecodeError::Flush)?;
        for picture in pictures {
            frames.push(self.stamp(picture));
        }

        self.buf.clear();
        self.scan_from = 0;
        self.state = DecoderState::AwaitingUnit;
        Ok(frames)
    }

    /// Negotiated stream format, from the codec or the last emitted frame.
    pub fn format(&self) -> Option<StreamFormat> {
        self.codec.format().or(self.format)
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn frames_emitted(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn units_decoded(&self) -> u64 {
        self.units
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Undecoded bytes held in the accumulation buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.buf.len()
    }

    fn accept_nal(
        &mut self,
        nal: &[u8],
        frames: &mut Vec<Frame>,
        resync_spent: &mut bool,
    ) -> Result<(), DecodeError> {
        let header = nal[0];
        let next = nal.get(1).copied().unwrap_or(0);

        if self.assembler.begins_new_unit(header, next) {
            if let Some(unit) = self.assembler.take() {
                self.decode_unit(&unit, frames, resync_spent)?;
            }
        }

        if self.state == DecoderState::Resyncing {
            if !annexb::starts_access_unit(header, next) {
                log::trace!("resync: skipping nal type {}", annexb::nal_type(header));
                return Ok(());
            }
            log::info!(
                "resynced at nal type {} after {} units",
                annexb::nal_type(header),
                self.units
            );
            self.state = DecoderState::HaveResidual;
        }

        self.assembler.append(nal);
        Ok(())
    }

    fn decode_unit(
        &mut self,
        unit: &[u8],
        frames: &mut Vec<Frame>,
        resync_spent: &mut bool,
    ) -> Result<(), DecodeError> {
        self.units += 1;
        match self.codec.decode(unit) {
            Ok(pictures) => {
                for picture in pictures {
                    frames.push(self.stamp(picture));
                }
                Ok(())
            }
            Err(err) => self.on_decode_error(err, resync_spent),
        }
    }

    fn on_decode_error(&mut self, err: CodecError, resync_spent: &mut bool) -> Result<(), DecodeError> {
        if matches!(err, CodecError::Internal(_)) {
            return Err(DecodeError::Codec(err));
        }
        match self.policy {
            DecodePolicy::Abort => Err(DecodeError::Corrupt(err)),
            DecodePolicy::SkipAndResync if *resync_spent => Err(DecodeError::ResyncExhausted(err)),
            DecodePolicy::SkipAndResync => {
                *resync_spent = true;
                self.resyncs += 1;
                log::warn!("decode error on unit {}: {}, resyncing", self.units, err);
                self.assembler.clear();
                self.state = DecoderState::Resyncing;
                Ok(())
            }
        }
    }

    fn stamp(&mut self, picture: Picture) -> Frame {
        match self.format {
            Some(current) if current != picture.format => {
                self.epoch += 1;
                log::info!("stream format changed: {} -> {}", current, picture.format);
            }
            None => log::info!("stream format: {}", picture.format),
            _ => {}
        }
        self.format = Some(picture.format);

        let seq = self.next_seq;
        self.next_seq += 1;
        Frame::new(picture.data, picture.format, seq, self.epoch, picture.pts)
    }

    /// Next NAL payload that is followed by a start code, if the buffer holds one.
    fn next_nal(&mut self) -> Option<Bytes> {
        loop {
            let head = match annexb::find_start_code(&self.buf, 0) {
                Some(head) => head,
                None => {
                    self.drop_garbage();
                    return None;
                }
            };
            if head > 0 {
                // only possible before the first start code or while resyncing
                if !annexb::is_zero_padding(&self.buf[..head]) {
                    log::debug!("discarding {} bytes before start code", head);
                }
                self.buf.advance(head);
                self.scan_from = self.scan_from.saturating_sub(head);
            }

            let payload = 3;
            let next = match annexb::find_start_code(&self.buf, self.scan_from.max(payload)) {
                Some(next) => next,
                None => {
                    self.scan_from = self.buf.len().saturating_sub(2).max(payload);
                    return None;
                }
            };

            let nal = Bytes::copy_from_slice(annexb::trim_trailing_zeros(&self.buf[payload..next]));
            self.buf.advance(next);
            self.scan_from = 0;
            if !nal.is_empty() {
                return Some(nal);
            }
        }
    }

    fn take_residual(&mut self) -> Option<Bytes> {
        let head = annexb::find_start_code(&self.buf, 0)?;
        let nal = annexb::trim_trailing_zeros(&self.buf[head + 3..]);
        if nal.is_empty() {
            return None;
        }
        Some(Bytes::copy_from_slice(nal))
    }

    fn peek_header(&self) -> Option<(u8, u8)> {
        if self.buf.len() >= 5 && self.buf[..3] == [0, 0, 1] {
            Some((self.buf[3], self.buf[4]))
        } else {
            None
        }
    }

    // Keeps the last two bytes: they may be the start of a split start code.
    fn drop_garbage(&mut self) {
        let keep = 2.min(self.buf.len());
        let drop = self.buf.len() - keep;
        if drop > 0 {
            log::debug!("discarding {} bytes without start code", drop);
            self.buf.advance(drop);
        }
        self.scan_from = 0;
    }

    fn update_state(&mut self) {
        if self.state == DecoderState::Resyncing {
            return;
        }
        self.state = if self.buf.is_empty() && self.assembler.is_empty() {
            DecoderState::AwaitingUnit
        } else {
            DecoderState::HaveResidual
        };
    }
}

#[cfg(test)]
#[path = "decoder_test.rs"]
mod decoder_test;
