//! H.264 Annex B framing: start codes, NAL headers and access-unit grouping.

use bytes::{Bytes, BytesMut};

pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Position of the next `00 00 01` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 2 < data.len() {
        if data[i + 2] > 1 {
            i += 3;
        } else if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some(i);
        } else {
            i += 1;
        }
    }
    None
}

pub fn nal_type(header: u8) -> u8 {
    header & 0x1F
}

pub fn is_vcl(nal_type: u8) -> bool {
    (NAL_SLICE..=NAL_IDR).contains(&nal_type)
}

/// Whether a NAL with this header (and first payload byte) opens a new access unit
/// once the current one already holds a slice.
///
/// For slices, `first_mb_in_slice` is coded as ue(v); its value is 0 exactly when
/// the first bit is set.
pub fn starts_access_unit(header: u8, next: u8) -> bool {
    match nal_type(header) {
        NAL_AUD | NAL_SPS | NAL_PPS | NAL_SEI | 14..=18 => true,
        t if is_vcl(t) => next & 0x80 != 0,
        _ => false,
    }
}

/// Strips trailing zero bytes which belong to the next start code or are padding.
pub fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let mut end = nal.len();
    while end > 0 && nal[end - 1] == 0 {
        end -= 1;
    }
    &nal[..end]
}

/// True for bytes that are only zero padding, such as the leading zero of a
/// 4-byte start code.
pub fn is_zero_padding(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

/// Groups complete NAL units into access units, each re-emitted in Annex B form.
#[derive(Debug, Default)]
pub struct AccessUnitAssembler {
    pending: BytesMut,
    has_vcl: bool,
    nal_count: usize,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a NAL starting with `header`/`next` would close the pending unit.
    pub fn begins_new_unit(&self, header: u8, next: u8) -> bool {
        self.has_vcl && starts_access_unit(header, next)
    }

    pub fn append(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        self.pending.extend_from_slice(&START_CODE);
        self.pending.extend_from_slice(nal);
        self.nal_count += 1;
        if is_vcl(nal_type(nal[0])) {
            self.has_vcl = true;
        }
    }

    /// Hands out the pending unit, if any.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        self.has_vcl = false;
        self.nal_count = 0;
        Some(self.pending.split().freeze())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.has_vcl = false;
        self.nal_count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bytes held for the pending unit, start codes included.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_vcl(&self) -> bool {
        self.has_vcl
    }

    pub fn nal_count(&self) -> usize {
        self.nal_count
    }
}

/// Splits an Annex B buffer into NAL payloads (start codes removed).
pub fn split_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut pos = match find_start_code(data, 0) {
        Some(p) => p + 3,
        None => return nals,
    };
    while let Some(next) = find_start_code(data, pos) {
        let nal = trim_trailing_zeros(&data[pos..next]);
        if !nal.is_empty() {
            nals.push(nal);
        }
        pos = next + 3;
    }
    let last = trim_trailing_zeros(&data[pos..]);
    if !last.is_empty() {
        nals.push(last);
    }
    nals
}
