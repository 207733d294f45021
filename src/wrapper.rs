//! Asynchronous (SIR) frame wrapper.
//!
//! ```text
//! +-------------+-----+-----------------------------+--------------+-----+
//! | XBOF * n    | BOF | escaped(header || payload)  | escaped(FCS) | EOF |
//! | 0xFF        | 0xC0|                             | LE, 2 bytes  | 0xC1|
//! +-------------+-----+-----------------------------+--------------+-----+
//! ```
//!
//! Inside the frame every BOF, EOF and CE byte is sent as `CE, byte ^ 0x20`.
//! The FCS covers the unescaped header and payload.

use alloc::vec::Vec;

use heapless::Vec as HeaplessVec;
use tracing::trace;

use crate::crc::{FCS_SIZE, Fcs16};
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_DATA_SIZE};

/// Beginning of frame.
pub const ASYNC_BOF: u8 = 0xC0;

/// Additional beginning of frame, sent before [`ASYNC_BOF`].
pub const ASYNC_XBOF: u8 = 0xFF;

/// End of frame.
pub const ASYNC_EOF: u8 = 0xC1;

/// Control escape.
pub const ASYNC_CE: u8 = 0x7D;

/// Value XOR-ed onto an escaped byte.
pub const ASYNC_XOR: u8 = 0x20;

/// Largest number of additional BOFs any negotiated link uses.
pub const MAX_ADDITIONAL_BOFS: usize = 48;

/// Capacity of the unwrap accumulation buffer.
pub const MAX_UNWRAPPED_SIZE: usize = 2 * MAX_DATA_SIZE + MAX_ADDITIONAL_BOFS + 4;

/// Smallest frame accepted by unwrap: header plus FCS.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + FCS_SIZE;

const fn needs_escape(byte: u8) -> bool {
    matches!(byte, ASYNC_BOF | ASYNC_EOF | ASYNC_CE)
}

fn escaped_len(data: &[u8]) -> usize {
    data.len() + data.iter().filter(|&&byte| needs_escape(byte)).count()
}

fn frame_fcs(header: &FrameHeader, fragments: &[&[u8]]) -> [u8; FCS_SIZE] {
    let mut fcs = Fcs16::new();
    fcs.update(&header.to_bytes());
    for fragment in fragments {
        fcs.update(fragment);
    }
    fcs.finish().to_le_bytes()
}

/// Number of bytes [`wrap`] writes for this frame.
pub fn wrapped_size(header: &FrameHeader, fragments: &[&[u8]], additional_bofs: usize) -> usize {
    let payload: usize = fragments.iter().map(|fragment| escaped_len(fragment)).sum();
    additional_bofs
        + 1
        + escaped_len(&header.to_bytes())
        + payload
        + escaped_len(&frame_fcs(header, fragments))
        + 1
}

struct Writer<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn raw(&mut self, byte: u8) {
        self.dst[self.pos] = byte;
        self.pos += 1;
    }

    fn escaped(&mut self, data: &[u8]) {
        for &byte in data {
            if needs_escape(byte) {
                self.raw(ASYNC_CE);
                self.raw(byte ^ ASYNC_XOR);
            } else {
                self.raw(byte);
            }
        }
    }
}

/// Wraps a frame into `dst`, returning the number of bytes written.
///
/// The payload may be split into several fragments; they are sent back to
/// back.
pub fn wrap(
    dst: &mut [u8],
    header: &FrameHeader,
    fragments: &[&[u8]],
    additional_bofs: usize,
) -> Result<usize> {
    let unwrapped: usize = HEADER_SIZE + fragments.iter().map(|f| f.len()).sum::<usize>() + FCS_SIZE;
    if unwrapped > MAX_UNWRAPPED_SIZE {
        return Err(Error::FrameTooLarge);
    }

    let needed = wrapped_size(header, fragments, additional_bofs);
    if dst.len() < needed {
        return Err(Error::BufferTooSmall { needed, available: dst.len() });
    }

    let mut writer = Writer { dst, pos: 0 };
    for _ in 0..additional_bofs {
        writer.raw(ASYNC_XBOF);
    }
    writer.raw(ASYNC_BOF);
    writer.escaped(&header.to_bytes());
    for fragment in fragments {
        writer.escaped(fragment);
    }
    writer.escaped(&frame_fcs(header, fragments));
    writer.raw(ASYNC_EOF);
    Ok(writer.pos)
}

/// Wraps a frame into a freshly allocated buffer.
pub fn wrap_to_vec(header: &FrameHeader, fragments: &[&[u8]], additional_bofs: usize) -> Result<Vec<u8>> {
    let size = wrapped_size(header, fragments, additional_bofs);
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
    buffer.resize(size, 0);
    let len = wrap(&mut buffer, header, fragments, additional_bofs)?;
    buffer.truncate(len);
    Ok(buffer)
}

/// Incremental unwrap state of one receive path.
#[derive(Debug, Default)]
pub struct WrapperState {
    in_frame: bool,
    escaped: bool,
    buffer: HeaplessVec<u8, MAX_UNWRAPPED_SIZE>,
}

impl WrapperState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops any partially received frame.
    pub fn reset(&mut self) {
        self.in_frame = false;
        self.escaped = false;
        self.buffer.clear();
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Feeds received bytes, calling `on_frame` with header and payload of
    /// every complete frame whose FCS checks out.
    ///
    /// Returns `true` if a framing violation occurred.
    pub fn unwrap<F: FnMut(&[u8])>(&mut self, input: &[u8], mut on_frame: F) -> bool {
        let mut violation = false;
        for &byte in input {
            match byte {
                ASYNC_BOF => {
                    if self.in_frame && (self.escaped || !self.buffer.is_empty()) {
                        trace!("BOF inside frame, dropping {} bytes", self.buffer.len());
                        violation = true;
                    }
                    self.reset();
                    self.in_frame = true;
                }
                ASYNC_EOF => {
                    if !self.in_frame || self.escaped {
                        violation = true;
                    } else if !self.finish_frame(&mut on_frame) {
                        violation = true;
                    }
                    self.reset();
                }
                ASYNC_XBOF if !self.in_frame => {}
                _ if !self.in_frame => {
                    violation = true;
                }
                ASYNC_CE => {
                    if self.escaped {
                        violation = true;
                        self.reset();
                    } else {
                        self.escaped = true;
                    }
                }
                _ => {
                    let value = if self.escaped { byte ^ ASYNC_XOR } else { byte };
                    self.escaped = false;
                    if self.buffer.push(value).is_err() {
                        trace!("Unwrap buffer overflow");
                        violation = true;
                        self.reset();
                    }
                }
            }
        }
        violation
    }

    fn finish_frame<F: FnMut(&[u8])>(&self, on_frame: &mut F) -> bool {
        let len = self.buffer.len();
        if len < MIN_FRAME_SIZE {
            trace!("Frame of {} bytes too short", len);
            return false;
        }
        let (data, fcs) = self.buffer.split_at(len - FCS_SIZE);
        let mut expected = Fcs16::new();
        expected.update(data);
        if expected.finish() != u16::from_le_bytes([fcs[0], fcs[1]]) {
            trace!("FCS mismatch on {} byte frame", len);
            return false;
        }
        on_frame(data);
        true
    }
}
