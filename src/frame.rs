//! Wire format of a DCCNET frame - all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: sync marker (u32) - 0xdcc023c2
//!  4: sync marker (u32) - repeated, so a receiver can re-align on a corrupted stream
//!  8: checksum (u16) - Internet checksum of the full frame image with this field zeroed
//! 10: length (u16) - payload bytes following the header, at most 4096
//! 12: id (u16) - alternating 0/1 sequence number; 0xffff is reserved for RESET
//! 14: flags (u8) - exactly one of DATA 0x00 / ACK 0x80 / END 0x40 / RESET 0x20
//! 15: payload
//! ```
//!
//! Text-oriented applications terminate each logical line with a `\n` sentinel that is part of
//!  the payload and counted in `length`. Checksum and length never leave this module: the rest
//!  of the crate works with validated [Frame] values.

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::checksum::internet_checksum;

pub const SYNC_WORD: u32 = 0xdcc023c2;
/// The two sync markers on the wire, for scanning a byte stream.
pub const SYNC_PATTERN: [u8; 8] = [0xdc, 0xc0, 0x23, 0xc2, 0xdc, 0xc0, 0x23, 0xc2];
pub const HEADER_LEN: usize = 15;
pub const MAX_PAYLOAD: usize = 4096;
/// Reserved id carried by RESET frames, outside the regular 0/1 sequence.
pub const RESET_ID: u16 = 0xffff;

const CHECKSUM_OFFSET: usize = 8;

/// The flag byte of a frame. Exactly one flag may be set on the wire; any other byte makes the
///  frame invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0x00,
    Ack = 0x80,
    End = 0x40,
    Reset = 0x20,
}

/// A validated frame. Values of this type exist only on the inside of the codec: `ser` is the
///  single place that produces wire bytes, `deser` the single place that accepts them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(id: u16, payload: &[u8]) -> Frame {
        Frame { id, kind: FrameKind::Data, payload: payload.to_vec() }
    }

    /// A data frame carrying one text line plus the `\n` sentinel that marks it complete. The
    ///  sentinel is payload like any other byte and counts towards `length`.
    pub fn text_line(id: u16, line: &[u8]) -> Frame {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line);
        payload.push(b'\n');
        Frame { id, kind: FrameKind::Data, payload }
    }

    pub fn ack(id: u16) -> Frame {
        Frame { id, kind: FrameKind::Ack, payload: Vec::new() }
    }

    pub fn end(id: u16) -> Frame {
        Frame { id, kind: FrameKind::End, payload: Vec::new() }
    }

    pub fn reset() -> Frame {
        Frame { id: RESET_ID, kind: FrameKind::Reset, payload: Vec::new() }
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        assert!(
            self.payload.len() <= MAX_PAYLOAD,
            "this is a bug: callers must bound payloads to {} bytes",
            MAX_PAYLOAD
        );
        let length = self.payload.len() as u16;

        buf.put_u32(SYNC_WORD);
        buf.put_u32(SYNC_WORD);
        buf.put_u16(0); // checksum, patched below
        buf.put_u16(length);
        buf.put_u16(self.id);
        buf.put_u8(self.kind.into());
        buf.put_slice(&self.payload);

        let checksum = internet_checksum(&buf[start..]);
        buf[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + 2]
            .copy_from_slice(&checksum.to_be_bytes());
    }

    /// Validates and parses one exact frame image, header plus declared payload.
    pub fn deser(image: &[u8]) -> anyhow::Result<Frame> {
        let mut buf: &[u8] = image;
        if buf.try_get_u32()? != SYNC_WORD || buf.try_get_u32()? != SYNC_WORD {
            bail!("missing frame sync markers");
        }
        let stored_checksum = buf.try_get_u16()?;
        let length = usize::from(buf.try_get_u16()?);
        let id = buf.try_get_u16()?;
        let kind_byte = buf.try_get_u8()?;

        if length > MAX_PAYLOAD {
            bail!("declared payload of {} bytes exceeds the {} byte limit", length, MAX_PAYLOAD);
        }
        if buf.len() != length {
            bail!("frame image carries {} payload bytes but declares {}", buf.len(), length);
        }

        let mut scratch = image.to_vec();
        scratch[CHECKSUM_OFFSET] = 0;
        scratch[CHECKSUM_OFFSET + 1] = 0;
        let computed = internet_checksum(&scratch);
        if computed != stored_checksum {
            bail!("checksum mismatch: stored {:#06x}, computed {:#06x}", stored_checksum, computed);
        }

        let kind = match FrameKind::try_from(kind_byte) {
            Ok(kind) => kind,
            Err(_) => bail!("invalid flag byte {:#04x}", kind_byte),
        };

        Ok(Frame { id, kind, payload: buf.to_vec() })
    }
}

/// Parses just enough of a header to tell how long the frame starting at `header` is on the
///  wire, so a receiver knows how many bytes to accumulate before validating.
pub fn frame_wire_len(header: &[u8]) -> anyhow::Result<usize> {
    let mut buf: &[u8] = header;
    if buf.try_get_u32()? != SYNC_WORD || buf.try_get_u32()? != SYNC_WORD {
        bail!("missing frame sync markers");
    }
    let _checksum = buf.try_get_u16()?;
    let length = usize::from(buf.try_get_u16()?);
    if length > MAX_PAYLOAD {
        bail!("declared payload of {} bytes exceeds the {} byte limit", length, MAX_PAYLOAD);
    }
    Ok(HEADER_LEN + length)
}
