//! Byte stream I/O under the framing layer. The stream itself (TCP in production, an
//!  in-memory pipe in tests) guarantees ordered bytes but knows nothing about frames: TCP is
//!  free to deliver a frame in arbitrary fragments, so [FrameReceiver] accumulates bytes until
//!  a full image is available, and [FrameSink] loops until a full image is written.

use std::io;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::{Buf, BytesMut};
#[cfg(test)] use mockall::automock;
use tracing::{trace, warn};

use crate::frame::{self, Frame, HEADER_LEN, MAX_PAYLOAD, SYNC_PATTERN};

/// Read side of the stream, introduced to facilitate mocking the I/O part away for testing.
///
/// A read is expected to block no longer than the configured receive timeout, reporting
///  `WouldBlock`/`TimedOut` when nothing arrived and `Ok(0)` when the peer closed the stream.
#[cfg_attr(test, automock)]
pub trait LinkReader: Send + 'static {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of the stream, same mocking seam as [LinkReader].
#[cfg_attr(test, automock)]
pub trait LinkWriter: Send + 'static {
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl LinkReader for TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }
}

impl LinkWriter for TcpStream {
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Serializes whole frames onto the stream. The write half sits behind a mutex because two
///  threads emit frames (the sending thread, and the dispatcher for its ACKs); holding the
///  lock across the whole image keeps frames from interleaving on the wire.
pub struct FrameSink {
    writer: Mutex<Box<dyn LinkWriter>>,
}

impl FrameSink {
    pub fn new(writer: Box<dyn LinkWriter>) -> FrameSink {
        FrameSink { writer: Mutex::new(writer) }
    }

    /// Writes one frame, looping over partial writes. A stream that closes or stays
    ///  unwritable past the send timeout is reported as an error; whether to retry is the
    ///  retransmission layer's business, not this one's.
    pub fn send_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(frame.wire_len());
        frame.ser(&mut buf);
        trace!("sending {:?} frame id {} with {} payload bytes", frame.kind, frame.id, frame.payload.len());

        let mut writer = self.writer.lock().expect("frame sink mutex poisoned");
        let mut remaining: &[u8] = &buf;
        while !remaining.is_empty() {
            match writer.write_some(remaining) {
                Ok(0) => bail!("stream closed while writing a frame"),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_would_block(&e) => bail!("stream not writable within the send timeout"),
                Err(e) => return Err(e).context("writing frame"),
            }
        }
        Ok(())
    }
}

/// One receive round: either a validated frame, or the reason there is none.
#[derive(Debug)]
pub enum RecvOutcome {
    Frame(Frame),
    /// nothing arrived within the receive timeout
    Timeout,
    /// bytes arrived but validation rejected them (bad sync, bad checksum, bad flag byte)
    Invalid,
    /// the peer closed the stream
    Closed,
}

/// Reassembles frames from the byte stream, one per call. If the buffer start is not a sync
///  marker the receiver hunts byte by byte until it is, which is how a stream recovers after
///  a corrupted length field.
pub struct FrameReceiver {
    reader: Box<dyn LinkReader>,
    buf: BytesMut,
    recv_timeout: Duration,
}

enum Extracted {
    Frame(Frame),
    Invalid,
    NeedMore,
}

impl FrameReceiver {
    pub fn new(reader: Box<dyn LinkReader>, recv_timeout: Duration) -> FrameReceiver {
        FrameReceiver {
            reader,
            buf: BytesMut::with_capacity(2 * (HEADER_LEN + MAX_PAYLOAD)),
            recv_timeout,
        }
    }

    /// Tries to produce exactly one frame. One call spans at most roughly the receive
    ///  timeout; bytes of an incomplete frame stay buffered for the next round.
    pub fn receive_frame(&mut self) -> RecvOutcome {
        let deadline = Instant::now() + self.recv_timeout;
        loop {
            match self.extract_frame() {
                Extracted::Frame(frame) => return RecvOutcome::Frame(frame),
                Extracted::Invalid => return RecvOutcome::Invalid,
                Extracted::NeedMore => {}
            }
            if Instant::now() >= deadline {
                return RecvOutcome::Timeout;
            }

            let mut scratch = [0u8; 2048];
            match self.reader.read_some(&mut scratch) {
                Ok(0) => return RecvOutcome::Closed,
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_would_block(&e) => return RecvOutcome::Timeout,
                Err(e) => {
                    warn!("stream read failed: {} - treating the stream as closed", e);
                    return RecvOutcome::Closed;
                }
            }
        }
    }

    fn extract_frame(&mut self) -> Extracted {
        let skipped = self.hunt_sync();
        if skipped > 0 {
            warn!("skipped {} bytes hunting for frame sync", skipped);
        }
        if self.buf.len() < HEADER_LEN {
            return Extracted::NeedMore;
        }

        let wire_len = match frame::frame_wire_len(&self.buf[..HEADER_LEN]) {
            Ok(len) => len,
            Err(e) => {
                // the sync markers were fine, so the length field is unusable and cannot be
                //  trusted for skipping
                trace!("unusable frame header ({:#}) - resyncing", e);
                self.buf.advance(1);
                return Extracted::Invalid;
            }
        };
        if self.buf.len() < wire_len {
            return Extracted::NeedMore;
        }

        match Frame::deser(&self.buf[..wire_len]) {
            Ok(frame) => {
                self.buf.advance(wire_len);
                Extracted::Frame(frame)
            }
            Err(e) => {
                trace!("received invalid frame ({:#}) - resyncing", e);
                self.buf.advance(1);
                Extracted::Invalid
            }
        }
    }

    /// Discards bytes until the buffer starts with the double sync marker (or runs short).
    ///  Returns how many bytes were dropped.
    fn hunt_sync(&mut self) -> usize {
        let mut skipped = 0;
        while self.buf.len() >= SYNC_PATTERN.len() && self.buf[..SYNC_PATTERN.len()] != SYNC_PATTERN {
            self.buf.advance(1);
            skipped += 1;
        }
        skipped
    }
}
