//! In-memory stand-ins for the byte stream under a link: a duplex pipe built on channels,
//!  plus a writer wrapper that injects faults the way the pedagogical loss environments do.
//!
//! Faults are applied at frame granularity. The wrapper reassembles complete frame images
//!  from the bytes passing through it and then drops, duplicates, or corrupts whole frames;
//!  anything finer would only mangle the framing, which the receiver already treats as noise.
//!  A fault budget caps the total number of injected faults so a session always converges
//!  once the budget is spent, no matter what the seed does.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::frame::{self, FrameKind, HEADER_LEN};
use crate::transport::{LinkReader, LinkWriter};

/// Read end of one pipe direction. Bytes arrive in the chunks the writer produced, but are
///  handed out as a plain byte stream.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: BytesMut,
    timeout: Duration,
}

/// Write end of one pipe direction.
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

/// One endpoint of an in-memory duplex byte stream.
pub struct PipeEnd {
    pub reader: PipeReader,
    pub writer: PipeWriter,
}

/// Builds both endpoints of a duplex in-memory stream. `timeout` plays the role of the OS
///  read timeout on a real socket.
pub fn duplex(timeout: Duration) -> (PipeEnd, PipeEnd) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        PipeEnd {
            reader: PipeReader { rx: a_rx, pending: BytesMut::new(), timeout },
            writer: PipeWriter { tx: a_tx },
        },
        PipeEnd {
            reader: PipeReader { rx: b_rx, pending: BytesMut::new(), timeout },
            writer: PipeWriter { tx: b_tx },
        },
    )
}

impl LinkReader for PipeReader {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => self.pending.extend_from_slice(&bytes),
                Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::WouldBlock.into()),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        while let Ok(more) = self.rx.try_recv() {
            self.pending.extend_from_slice(&more);
        }

        let n = buf.len().min(self.pending.len());
        self.pending.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

impl LinkWriter for PipeWriter {
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }
}

/// Per-frame fault probabilities plus the overall budget.
#[derive(Clone, Copy, Debug)]
pub struct FaultPlan {
    pub seed: u64,
    pub drop_rate: f64,
    pub dup_rate: f64,
    pub corrupt_rate: f64,
    /// total number of faults injected before the wrapper turns into a clean passthrough
    pub max_faults: u32,
    /// never fault pure ACK frames. The retransmission scheme cannot recover the very last
    ///  ack of a session, so whole-session scenarios need acks to be reliable.
    pub spare_acks: bool,
}

impl FaultPlan {
    pub fn clean() -> FaultPlan {
        FaultPlan {
            seed: 0,
            drop_rate: 0.0,
            dup_rate: 0.0,
            corrupt_rate: 0.0,
            max_faults: 0,
            spare_acks: false,
        }
    }
}

/// Applies a [FaultPlan] to the frames flowing through a writer.
pub struct FaultyWriter {
    inner: Box<dyn LinkWriter>,
    staging: BytesMut,
    rng: StdRng,
    plan: FaultPlan,
    faults_left: u32,
}

impl FaultyWriter {
    pub fn new(inner: Box<dyn LinkWriter>, plan: FaultPlan) -> FaultyWriter {
        FaultyWriter {
            inner,
            staging: BytesMut::new(),
            rng: StdRng::seed_from_u64(plan.seed),
            faults_left: plan.max_faults,
            plan,
        }
    }

    fn forward(&mut self, image: &[u8]) -> io::Result<()> {
        let mut remaining = image;
        while !remaining.is_empty() {
            let n = self.inner.write_some(remaining)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            remaining = &remaining[n..];
        }
        Ok(())
    }

    fn apply_faults(&mut self, image: BytesMut) -> io::Result<()> {
        if self.plan.spare_acks && image[HEADER_LEN - 1] == u8::from(FrameKind::Ack) {
            return self.forward(&image);
        }
        if self.faults_left > 0 && self.rng.random_bool(self.plan.corrupt_rate) {
            self.faults_left -= 1;
            let mut corrupted = image.to_vec();
            let pos = self.rng.random_range(0..corrupted.len());
            corrupted[pos] ^= 0x01;
            debug!("sim: corrupting byte {} of a {} byte frame", pos, corrupted.len());
            return self.forward(&corrupted);
        }
        if self.faults_left > 0 && self.rng.random_bool(self.plan.drop_rate) {
            self.faults_left -= 1;
            debug!("sim: dropping a {} byte frame", image.len());
            return Ok(());
        }
        self.forward(&image)?;
        if self.faults_left > 0 && self.rng.random_bool(self.plan.dup_rate) {
            self.faults_left -= 1;
            debug!("sim: duplicating a {} byte frame", image.len());
            self.forward(&image)?;
        }
        Ok(())
    }
}

impl LinkWriter for FaultyWriter {
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staging.extend_from_slice(buf);
        while self.staging.len() >= HEADER_LEN {
            let wire_len = match frame::frame_wire_len(&self.staging[..HEADER_LEN]) {
                Ok(len) => len,
                Err(_) => {
                    // not at a frame boundary; pass everything through untouched rather than
                    //  guess where the next frame starts
                    let passthrough = self.staging.split_to(self.staging.len());
                    self.forward(&passthrough)?;
                    break;
                }
            };
            if self.staging.len() < wire_len {
                break;
            }
            let image = self.staging.split_to(wire_len);
            self.apply_faults(image)?;
        }
        Ok(buf.len())
    }
}
