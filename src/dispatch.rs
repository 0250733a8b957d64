//! The receive dispatcher is the single reader of a link: every inbound frame passes through
//!  its loop, gets classified, and is answered with an ACK where the protocol calls for one.
//!  It keeps running while data flows in either direction and stops when both sides have sent
//!  their END, when the peer resets the connection, or when the liveness budget of rounds
//!  without a classifiable frame runs out.

use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::frame::{Frame, FrameKind};
use crate::link_state::LinkState;
use crate::transport::{FrameReceiver, FrameSink, RecvOutcome};

pub struct ReceiveDispatcher {
    receiver: FrameReceiver,
    state: Arc<LinkState>,
    sink: Arc<FrameSink>,
    max_quiet_rounds: u32,
}

impl ReceiveDispatcher {
    pub fn new(
        receiver: FrameReceiver,
        state: Arc<LinkState>,
        sink: Arc<FrameSink>,
        config: &LinkConfig,
    ) -> ReceiveDispatcher {
        ReceiveDispatcher {
            receiver,
            state,
            sink,
            max_quiet_rounds: config.max_attempts,
        }
    }

    /// Runs the receive loop to completion, then closes the link state so every thread still
    ///  waiting on it wakes up - regardless of how the loop ended.
    pub fn run(mut self) -> anyhow::Result<()> {
        info!("starting receive dispatcher");
        let result = self.recv_loop();
        self.state.close();
        result
    }

    fn recv_loop(&mut self) -> anyhow::Result<()> {
        let mut quiet_rounds = 0u32;
        loop {
            if self.state.both_ends_done() {
                info!("both sides sent END - receive dispatcher done");
                return Ok(());
            }
            if self.state.is_closed() {
                bail!("link was closed locally - receive dispatcher aborting");
            }
            if quiet_rounds >= self.max_quiet_rounds {
                bail!("no classifiable frame in {} consecutive rounds - the peer looks dead", quiet_rounds);
            }

            match self.receiver.receive_frame() {
                RecvOutcome::Frame(frame) => {
                    quiet_rounds = 0;
                    self.classify(frame)?;
                }
                RecvOutcome::Timeout => {
                    quiet_rounds += 1;
                    trace!("receive round {} without a frame", quiet_rounds);
                }
                RecvOutcome::Invalid => {
                    quiet_rounds += 1;
                    debug!("received bytes without a usable frame - ignoring");
                }
                RecvOutcome::Closed => {
                    if self.state.both_ends_done() {
                        return Ok(());
                    }
                    bail!("peer closed the stream before both ENDs were acknowledged");
                }
            }
        }
    }

    fn classify(&mut self, frame: Frame) -> anyhow::Result<()> {
        match frame.kind {
            FrameKind::Reset => {
                if frame.payload.is_empty() {
                    error!("received RESET - the peer declared the connection dead");
                } else {
                    error!(
                        "received RESET - the peer declared the connection dead: {}",
                        String::from_utf8_lossy(&frame.payload)
                    );
                }
                bail!("connection reset by peer");
            }
            FrameKind::Ack => {
                if self.state.on_ack(frame.id) {
                    trace!("ack cleared outstanding frame id {}", frame.id);
                } else {
                    debug!("ack for id {} matches no outstanding frame - discarding", frame.id);
                }
            }
            FrameKind::Data => {
                if self.state.accept_data(frame.id, &frame.payload) {
                    trace!("accepted data frame id {} with {} bytes", frame.id, frame.payload.len());
                } else {
                    debug!("duplicate data frame id {} - re-acknowledging without redelivery", frame.id);
                }
                self.send_ack(frame.id);
            }
            FrameKind::End => {
                if self.state.accept_end(frame.id) {
                    debug!("peer completed its stream (END id {})", frame.id);
                } else {
                    debug!("duplicate END id {} - re-acknowledging", frame.id);
                }
                self.send_ack(frame.id);
            }
        }
        Ok(())
    }

    fn send_ack(&self, id: u16) {
        if let Err(e) = self.sink.send_frame(&Frame::ack(id)) {
            warn!("failed to send ack for id {}: {:#}", id, e);
        }
    }
}
