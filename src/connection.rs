//! A [Connection] is the place where the parts of the protocol come together: it owns the
//!  shared link state and the frame sink, spawns the receive dispatcher, and has the API for
//!  application code to send units with stop-and-wait retransmission.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context};
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::dispatch::ReceiveDispatcher;
use crate::frame::{Frame, MAX_PAYLOAD};
use crate::link_state::{AckWait, LinkState};
use crate::transport::{FrameReceiver, FrameSink, LinkReader, LinkWriter};

pub struct Connection {
    state: Arc<LinkState>,
    sink: Arc<FrameSink>,
    config: Arc<LinkConfig>,
    receiver: Option<FrameReceiver>,
}

impl Connection {
    /// Wraps a connected TCP stream. The protocol's bounded waits come from the stream's OS
    ///  timeouts, which are set here once for both halves.
    pub fn new(stream: TcpStream, config: LinkConfig) -> anyhow::Result<Connection> {
        stream
            .set_read_timeout(Some(config.recv_timeout))
            .context("setting the read timeout")?;
        stream
            .set_write_timeout(Some(config.send_timeout))
            .context("setting the write timeout")?;
        let write_half = stream.try_clone().context("cloning the stream for the write half")?;
        info!("link up with {:?}", stream.peer_addr().ok());
        Connection::over(Box::new(stream), Box::new(write_half), config)
    }

    /// Builds a connection over arbitrary stream halves - in-memory pipes in tests. [Self::new]
    ///  is the entry point for real sockets.
    pub fn over(
        reader: Box<dyn LinkReader>,
        writer: Box<dyn LinkWriter>,
        config: LinkConfig,
    ) -> anyhow::Result<Connection> {
        config.validate()?;
        Ok(Connection {
            state: Arc::new(LinkState::new()),
            sink: Arc::new(FrameSink::new(writer)),
            receiver: Some(FrameReceiver::new(reader, config.recv_timeout)),
            config: Arc::new(config),
        })
    }

    pub fn state(&self) -> Arc<LinkState> {
        self.state.clone()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Spawns the receive dispatcher on its own thread. Exactly one dispatcher per
    ///  connection; calling this twice is an error.
    pub fn start_receiver(&mut self) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        let receiver = match self.receiver.take() {
            Some(receiver) => receiver,
            None => bail!("the receive dispatcher was already started"),
        };
        let dispatcher =
            ReceiveDispatcher::new(receiver, self.state.clone(), self.sink.clone(), &self.config);
        thread::Builder::new()
            .name("dccnet-recv".to_string())
            .spawn(move || dispatcher.run())
            .context("spawning the receive dispatcher thread")
    }

    /// Sends one unit of data and blocks until the peer acknowledged it, retransmitting with
    ///  the same id as often as the attempt budget allows. `is_final` sends the END frame that
    ///  completes this side's stream; a final unit carries no payload.
    ///
    /// When the budget is spent the connection is dead: a best-effort RESET goes out and the
    ///  link state is closed.
    pub fn send_unit(&self, payload: &[u8], is_final: bool) -> anyhow::Result<()> {
        if is_final && !payload.is_empty() {
            bail!("a final unit cannot carry payload");
        }
        let id = self.state.next_send_id();
        let frame = if is_final { Frame::end(id) } else { Frame::data(id, payload) };
        self.transmit(frame, is_final)
    }

    /// Sends one text line as a unit, with the `\n` sentinel appended on the wire.
    pub fn send_text_unit(&self, line: &[u8]) -> anyhow::Result<()> {
        let frame = Frame::text_line(self.state.next_send_id(), line);
        self.transmit(frame, false)
    }

    fn transmit(&self, frame: Frame, is_final: bool) -> anyhow::Result<()> {
        if frame.payload.len() > MAX_PAYLOAD {
            bail!(
                "unit of {} bytes exceeds the {} byte frame payload limit",
                frame.payload.len(),
                MAX_PAYLOAD
            );
        }

        let id = frame.id;
        self.state.arm_ack_wait(id);
        for attempt in 1..=self.config.max_attempts {
            trace!("attempt {}/{} for {:?} frame id {}", attempt, self.config.max_attempts, frame.kind, id);
            if let Err(e) = self.sink.send_frame(&frame) {
                warn!("attempt {}: sending frame id {} failed: {:#}", attempt, id, e);
                continue;
            }
            match self.state.await_ack(self.config.ack_timeout) {
                AckWait::Acked => {
                    self.state.advance_send_id(is_final);
                    debug!("frame id {} acknowledged after {} attempt(s)", id, attempt);
                    return Ok(());
                }
                AckWait::TimedOut => {
                    trace!("no ack for id {} within {:?} - retransmitting", id, self.config.ack_timeout);
                }
                AckWait::Closed => bail!("link closed while waiting for the ack of id {}", id),
            }
        }

        warn!(
            "giving up on frame id {} after {} attempts - resetting the connection",
            id, self.config.max_attempts
        );
        if let Err(e) = self.sink.send_frame(&Frame::reset()) {
            debug!("could not send RESET on a dying link: {:#}", e);
        }
        self.state.close();
        bail!("no ack for frame id {} after {} attempts", id, self.config.max_attempts)
    }
}
