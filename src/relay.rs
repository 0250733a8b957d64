//! The hash relay application: authenticate with a token, then answer every text line the
//!  peer sends with the line's MD5 hash until the peer completes its stream. Lines can be
//!  split across frames and several can share one frame, so the driver reassembles them from
//!  a byte buffer.

use std::io::Write;

use anyhow::{anyhow, bail, Context};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::digest::md5_hex;
use crate::frame::MAX_PAYLOAD;
use crate::link_state::Inbound;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelayReport {
    pub lines: u64,
}

/// Runs a relay session on an established connection. Received lines go to `output` as they
///  arrive, each answered with its hash, and the session ends with the peer's END.
pub fn run_session(
    mut conn: Connection,
    gas: &str,
    output: &mut dyn Write,
) -> anyhow::Result<RelayReport> {
    if gas.len() + 1 > MAX_PAYLOAD {
        bail!("authentication token of {} bytes does not fit a frame", gas.len());
    }

    // this side never sends an END of its own: the peer decides when the conversation is over
    conn.state().mark_local_end();
    let dispatcher = conn.start_receiver()?;

    let driven = relay_lines(&conn, gas, output);
    if driven.is_err() {
        conn.state().close();
    }
    let dispatch_result = match dispatcher.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("the receive dispatcher thread panicked")),
    };

    let report = driven?;
    dispatch_result?;
    Ok(report)
}

fn relay_lines(
    conn: &Connection,
    gas: &str,
    output: &mut dyn Write,
) -> anyhow::Result<RelayReport> {
    conn.send_text_unit(gas.as_bytes())?;
    info!("authenticated, relaying hashes");

    let poll = conn.config().recv_timeout;
    let mut pending: Vec<u8> = Vec::new();
    let mut lines = 0u64;
    loop {
        match conn.state().await_inbound(poll) {
            Inbound::Data(payload) => {
                pending.extend_from_slice(&payload);
                while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = pending.drain(..=pos).collect();
                    line.pop();
                    if line.is_empty() {
                        continue;
                    }
                    output.write_all(&line).context("writing a received line")?;
                    output.write_all(b"\n").context("writing a received line")?;
                    output.flush().context("flushing a received line")?;
                    conn.send_text_unit(md5_hex(&line).as_bytes())?;
                    lines += 1;
                    debug!("answered line {} ({} bytes)", lines, line.len());
                }
            }
            Inbound::End => {
                if !pending.is_empty() {
                    warn!("discarding {} bytes of an unterminated trailing line", pending.len());
                }
                info!("peer completed its stream after {} lines", lines);
                return Ok(RelayReport { lines });
            }
            Inbound::Idle => {}
            Inbound::Closed => bail!("link closed before the peer finished its stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::frame::{Frame, FrameKind};
    use crate::sim::{duplex, PipeEnd};
    use crate::transport::{FrameReceiver, FrameSink, RecvOutcome};
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn test_config() -> LinkConfig {
        LinkConfig {
            ack_timeout: Duration::from_millis(250),
            recv_timeout: TIMEOUT,
            send_timeout: Duration::from_millis(200),
            ..LinkConfig::default()
        }
    }

    /// drives the peer side of a session frame by frame, so the test controls ids,
    ///  duplicates and frame boundaries exactly
    struct ScriptedPeer {
        receiver: FrameReceiver,
        sink: FrameSink,
    }

    impl ScriptedPeer {
        fn new(end: PipeEnd) -> ScriptedPeer {
            ScriptedPeer {
                receiver: FrameReceiver::new(Box::new(end.reader), TIMEOUT),
                sink: FrameSink::new(Box::new(end.writer)),
            }
        }

        fn next_frame(&mut self) -> Frame {
            for _ in 0..100 {
                match self.receiver.receive_frame() {
                    RecvOutcome::Frame(frame) => return frame,
                    RecvOutcome::Closed => panic!("stream closed while the script expected a frame"),
                    _ => {}
                }
            }
            panic!("no frame within the scripted deadline");
        }

        fn send(&self, frame: &Frame) {
            self.sink.send_frame(frame).unwrap();
        }

        /// Consumes frames until `want_acks` acks for `ack_id` and `want_data` data frames
        ///  arrived, acking every data frame on the way. Returns the data payloads.
        fn collect(&mut self, ack_id: u16, want_acks: usize, want_data: usize) -> Vec<Vec<u8>> {
            let mut acks = 0;
            let mut payloads = Vec::new();
            while acks < want_acks || payloads.len() < want_data {
                let frame = self.next_frame();
                match frame.kind {
                    FrameKind::Ack => {
                        assert_eq!(frame.id, ack_id);
                        acks += 1;
                    }
                    FrameKind::Data => {
                        self.send(&Frame::ack(frame.id));
                        payloads.push(frame.payload);
                    }
                    other => panic!("unexpected {:?} frame in the script", other),
                }
            }
            payloads
        }
    }

    fn hash_line(line: &[u8]) -> Vec<u8> {
        let mut expected = md5_hex(line).into_bytes();
        expected.push(b'\n');
        expected
    }

    #[test]
    fn test_session_hashes_each_line() {
        let (local, remote) = duplex(TIMEOUT);
        let conn =
            Connection::over(Box::new(local.reader), Box::new(local.writer), test_config())
                .unwrap();

        let peer = thread::spawn(move || {
            let mut peer = ScriptedPeer::new(remote);

            let auth = peer.next_frame();
            assert_eq!(auth.kind, FrameKind::Data);
            assert_eq!(auth.payload, b"secret token\n");
            peer.send(&Frame::ack(auth.id));

            // one line split across two frames, the second transmitted twice; the duplicate
            //  must be acked again but hashed only once
            peer.send(&Frame::data(0, b"hel"));
            peer.collect(0, 1, 0);
            peer.send(&Frame::data(1, b"lo\n"));
            peer.send(&Frame::data(1, b"lo\n"));
            let first = peer.collect(1, 2, 1);

            peer.send(&Frame::data(0, b"world\n"));
            let second = peer.collect(0, 1, 1);

            peer.send(&Frame::end(1));
            peer.collect(1, 1, 0);
            (first, second)
        });

        let mut output = Vec::new();
        let report = run_session(conn, "secret token", &mut output).unwrap();
        let (first, second) = peer.join().unwrap();

        assert_eq!(report, RelayReport { lines: 2 });
        assert_eq!(output, b"hello\nworld\n");
        assert_eq!(first, vec![hash_line(b"hello")]);
        assert_eq!(second, vec![hash_line(b"world")]);
    }

    #[test]
    fn test_blank_lines_are_not_hashed() {
        let (local, remote) = duplex(TIMEOUT);
        let conn =
            Connection::over(Box::new(local.reader), Box::new(local.writer), test_config())
                .unwrap();

        let peer = thread::spawn(move || {
            let mut peer = ScriptedPeer::new(remote);

            let auth = peer.next_frame();
            peer.send(&Frame::ack(auth.id));

            peer.send(&Frame::data(0, b"x\n\ny\n"));
            let hashes = peer.collect(0, 1, 2);

            peer.send(&Frame::end(1));
            peer.collect(1, 1, 0);
            hashes
        });

        let mut output = Vec::new();
        let report = run_session(conn, "gas", &mut output).unwrap();
        let hashes = peer.join().unwrap();

        assert_eq!(report, RelayReport { lines: 2 });
        assert_eq!(output, b"x\ny\n");
        assert_eq!(hashes, vec![hash_line(b"x"), hash_line(b"y")]);
    }

    #[test]
    fn test_unterminated_tail_is_discarded() {
        let (local, remote) = duplex(TIMEOUT);
        let conn =
            Connection::over(Box::new(local.reader), Box::new(local.writer), test_config())
                .unwrap();

        let peer = thread::spawn(move || {
            let mut peer = ScriptedPeer::new(remote);

            let auth = peer.next_frame();
            peer.send(&Frame::ack(auth.id));

            peer.send(&Frame::data(0, b"complete\n"));
            let hashes = peer.collect(0, 1, 1);

            // no newline before the END
            peer.send(&Frame::data(1, b"dangling"));
            peer.collect(1, 1, 0);
            peer.send(&Frame::end(0));
            peer.collect(0, 1, 0);
            hashes
        });

        let mut output = Vec::new();
        let report = run_session(conn, "gas", &mut output).unwrap();
        let hashes = peer.join().unwrap();

        assert_eq!(report, RelayReport { lines: 1 });
        assert_eq!(output, b"complete\n");
        assert_eq!(hashes, vec![hash_line(b"complete")]);
    }

    #[test]
    fn test_oversized_token_is_rejected_up_front() {
        let (local, _remote) = duplex(TIMEOUT);
        let conn =
            Connection::over(Box::new(local.reader), Box::new(local.writer), test_config())
                .unwrap();

        let gas = "x".repeat(MAX_PAYLOAD);
        let mut output = Vec::new();
        let err = run_session(conn, &gas, &mut output).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn test_session_fails_when_nobody_acks_the_token() {
        let (local, remote) = duplex(Duration::from_millis(80));
        // the sender must run out of patience before the dispatcher's quiet budget does
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(20),
            recv_timeout: Duration::from_millis(80),
            send_timeout: Duration::from_millis(200),
            max_attempts: 3,
            ..LinkConfig::default()
        };
        let conn =
            Connection::over(Box::new(local.reader), Box::new(local.writer), config).unwrap();

        let mut output = Vec::new();
        let err = run_session(conn, "gas", &mut output).unwrap_err();
        assert!(err.to_string().contains("3 attempts"));
        assert!(output.is_empty());
        drop(remote);
    }
}
