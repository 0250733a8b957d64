//! Full duplex file transfer: both sides stream a file to each other over the same link at the
//!  same time. Sending runs on the calling thread, receiving is split across the dispatcher
//!  and a consumer thread, and the session ends when both directions completed their stream.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::consumer;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XferReport {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Streams `input` to the peer in chunks of at most `chunk_len` bytes and completes the local
///  stream with END. Returns the number of payload bytes sent.
pub fn send_stream(
    conn: &Connection,
    input: &mut dyn Read,
    chunk_len: usize,
) -> anyhow::Result<u64> {
    let mut chunk = vec![0u8; chunk_len];
    let mut total = 0u64;
    loop {
        let n = read_chunk(input, &mut chunk)?;
        if n == 0 {
            break;
        }
        conn.send_unit(&chunk[..n], false)?;
        total += n as u64;
        debug!("sent {} bytes, {} in total", n, total);
    }
    conn.send_unit(&[], true)?;
    info!("local stream complete after {} bytes", total);
    Ok(total)
}

/// Fills `buf` from `input` as far as the stream allows. Short reads are retried so a chunk is
///  only smaller than `buf` at the end of the stream.
fn read_chunk(input: &mut dyn Read, buf: &mut [u8]) -> anyhow::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("reading the input stream"),
        }
    }
    Ok(filled)
}

/// Runs a complete transfer session on an established connection: `input` goes to the peer,
///  the peer's stream goes to `output`. Blocks until both directions are done and returns the
///  byte counts.
pub fn run_session<W: Write + Send + 'static>(
    mut conn: Connection,
    input: &mut dyn Read,
    mut output: W,
) -> anyhow::Result<XferReport> {
    let chunk_len = conn.config().chunk_len;
    let poll = conn.config().recv_timeout;
    let dispatcher = conn.start_receiver()?;

    let consumer = {
        let state = conn.state();
        thread::Builder::new()
            .name("dccnet-consume".to_string())
            .spawn(move || {
                let result = consumer::run(&state, &mut output, poll);
                if result.is_err() {
                    // a dead output sink ends the whole session, not just this thread
                    state.close();
                }
                result
            })
            .context("spawning the consumer thread")?
    };

    let sent = send_stream(&conn, input, chunk_len);
    if sent.is_err() {
        // wake the other threads so the session tears down promptly
        conn.state().close();
    }

    let received = join_thread(consumer, "consumer");
    let dispatch_result = join_thread(dispatcher, "receive dispatcher");

    let bytes_sent = sent?;
    let bytes_received = received?;
    dispatch_result?;

    info!("transfer complete: {} bytes sent, {} bytes received", bytes_sent, bytes_received);
    Ok(XferReport { bytes_sent, bytes_received })
}

fn join_thread<T>(handle: JoinHandle<anyhow::Result<T>>, name: &str) -> anyhow::Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("the {} thread panicked", name)),
    }
}
