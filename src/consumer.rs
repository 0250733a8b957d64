//! Consumer side of a link: drains payloads from the shared link state into an [std::io::Write]
//!  sink until the peer's stream is complete. This runs on its own thread in full duplex
//!  sessions so that receiving never waits for sending.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::debug;

use crate::link_state::{Inbound, LinkState};

/// Writes every delivered payload to `out` in arrival order and returns the total number of
///  bytes written once the peer's END arrived.
pub fn run(state: &LinkState, out: &mut dyn Write, poll_interval: Duration) -> anyhow::Result<u64> {
    let mut total = 0u64;
    loop {
        match state.await_inbound(poll_interval) {
            Inbound::Data(payload) => {
                out.write_all(&payload).context("writing received data")?;
                out.flush().context("flushing received data")?;
                total += payload.len() as u64;
                debug!("consumed {} bytes, {} in total", payload.len(), total);
            }
            Inbound::End => {
                debug!("peer stream complete after {} bytes", total);
                return Ok(total);
            }
            Inbound::Idle => {}
            Inbound::Closed => bail!("link closed before the peer finished its stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_consumes_until_end() {
        let state = Arc::new(LinkState::new());

        let feeder = {
            let state = state.clone();
            thread::spawn(move || {
                assert!(state.accept_data(0, b"alpha "));
                assert!(state.accept_data(1, b"omega"));
                assert!(state.accept_end(0));
            })
        };

        let mut sink = Vec::new();
        let total = run(&state, &mut sink, POLL).unwrap();

        feeder.join().unwrap();
        assert_eq!(total, 11);
        assert_eq!(sink, b"alpha omega");
    }

    #[test]
    fn test_close_before_end_is_an_error() {
        let state = Arc::new(LinkState::new());
        assert!(state.accept_data(0, b"partial"));
        state.close();

        let mut sink = Vec::new();
        let result = run(&state, &mut sink, POLL);

        // the payload that was already accepted still reaches the sink
        assert_eq!(sink, b"partial");
        assert!(result.is_err());
    }
}
