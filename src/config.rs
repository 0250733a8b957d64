use std::time::Duration;

use anyhow::bail;

use crate::frame::MAX_PAYLOAD;

/// Tuning knobs of one DCCNET link. The defaults are what the reference environment expects
///  (one second of patience everywhere, sixteen attempts); tests shrink them so retransmission
///  and give-up paths run in milliseconds.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// How long the sender waits for the ACK of the outstanding frame before retransmitting.
    pub ack_timeout: Duration,

    /// Upper bound for one receive round. A round that produces no bytes within this window
    ///  counts against the dispatcher's liveness budget.
    pub recv_timeout: Duration,

    /// Upper bound for writing one frame to the stream. A stream that stays unwritable longer
    ///  is treated as a failed send attempt.
    pub send_timeout: Duration,

    /// How often a frame is (re)transmitted before the connection is declared dead and reset.
    ///  The same budget bounds how many consecutive receive rounds may pass without a
    ///  classifiable frame.
    /// TODO separate the dispatcher's liveness budget from the sender's attempt budget
    pub max_attempts: u32,

    /// Payload size of the data frames the file transfer sender produces. Smaller chunks mean
    ///  more round trips, bigger ones are capped by the frame format.
    pub chunk_len: usize,
}

impl Default for LinkConfig {
    fn default() -> LinkConfig {
        LinkConfig {
            ack_timeout: Duration::from_secs(1),
            recv_timeout: Duration::from_secs(1),
            send_timeout: Duration::from_secs(1),
            max_attempts: 16,
            chunk_len: MAX_PAYLOAD,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.chunk_len == 0 || self.chunk_len > MAX_PAYLOAD {
            bail!("chunk_len must be between 1 and {}", MAX_PAYLOAD);
        }
        if self.ack_timeout.is_zero() || self.recv_timeout.is_zero() || self.send_timeout.is_zero() {
            bail!("timeouts must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(LinkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = LinkConfig { max_attempts: 0, ..LinkConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let config = LinkConfig { chunk_len: MAX_PAYLOAD + 1, ..LinkConfig::default() };
        assert!(config.validate().is_err());

        let config = LinkConfig { chunk_len: 0, ..LinkConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = LinkConfig { ack_timeout: Duration::ZERO, ..LinkConfig::default() };
        assert!(config.validate().is_err());
    }
}
