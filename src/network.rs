//! Outbound network contract
//!
//! The buffer engine never touches a socket. It hands fully formed packets
//! to a [`Network`] implementation together with the advertised window to
//! stamp on them, and gets back the send timestamp it records for RTT
//! sampling. The congestion controller lives behind the same trait: the
//! engine consumes `max_window_send` and forwards the peer's advertised
//! window through `handle_window_size`.

use crate::error::Result;
use crate::packet::Packet;

/// Contract between the buffer engine and the datagram layer.
pub trait Network {
    /// Transmit one packet, stamping `window` as its advertised window.
    ///
    /// Returns the monotonic microsecond timestamp of the transmission. A
    /// retryable error means the datagram was dropped; the engine keeps the
    /// packet queued and the retransmission timer covers it.
    fn send_pkt(&mut self, window: u32, packet: &Packet) -> Result<u32>;

    /// Current send window ceiling in bytes, as computed by the congestion
    /// controller from the peer window and its own delay estimate.
    fn max_window_send(&self) -> u32;

    /// Fold the peer's advertised window `win_sz` into the controller's
    /// view `pkt_window`, returning the updated view.
    fn handle_window_size(&mut self, pkt_window: u32, win_sz: u32) -> u32;
}

/// Byte credit granted to the writer per scheduler tick.
///
/// Tracks send credit outside the per-packet window accounting: the window
/// bounds how much may be in flight, the quota bounds how much may be
/// queued onto the wire within one tick.
#[derive(Debug, Clone, Copy)]
pub struct SendQuota {
    quota: u32,
    last_quota: u32,
}

impl SendQuota {
    /// Create a quota with an initial grant.
    pub fn new(initial: u32) -> Self {
        Self {
            quota: initial,
            last_quota: initial,
        }
    }

    /// Bytes still available this tick.
    pub fn available(&self) -> u32 {
        self.quota
    }

    /// The grant issued at the last refill.
    pub fn last_grant(&self) -> u32 {
        self.last_quota
    }

    /// Consume up to `bytes` of credit, returning how much was granted.
    pub fn consume(&mut self, bytes: u32) -> u32 {
        let granted = bytes.min(self.quota);
        self.quota -= granted;
        granted
    }

    /// Reset the credit to `grant` for the next tick.
    pub fn refill(&mut self, grant: u32) {
        self.quota = grant;
        self.last_quota = grant;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_consume_and_refill() {
        let mut quota = SendQuota::new(1000);
        assert_eq!(quota.consume(400), 400);
        assert_eq!(quota.available(), 600);
        assert_eq!(quota.consume(900), 600);
        assert_eq!(quota.available(), 0);

        quota.refill(2000);
        assert_eq!(quota.available(), 2000);
        assert_eq!(quota.last_grant(), 2000);
    }
}
