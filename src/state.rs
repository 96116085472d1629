//! Connection state machine
//!
//! States a uTP connection moves through, from handshake to teardown, and
//! the predicates the buffer engine and the connection driver use to decide
//! what is legal in each state.

use serde::{Deserialize, Serialize};

/// uTP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Initial state, no connection
    Idle,

    /// SYN sent, waiting for the acknowledging STATE (initiator)
    SynSent,

    /// SYN received, waiting to send the acknowledging STATE (responder)
    SynRecv,

    /// Connection established, data transfer active
    Connected,

    /// Local FIN sent, waiting for it to be acknowledged
    FinSent,

    /// Connection closed normally
    Closed,

    /// Connection reset by peer
    Reset,

    /// Connection timed out (handshake or retransmission limit)
    TimedOut,
}

impl ConnectionState {
    /// Whether the buffer engine accepts inbound DATA/STATE/FIN packets.
    ///
    /// Packets arriving in any other state are a protocol violation from the
    /// peer and are rejected before touching the buffer.
    pub fn accepts_inbound(&self) -> bool {
        matches!(self, Self::Connected | Self::FinSent)
    }

    /// Whether new application data may be queued for sending.
    pub fn can_send_data(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Reset | Self::TimedOut)
    }

    /// Whether the handshake is still in progress.
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Self::Idle | Self::SynSent | Self::SynRecv)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::SynRecv => write!(f, "SYN_RECV"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::FinSent => write!(f, "FIN_SENT"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Reset => write!(f, "RESET"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Per-connection counters, queried through the stream handle.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Packets sent, including retransmissions
    pub packets_sent: u64,

    /// Packets received, including duplicates
    pub packets_received: u64,

    /// Payload bytes sent
    pub bytes_sent: u64,

    /// Payload bytes delivered to the receive buffer
    pub bytes_received: u64,

    /// Packets retransmitted
    pub retransmits: u64,

    /// Stale acknowledgments observed
    pub old_acks: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, payload_bytes: u64) {
        self.packets_sent += 1;
        self.bytes_sent += payload_bytes;
    }

    pub fn record_received(&mut self, payload_bytes: u64) {
        self.packets_received += 1;
        self.bytes_received += payload_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_acceptance() {
        assert!(ConnectionState::Connected.accepts_inbound());
        assert!(ConnectionState::FinSent.accepts_inbound());
        assert!(!ConnectionState::SynSent.accepts_inbound());
        assert!(!ConnectionState::Closed.accepts_inbound());
        assert!(!ConnectionState::Reset.accepts_inbound());
    }

    #[test]
    fn test_send_gate() {
        assert!(ConnectionState::Connected.can_send_data());
        // no new data once our FIN is queued
        assert!(!ConnectionState::FinSent.can_send_data());
        assert!(!ConnectionState::Closed.can_send_data());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::TimedOut.is_terminal());
        assert!(!ConnectionState::FinSent.is_terminal());
    }
}
