//! Typed error hierarchy for gosh-utp
//!
//! Every error carries the context needed to decide whether the connection
//! can continue. Recoverable conditions (duplicates, stale ACKs, droppable
//! send failures) are surfaced as [`crate::event::Event`]s instead and never
//! reach this type.

use thiserror::Error;

use crate::state::ConnectionState;

/// Main error type for the transport
#[derive(Debug, Error)]
pub enum UtpError {
    /// Packet received in a state that cannot accept it (protocol violation)
    #[error("cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: ConnectionState,
    },

    /// Inbound sequence number too far ahead of the next expected one
    #[error("sequence {seq_no} too far ahead of expected {expected}")]
    FarInFuture { seq_no: u16, expected: u16 },

    /// Malformed or truncated packet on the wire
    #[error("invalid packet: {message}")]
    InvalidPacket { message: String },

    /// Outbound send failed at the network layer
    #[error("send failed: {message}")]
    SendFailed { message: String, retryable: bool },

    /// Operation attempted on a connection that has already terminated
    #[error("connection closed: {state}")]
    Closed { state: ConnectionState },

    /// Handshake or retransmission limit exceeded
    #[error("connection timed out")]
    TimedOut,
}

impl UtpError {
    /// Check if the operation that produced this error may be retried.
    ///
    /// A retryable send failure is treated as a dropped datagram; the
    /// retransmission timer covers it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendFailed { retryable: true, .. })
    }

    /// Create an invalid-state error
    pub fn invalid_state(action: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { action, state }
    }

    /// Create a far-in-future sequence error
    pub fn far_in_future(seq_no: u16, expected: u16) -> Self {
        Self::FarInFuture { seq_no, expected }
    }

    /// Create a packet decode error
    pub fn invalid_packet(message: impl Into<String>) -> Self {
        Self::InvalidPacket {
            message: message.into(),
        }
    }

    /// Create a send failure
    pub fn send_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::SendFailed {
            message: message.into(),
            retryable,
        }
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, UtpError>;
