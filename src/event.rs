//! Engine events
//!
//! Every public entry point of the buffer engine returns a list of events
//! describing what the call observed or wants done. The connection driver
//! interprets them: `SendAck` is an intent the delayed-ACK scheduler may
//! coalesce, `Acked` feeds the congestion controller, and the remaining
//! variants drive state transitions and writer wakeups.

use crate::buffer::WrappedPacket;

/// Events emitted by the buffer engine
#[derive(Debug, Clone)]
pub enum Event {
    /// The receive side changed; an acknowledgment should be scheduled
    SendAck,

    /// These packets were acknowledged and left the retransmission queue
    Acked(Vec<WrappedPacket>),

    /// The peer's FIN was reached in sequence order; no more data follows
    GotFin,

    /// The acknowledgment preceded the current send window; ignored
    OldAck,

    /// Window filling consumed the free send window exactly
    WindowMaxedOut,

    /// At least one DATA packet was transmitted by window filling
    SentData,

    /// Window filling found nothing to send
    NoPiggyback,

    /// Unacknowledged packets remain in flight
    DataInflight,

    /// The retransmission queue drained completely on this acknowledgment
    AllAcked,

    /// Our FIN has been acknowledged by the peer
    FinSentAcked,
}
