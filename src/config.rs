//! Transport configuration
//!
//! All tunables for a uTP connection. Defaults follow the protocol's
//! conventional values; every field can be overridden per connection.

use serde::{Deserialize, Serialize};

use crate::buffer::REORDER_BUFFER_MAX;

/// Configuration for a uTP connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtpConfig {
    /// Receive buffer capacity in bytes. Bounds the advertised window.
    #[serde(default = "default_recv_buf_bytes")]
    pub recv_buf_bytes: u32,

    /// Maximum distinct out-of-order packets buffered for reordering.
    /// Sequence numbers at or beyond this distance from the next expected
    /// one are rejected outright.
    #[serde(default = "default_reorder_buf_max")]
    pub reorder_buf_max: u16,

    /// Accumulated unacknowledged bytes that force an immediate ACK.
    #[serde(default = "default_delayed_ack_byte_threshold")]
    pub delayed_ack_byte_threshold: u32,

    /// Longest time an ACK intent may be held back, in milliseconds.
    #[serde(default = "default_delayed_ack_time_ms")]
    pub delayed_ack_time_ms: u64,

    /// Outbound payload cap per packet, in bytes.
    #[serde(default = "default_pkt_size")]
    pub pkt_size: u32,

    /// Upper bound on the send window regardless of what the peer
    /// advertises, in bytes.
    #[serde(default = "default_send_window_cap")]
    pub send_window_cap: u32,

    /// Retransmission attempts per packet before the connection is
    /// declared dead.
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,

    /// Interval of the retransmission timer, in milliseconds.
    #[serde(default = "default_retransmit_timeout_ms")]
    pub retransmit_timeout_ms: u64,

    /// Handshake timeout, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_recv_buf_bytes() -> u32 {
    8192
}

fn default_reorder_buf_max() -> u16 {
    REORDER_BUFFER_MAX
}

fn default_delayed_ack_byte_threshold() -> u32 {
    2400
}

fn default_delayed_ack_time_ms() -> u64 {
    100
}

fn default_pkt_size() -> u32 {
    1000
}

fn default_send_window_cap() -> u32 {
    1024 * 1024
}

fn default_max_retransmits() -> u32 {
    10
}

fn default_retransmit_timeout_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            recv_buf_bytes: default_recv_buf_bytes(),
            reorder_buf_max: default_reorder_buf_max(),
            delayed_ack_byte_threshold: default_delayed_ack_byte_threshold(),
            delayed_ack_time_ms: default_delayed_ack_time_ms(),
            pkt_size: default_pkt_size(),
            send_window_cap: default_send_window_cap(),
            max_retransmits: default_max_retransmits(),
            retransmit_timeout_ms: default_retransmit_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UtpConfig::default();
        assert_eq!(config.recv_buf_bytes, 8192);
        assert_eq!(config.reorder_buf_max, 511);
        assert_eq!(config.delayed_ack_byte_threshold, 2400);
        assert_eq!(config.delayed_ack_time_ms, 100);
        assert_eq!(config.pkt_size, 1000);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: UtpConfig = serde_json::from_str(r#"{"pkt_size": 1400}"#).unwrap();
        assert_eq!(config.pkt_size, 1400);
        assert_eq!(config.recv_buf_bytes, 8192);
        assert_eq!(config.reorder_buf_max, 511);
    }
}
