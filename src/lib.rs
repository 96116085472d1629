//! # gosh-utp
//!
//! A reliable, ordered, flow-controlled byte stream over UDP, implementing
//! the uTP transport (BEP 29).
//!
//! ## Features
//!
//! - **Reliable delivery**: 16-bit wrap-around sequence space, bounded
//!   reorder buffering and ACK-driven retransmission
//! - **Flow control**: receiver-advertised windows with zero-window stall
//!   and reopen handling
//! - **Pluggable I/O**: the engine consumes already-parsed packets and emits
//!   datagrams through narrow traits, so it runs under any UDP
//!   demultiplexer
//! - **Async**: one lightweight Tokio task per connection; the core engine
//!   itself is synchronous and allocation-light
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gosh_utp::{UtpConfig, UtpStream};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The socket layer routes datagrams; the stream drives one connection.
//!     let (datagram_tx, _datagram_rx) = mpsc::channel(256);
//!     let (_packet_tx, packet_rx) = mpsc::channel(256);
//!
//!     let stream = UtpStream::outgoing(
//!         "192.0.2.1:6881".parse()?,
//!         0x1000,
//!         datagram_tx,
//!         packet_rx,
//!         UtpConfig::default(),
//!     );
//!     stream.connect().await?;
//!
//!     stream.write(b"hello").await?;
//!     let mut buf = [0u8; 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("got {} bytes", n);
//!
//!     stream.shutdown().await?;
//!     Ok(())
//! }
//! ```

// Modules
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod network;
pub mod packet;
pub mod queue;
pub mod seq;
pub mod state;
pub mod stream;

// Re-exports for convenience
pub use buffer::{
    extract_payload_size, extract_rtt, view_zerowindow_reopen, Buffer, RecvData, WrappedPacket,
    REORDER_BUFFER_MAX,
};
pub use config::UtpConfig;
pub use error::{Result, UtpError};
pub use event::Event;
pub use network::{Network, SendQuota};
pub use packet::{Extension, Packet, PacketType, HEADER_SIZE, UTP_VERSION};
pub use queue::{ByteQueue, Fill, ProcessQueue};
pub use state::{ConnectionState, ConnectionStats};
pub use stream::{ChannelNetwork, DatagramSender, PacketReceiver, UtpStream};
