//! Per-connection reliable-stream buffer engine
//!
//! This is the subsystem that turns an unreliable, unordered datagram
//! channel into an ordered, reliable, flow-controlled byte stream. One
//! [`Buffer`] exists per connection and is mutated only by the owning task;
//! every entry point is a synchronous state transformation returning a list
//! of [`Event`]s for the connection driver to interpret.
//!
//! The receive side runs inbound packets through sequence validation, a
//! bounded reorder buffer and a FIFO of ready chunks. The send side
//! packetizes writer bytes into the free window and keeps everything
//! unacknowledged in a retransmission queue until the peer's ACKs prune it.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};

use crate::config::UtpConfig;
use crate::error::{Result, UtpError};
use crate::event::Event;
use crate::network::Network;
use crate::packet::{Packet, PacketType};
use crate::queue::{Fill, ProcessQueue};
use crate::seq;
use crate::state::ConnectionState;

/// Default cap on distinct out-of-order entries; sequence numbers at or
/// beyond this distance from the next expected one are rejected.
pub const REORDER_BUFFER_MAX: u16 = 511;

/// Window growth below this many bytes is not worth announcing after a
/// zero-window stall.
const ZEROWINDOW_REOPEN_BYTES: u32 = 1000;

/// A sent packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct WrappedPacket {
    /// The packet as it went onto the wire
    pub packet: Packet,

    /// Send attempts, starting at 1
    pub transmissions: u32,

    /// Monotonic microsecond timestamp of the latest send
    pub send_time: u32,

    /// Set when the last send attempt was dropped before reaching the wire
    pub need_resend: bool,
}

impl WrappedPacket {
    fn new(packet: Packet, send_time: u32) -> Self {
        Self {
            packet,
            transmissions: 1,
            send_time,
            need_resend: false,
        }
    }

    /// Payload bytes this packet keeps in flight.
    pub fn payload_len(&self) -> u32 {
        self.packet.payload.len() as u32
    }
}

/// Send timestamps usable as RTT samples: only first-transmission packets
/// qualify, so retransmission ambiguity never skews the estimate.
pub fn extract_rtt(packets: &[WrappedPacket]) -> Vec<u32> {
    packets
        .iter()
        .filter(|p| p.transmissions == 1)
        .map(|p| p.send_time)
        .collect()
}

/// Total payload bytes across a list of wrapped packets.
pub fn extract_payload_size(packets: &[WrappedPacket]) -> u32 {
    packets.iter().map(|p| p.payload_len()).sum()
}

/// True when a window announcement is due: the peer last saw a zero window
/// and enough room has opened to be worth a datagram.
pub fn view_zerowindow_reopen(old: u32, new: u32) -> bool {
    old == 0 && new > ZEROWINDOW_REOPEN_BYTES
}

/// Ordered bytes handed to the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum RecvData {
    /// Nothing buffered at all
    Empty,

    /// Exactly the requested number of bytes
    Exact(Bytes),

    /// Fewer bytes than requested; the buffer is drained
    Partial(Bytes),
}

/// Where an inbound sequence number lands relative to the receive window.
enum SeqClass {
    /// Duplicate of the last consumed sequence, or a pure ACK
    NoData,

    /// Within the reorder window, possibly ahead of the next expected
    InWindow,
}

/// What one payload ingest did to the receive side.
enum RecvOutcome {
    /// Nothing changed
    Unchanged,

    /// The reorder buffer or the next expected sequence advanced
    Changed,

    /// The sequence was already buffered; dropped, but an ACK is forced
    Duplicate,

    /// The peer's FIN was reached in order
    GotFin,
}

/// Per-connection buffer engine state.
#[derive(Debug)]
pub struct Buffer {
    /// Ordered payload chunks awaiting the reader
    recv_buf: VecDeque<Bytes>,

    /// Payload bytes in `recv_buf`, kept in sync with it
    recv_buf_bytes: u32,

    /// Out-of-order payloads keyed by sequence number
    reorder_buf: BTreeMap<u16, Bytes>,

    /// Sent packets awaiting ACK, newest at the front
    retransmission_queue: VecDeque<WrappedPacket>,

    /// Next inbound sequence number the receive side wants
    next_expected_seq_no: u16,

    /// Next outbound sequence number to assign
    seq_no: u16,

    /// Sequence number of the peer's FIN, once seen
    fin_state: Option<u16>,

    /// Receive buffer capacity in bytes
    opt_recv_buf_sz: u32,

    /// Reorder cap and far-future gate
    reorder_buf_max: u16,

    /// Outbound payload cap per packet
    pkt_size: u32,

    /// Connection id stamped on outbound packets
    connection_id: u16,
}

impl Buffer {
    /// Create the engine for an established connection.
    ///
    /// `initial_seq_no` is ours (randomly chosen by the driver);
    /// `next_expected_seq_no` is learned from the peer's SYN exchange.
    pub fn new(
        config: &UtpConfig,
        connection_id: u16,
        initial_seq_no: u16,
        next_expected_seq_no: u16,
    ) -> Self {
        Self {
            recv_buf: VecDeque::new(),
            recv_buf_bytes: 0,
            reorder_buf: BTreeMap::new(),
            retransmission_queue: VecDeque::new(),
            next_expected_seq_no,
            seq_no: initial_seq_no,
            fin_state: None,
            opt_recv_buf_sz: config.recv_buf_bytes,
            reorder_buf_max: config.reorder_buf_max,
            pkt_size: config.pkt_size,
            connection_id,
        }
    }

    /// Next outbound sequence number.
    pub fn seq_no(&self) -> u16 {
        self.seq_no
    }

    /// Next inbound sequence number the receive side wants.
    pub fn next_expected_seq_no(&self) -> u16 {
        self.next_expected_seq_no
    }

    /// Sequence number of the peer's FIN, if one arrived.
    pub fn fin_state(&self) -> Option<u16> {
        self.fin_state
    }

    /// Packets currently awaiting acknowledgment.
    pub fn unacked_count(&self) -> usize {
        self.retransmission_queue.len()
    }

    /// Out-of-order payloads currently buffered.
    pub fn reorder_count(&self) -> usize {
        self.reorder_buf.len()
    }

    /// Payload bytes sent but not yet acknowledged.
    pub fn inflight_bytes(&self) -> u32 {
        self.retransmission_queue
            .iter()
            .map(|p| p.payload_len())
            .sum()
    }

    /// Payload bytes buffered for the reader.
    pub fn recv_available(&self) -> u32 {
        self.recv_buf_bytes
    }

    /// Bytes of receive buffer currently free, announced to the peer.
    pub fn advertised_window(&self) -> u32 {
        self.opt_recv_buf_sz.saturating_sub(self.recv_buf_bytes)
    }

    // ------------------------------------------------------------------
    // Inbound pipeline
    // ------------------------------------------------------------------

    /// Process one inbound DATA, STATE or FIN packet.
    ///
    /// Returns the emitted events and the updated peer-window view. Errors
    /// (`InvalidState`, `FarInFuture`) abort processing without touching
    /// the buffer; the connection task decides whether to RESET.
    pub fn handle_packet<N: Network>(
        &mut self,
        state: ConnectionState,
        packet: &Packet,
        pkt_window: u32,
        network: &mut N,
    ) -> Result<(Vec<Event>, u32)> {
        if !state.accepts_inbound() {
            return Err(UtpError::invalid_state("handle packet", state));
        }

        // A FIN fixes the final sequence number once; later FINs are noise.
        if packet.is_fin() && self.fin_state.is_none() {
            self.fin_state = Some(packet.seq_no);
        }

        let class = self.validate_seq_no(packet.seq_no)?;

        let outcome = match class {
            SeqClass::NoData if packet.payload.is_empty() => RecvOutcome::Unchanged,
            // Duplicate of the last consumed sequence still carrying data:
            // our ACK was lost, so force another one.
            SeqClass::NoData => RecvOutcome::Duplicate,
            SeqClass::InWindow => {
                self.update_recv_buffer(packet.seq_no, packet.payload.clone(), state)
            }
        };

        let mut events = Vec::new();
        let changed = matches!(outcome, RecvOutcome::Changed | RecvOutcome::GotFin);
        let forced_ack = matches!(outcome, RecvOutcome::Duplicate) || packet.is_fin();
        if matches!(outcome, RecvOutcome::GotFin) {
            events.push(Event::GotFin);
        }
        if changed || forced_ack {
            events.push(Event::SendAck);
        }

        events.extend(self.update_send_buffer(packet.ack_no));

        let pkt_window = network.handle_window_size(pkt_window, packet.wnd_size);
        Ok((events, pkt_window))
    }

    /// Classify an inbound sequence number against the receive window.
    fn validate_seq_no(&self, seq_no: u16) -> Result<SeqClass> {
        let diff = seq::dist(seq_no, self.next_expected_seq_no);
        let diff_m1 = seq::dist(seq_no, seq::pred(self.next_expected_seq_no));
        if diff_m1 == 0 {
            return Ok(SeqClass::NoData);
        }
        if diff >= self.reorder_buf_max {
            return Err(UtpError::far_in_future(seq_no, self.next_expected_seq_no));
        }
        Ok(SeqClass::InWindow)
    }

    /// Apply one in-window payload to the receive side.
    fn update_recv_buffer(
        &mut self,
        seq_no: u16,
        payload: Bytes,
        state: ConnectionState,
    ) -> RecvOutcome {
        if payload.is_empty() {
            // A bare FIN at exactly the next expected sequence consumes it.
            if self.fin_state == Some(seq_no) && seq_no == self.next_expected_seq_no {
                self.next_expected_seq_no = seq::succ(seq_no);
                return RecvOutcome::GotFin;
            }
            return RecvOutcome::Unchanged;
        }

        if seq_no == self.next_expected_seq_no {
            self.enqueue_payload(payload, state);
            self.next_expected_seq_no = seq::succ(seq_no);
            if self.fin_state == Some(seq_no) {
                // FIN carried the final payload; both are consumed now.
                return RecvOutcome::GotFin;
            }
            if self.drain_reorder_buffer(state) {
                return RecvOutcome::GotFin;
            }
            return RecvOutcome::Changed;
        }

        match self.reorder_buf.entry(seq_no) {
            std::collections::btree_map::Entry::Occupied(_) => RecvOutcome::Duplicate,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(payload);
                RecvOutcome::Changed
            }
        }
    }

    /// Queue a payload chunk for the reader.
    ///
    /// Once our FIN is out the local reader is gone; the bytes are dropped
    /// but the sequence still advances so the packet gets acknowledged.
    fn enqueue_payload(&mut self, payload: Bytes, state: ConnectionState) {
        if state == ConnectionState::Connected {
            self.recv_buf_bytes += payload.len() as u32;
            self.recv_buf.push_back(payload);
        }
    }

    /// Move contiguous reorder entries into the receive queue, consuming a
    /// recorded FIN when the sequence reaches it. Returns true when the FIN
    /// was reached.
    fn drain_reorder_buffer(&mut self, state: ConnectionState) -> bool {
        loop {
            let next = self.next_expected_seq_no;
            if let Some(payload) = self.reorder_buf.remove(&next) {
                self.enqueue_payload(payload, state);
                self.next_expected_seq_no = seq::succ(next);
                if self.fin_state == Some(next) {
                    return true;
                }
                continue;
            }
            if self.fin_state == Some(next) {
                self.next_expected_seq_no = seq::succ(next);
                return true;
            }
            return false;
        }
    }

    // ------------------------------------------------------------------
    // ACK processing
    // ------------------------------------------------------------------

    /// Prune the retransmission queue against an acknowledgment number.
    pub fn update_send_buffer(&mut self, ack_no: u16) -> Vec<Event> {
        let window_size = self.retransmission_queue.len() as u16;
        let last_sent = seq::pred(self.seq_no);
        let window_start = last_sent.wrapping_sub(window_size);
        let acks_ahead = seq::dist(ack_no, window_start);

        if acks_ahead > window_size {
            return vec![Event::OldAck];
        }

        let mut acked = Vec::new();
        self.retransmission_queue.retain(|wrapped| {
            if seq::dist(wrapped.packet.seq_no, window_start) <= acks_ahead {
                acked.push(wrapped.clone());
                false
            } else {
                true
            }
        });

        let mut events = Vec::new();
        if acked.is_empty() {
            if !self.retransmission_queue.is_empty() {
                events.push(Event::DataInflight);
            }
            return events;
        }

        if acked.iter().any(|w| w.packet.is_fin()) {
            events.push(Event::FinSentAcked);
        }
        events.push(Event::Acked(acked));
        if self.retransmission_queue.is_empty() {
            events.push(Event::AllAcked);
        } else {
            events.push(Event::DataInflight);
        }
        events
    }

    // ------------------------------------------------------------------
    // Outbound pipeline
    // ------------------------------------------------------------------

    /// Transmit one DATA or FIN packet, consuming a sequence number and
    /// entering it into the retransmission queue.
    ///
    /// A retryable send failure leaves the packet queued with
    /// `need_resend` set; the retransmission timer picks it up.
    pub fn send_packet<N: Network>(
        &mut self,
        packet_type: PacketType,
        payload: Bytes,
        network: &mut N,
    ) -> Result<()> {
        debug_assert!(
            matches!(packet_type, PacketType::Data | PacketType::Fin),
            "only DATA and FIN consume sequence numbers"
        );

        let packet = Packet {
            packet_type,
            connection_id: self.connection_id,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_no: self.seq_no,
            ack_no: seq::pred(self.next_expected_seq_no),
            extensions: Vec::new(),
            payload,
        };

        let wrapped = match network.send_pkt(self.advertised_window(), &packet) {
            Ok(send_time) => WrappedPacket::new(packet, send_time),
            Err(err) if err.is_retryable() => {
                let mut wrapped = WrappedPacket::new(packet, 0);
                wrapped.need_resend = true;
                wrapped
            }
            Err(err) => return Err(err),
        };

        self.retransmission_queue.push_front(wrapped);
        self.seq_no = seq::succ(self.seq_no);
        Ok(())
    }

    /// Transmit a STATE packet acknowledging everything received in order.
    ///
    /// STATE packets report the last assigned sequence number, consume no
    /// sequence number themselves and are never retransmitted.
    pub fn send_ack<N: Network>(&mut self, network: &mut N) -> Result<()> {
        let packet = Packet::state(
            self.connection_id,
            seq::pred(self.seq_no),
            seq::pred(self.next_expected_seq_no),
        );
        match network.send_pkt(self.advertised_window(), &packet) {
            Ok(_) => Ok(()),
            Err(err) if err.is_retryable() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Queue and transmit our FIN.
    pub fn send_fin<N: Network>(&mut self, network: &mut N) -> Result<()> {
        self.send_packet(PacketType::Fin, Bytes::new(), network)
    }

    /// Pull writer bytes into the free send window and transmit them.
    pub fn fill_window<N: Network, Q: ProcessQueue>(
        &mut self,
        network: &mut N,
        queue: &mut Q,
    ) -> Result<Vec<Event>> {
        let max_window = network.max_window_send();
        let free = if self.retransmission_queue.is_empty() {
            max_window
        } else {
            max_window.saturating_sub(self.inflight_bytes())
        };

        let mut chunks: Vec<Bytes> = Vec::new();
        let mut filled: u32 = 0;
        while filled < free {
            let to_fill = (free - filled).min(self.pkt_size);
            match queue.fill(to_fill as usize) {
                Fill::Filled(chunk) => {
                    filled += chunk.len() as u32;
                    chunks.push(chunk);
                }
                Fill::Partial(chunk) => {
                    filled += chunk.len() as u32;
                    chunks.push(chunk);
                    break;
                }
                Fill::Zero => break,
            }
        }

        let sent_any = !chunks.is_empty();
        for chunk in chunks {
            self.send_packet(PacketType::Data, chunk, network)?;
        }

        let mut events = vec![if sent_any {
            Event::SentData
        } else {
            Event::NoPiggyback
        }];
        if free > 0 && filled == free {
            events.push(Event::WindowMaxedOut);
        }
        Ok(events)
    }

    // ------------------------------------------------------------------
    // Retransmission
    // ------------------------------------------------------------------

    /// Resend the oldest unacknowledged packet.
    ///
    /// The packet goes out unchanged; only its transmission count and send
    /// timestamp move, which also removes it from RTT sampling.
    pub fn retransmit_packet<N: Network>(&mut self, network: &mut N) -> Result<()> {
        let oldest = self
            .retransmission_queue
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| seq::order(a.packet.seq_no, b.packet.seq_no))
            .map(|(idx, _)| idx);
        let Some(idx) = oldest else {
            return Ok(());
        };

        // remove cannot fail, idx came from the scan above
        let Some(mut wrapped) = self.retransmission_queue.remove(idx) else {
            return Ok(());
        };
        match network.send_pkt(self.advertised_window(), &wrapped.packet) {
            Ok(send_time) => {
                wrapped.transmissions += 1;
                wrapped.send_time = send_time;
                wrapped.need_resend = false;
            }
            Err(err) if err.is_retryable() => {
                wrapped.need_resend = true;
            }
            Err(err) => {
                self.retransmission_queue.push_front(wrapped);
                return Err(err);
            }
        }
        self.retransmission_queue.push_front(wrapped);
        Ok(())
    }

    /// Highest transmission count across unacknowledged packets. The driver
    /// compares this against its retry limit.
    pub fn max_transmissions(&self) -> u32 {
        self.retransmission_queue
            .iter()
            .map(|p| p.transmissions)
            .max()
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Reader
    // ------------------------------------------------------------------

    /// Pop one whole chunk of ordered bytes, or nothing.
    pub fn dequeue(&mut self) -> Option<Bytes> {
        let chunk = self.recv_buf.pop_front()?;
        self.recv_buf_bytes -= chunk.len() as u32;
        Some(chunk)
    }

    /// Push a chunk back to the head of the receive queue.
    pub fn putback(&mut self, chunk: Bytes) {
        self.recv_buf_bytes += chunk.len() as u32;
        self.recv_buf.push_front(chunk);
    }

    /// Read up to `n` contiguous bytes, splitting or concatenating chunks
    /// as needed. A split chunk's tail goes back to the queue head, so no
    /// bytes are ever lost. Never blocks.
    pub fn draining_receive(&mut self, n: usize) -> RecvData {
        if self.recv_buf.is_empty() {
            return RecvData::Empty;
        }

        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(mut chunk) = self.dequeue() else {
                break;
            };
            let want = n - out.len();
            if chunk.len() > want {
                out.extend_from_slice(&chunk.split_to(want));
                self.putback(chunk);
            } else {
                out.extend_from_slice(&chunk);
            }
        }

        if out.len() == n {
            RecvData::Exact(out.freeze())
        } else {
            RecvData::Partial(out.freeze())
        }
    }
}
