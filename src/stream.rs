//! Connection driver and stream API
//!
//! One task owns each connection. It blocks on inbound packets, writer
//! wakeups, the retransmission timer and the delayed-ACK deadline, and calls
//! into the [`Buffer`] engine synchronously; the engine itself never awaits.
//! [`UtpStream`] is the application-facing handle with async `read`,
//! `write` and `shutdown`.
//!
//! Datagram I/O stays outside: inbound packets arrive already parsed on an
//! mpsc channel and outbound datagrams leave on another, so the same driver
//! works under any socket demultiplexer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::buffer::{extract_payload_size, extract_rtt, view_zerowindow_reopen, Buffer, RecvData};
use crate::config::UtpConfig;
use crate::error::{Result, UtpError};
use crate::event::Event;
use crate::network::{Network, SendQuota};
use crate::packet::{timestamp_micros, Packet};
use crate::queue::{ByteQueue, Fill, ProcessQueue};
use crate::seq;
use crate::state::{ConnectionState, ConnectionStats};

/// Channel for handing encoded datagrams to the socket layer
pub type DatagramSender = mpsc::Sender<(Vec<u8>, SocketAddr)>;

/// Channel delivering already-parsed inbound packets to a connection
pub type PacketReceiver = mpsc::Receiver<Packet>;

/// [`Network`] implementation backed by a datagram channel.
///
/// Stamps timestamps and the advertised window onto outgoing packets and
/// tracks the peer's advertised window for the send ceiling. A full channel
/// counts as a dropped datagram; a closed channel is fatal.
pub struct ChannelNetwork {
    remote_addr: SocketAddr,
    datagram_tx: DatagramSender,
    reply_micro: u32,
    peer_window: u32,
    window_cap: u32,
    stats: ConnectionStats,
}

impl ChannelNetwork {
    pub fn new(remote_addr: SocketAddr, datagram_tx: DatagramSender, window_cap: u32) -> Self {
        Self {
            remote_addr,
            datagram_tx,
            reply_micro: 0,
            peer_window: 0,
            window_cap,
            stats: ConnectionStats::new(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Record the peer's clock from an inbound packet; the difference goes
    /// out in our next `timestamp_diff_us` field.
    fn note_peer_timestamp(&mut self, their_timestamp_us: u32) {
        if their_timestamp_us != 0 {
            self.reply_micro = timestamp_micros().wrapping_sub(their_timestamp_us);
        }
    }
}

impl Network for ChannelNetwork {
    fn send_pkt(&mut self, window: u32, packet: &Packet) -> Result<u32> {
        let now = timestamp_micros();
        let stamped = packet
            .clone()
            .with_window(window)
            .with_timestamps(now, self.reply_micro);

        self.datagram_tx
            .try_send((stamped.encode(), self.remote_addr))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    UtpError::send_failed("datagram queue full", true)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    UtpError::send_failed("datagram channel closed", false)
                }
            })?;

        self.stats.record_sent(packet.payload.len() as u64);
        Ok(now)
    }

    fn max_window_send(&self) -> u32 {
        self.window_cap.min(self.peer_window)
    }

    fn handle_window_size(&mut self, _pkt_window: u32, win_sz: u32) -> u32 {
        self.peer_window = win_sz;
        win_sz
    }
}

/// Writer queue view that also charges the per-tick send quota.
struct QuotaQueue<'a> {
    queue: &'a mut ByteQueue,
    quota: &'a mut SendQuota,
}

impl ProcessQueue for QuotaQueue<'_> {
    fn fill(&mut self, n: usize) -> Fill {
        let allowed = n.min(self.quota.available() as usize);
        if allowed == 0 {
            return Fill::Zero;
        }
        match self.queue.fill(allowed) {
            Fill::Filled(chunk) => {
                self.quota.consume(chunk.len() as u32);
                if allowed < n {
                    // quota clamped the pull; stop filling this round
                    Fill::Partial(chunk)
                } else {
                    Fill::Filled(chunk)
                }
            }
            Fill::Partial(chunk) => {
                self.quota.consume(chunk.len() as u32);
                Fill::Partial(chunk)
            }
            Fill::Zero => Fill::Zero,
        }
    }
}

/// Shared per-connection state behind the stream handle and the driver.
struct Inner {
    state: ConnectionState,
    buffer: Option<Buffer>,
    network: ChannelNetwork,
    outbound: ByteQueue,
    quota: SendQuota,
    pkt_window: u32,
    stats: ConnectionStats,
    config: UtpConfig,
    conn_id_send: u16,
    conn_id_recv: u16,
    syn_seq_no: u16,
    syn_transmissions: u32,
    peer_syn_seq: Option<u16>,
    fin_received: bool,
    fin_acked: bool,
    close_requested: bool,
    ack_pending: bool,
    ack_deadline: Option<Instant>,
    bytes_since_ack: u32,
    last_progress: Instant,
}

impl Inner {
    /// Transition into `Connected` once the peer's sequence is known.
    fn establish(&mut self, peer_seq_no: u16) {
        let buffer = Buffer::new(
            &self.config,
            self.conn_id_send,
            seq::succ(self.syn_seq_no),
            seq::succ(peer_seq_no),
        );
        self.buffer = Some(buffer);
        self.state = ConnectionState::Connected;
        tracing::debug!(peer = %self.network.remote_addr(), "connection established");
    }

    fn send_syn(&mut self) {
        let syn = Packet::syn(self.conn_id_recv, self.syn_seq_no);
        self.syn_transmissions += 1;
        self.last_progress = Instant::now();
        if let Err(err) = self.network.send_pkt(self.config.recv_buf_bytes, &syn) {
            tracing::warn!(error = %err, "failed to send syn");
        }
    }

    fn send_reset(&mut self) {
        let (seq_no, ack_no) = match self.buffer.as_ref() {
            Some(buffer) => (buffer.seq_no(), seq::pred(buffer.next_expected_seq_no())),
            None => (self.syn_seq_no, 0),
        };
        let reset = Packet::reset(self.conn_id_send, seq_no, ack_no);
        if let Err(err) = self.network.send_pkt(0, &reset) {
            tracing::debug!(error = %err, "failed to send reset");
        }
    }

    fn on_packet(&mut self, pkt: Packet) {
        self.stats.record_received(pkt.payload.len() as u64);
        self.network.note_peer_timestamp(pkt.timestamp_us);

        if pkt.is_reset() {
            tracing::debug!(peer = %self.network.remote_addr(), "connection reset by peer");
            self.state = ConnectionState::Reset;
            return;
        }

        match self.state {
            ConnectionState::SynSent => {
                if pkt.is_state() && pkt.ack_no == self.syn_seq_no {
                    self.pkt_window = self.network.handle_window_size(self.pkt_window, pkt.wnd_size);
                    self.establish(pkt.seq_no);
                }
            }
            ConnectionState::Connected | ConnectionState::FinSent => {
                if pkt.is_syn() {
                    // our acknowledging STATE was lost; answer again
                    if let Some(buffer) = self.buffer.as_mut() {
                        let _ = buffer.send_ack(&mut self.network);
                    }
                    return;
                }
                self.process_established(&pkt);
            }
            _ => {
                tracing::debug!(state = %self.state, "dropping packet");
            }
        }
    }

    fn process_established(&mut self, pkt: &Packet) {
        let state = self.state;
        let pkt_window = self.pkt_window;
        let buffer = match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => return,
        };

        match buffer.handle_packet(state, pkt, pkt_window, &mut self.network) {
            Ok((events, window)) => {
                self.pkt_window = window;
                self.dispatch_events(events, pkt);
            }
            Err(err @ UtpError::FarInFuture { .. }) => {
                tracing::warn!(error = %err, "dropping packet far ahead of receive window");
            }
            Err(err) => {
                tracing::warn!(error = %err, "protocol violation, resetting connection");
                self.send_reset();
                self.state = ConnectionState::Reset;
            }
        }
    }

    fn dispatch_events(&mut self, events: Vec<Event>, pkt: &Packet) {
        let mut saw_fin = false;
        for event in events {
            match event {
                Event::SendAck => {
                    self.ack_pending = true;
                    self.bytes_since_ack += pkt.payload.len() as u32;
                    if self.bytes_since_ack >= self.config.delayed_ack_byte_threshold {
                        self.flush_ack();
                    } else if self.ack_deadline.is_none() {
                        self.ack_deadline = Some(
                            Instant::now() + Duration::from_millis(self.config.delayed_ack_time_ms),
                        );
                    }
                }
                Event::GotFin => {
                    self.fin_received = true;
                    saw_fin = true;
                }
                Event::Acked(packets) => {
                    self.last_progress = Instant::now();
                    let now = timestamp_micros();
                    for sent_at in extract_rtt(&packets) {
                        tracing::trace!(rtt_us = now.wrapping_sub(sent_at), "rtt sample");
                    }
                    tracing::trace!(bytes = extract_payload_size(&packets), "acknowledged");
                }
                Event::FinSentAcked => {
                    self.fin_acked = true;
                }
                Event::OldAck => {
                    self.stats.old_acks += 1;
                }
                Event::AllAcked
                | Event::DataInflight
                | Event::WindowMaxedOut
                | Event::SentData
                | Event::NoPiggyback => {}
            }
        }
        // a FIN is acknowledged immediately, and it has to leave before
        // try_close can retire the driver
        if saw_fin {
            self.flush_ack();
        }
        self.try_close();
    }

    fn flush_ack(&mut self) {
        if !self.ack_pending {
            self.ack_deadline = None;
            return;
        }
        if let Some(buffer) = self.buffer.as_mut() {
            if let Err(err) = buffer.send_ack(&mut self.network) {
                tracing::warn!(error = %err, "failed to send ack");
            }
        }
        self.ack_pending = false;
        self.bytes_since_ack = 0;
        self.ack_deadline = None;
    }

    /// Move writer bytes into the send window, and queue our FIN once the
    /// writer is drained after a close request.
    fn fill_outbound(&mut self) {
        if self.state == ConnectionState::Connected && !self.outbound.is_empty() {
            if let Some(buffer) = self.buffer.as_mut() {
                let mut source = QuotaQueue {
                    queue: &mut self.outbound,
                    quota: &mut self.quota,
                };
                match buffer.fill_window(&mut self.network, &mut source) {
                    Ok(events) => {
                        if events.iter().any(|e| matches!(e, Event::WindowMaxedOut)) {
                            tracing::trace!("send window maxed out");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "window fill failed"),
                }
            }
        }

        if self.close_requested
            && self.state == ConnectionState::Connected
            && self.outbound.is_empty()
        {
            if let Some(buffer) = self.buffer.as_mut() {
                match buffer.send_fin(&mut self.network) {
                    Ok(()) => {
                        self.state = ConnectionState::FinSent;
                        tracing::debug!(peer = %self.network.remote_addr(), "fin sent");
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to send fin"),
                }
            }
        }
        self.try_close();
    }

    fn try_close(&mut self) {
        if self.state == ConnectionState::FinSent
            && self.fin_acked
            && self.fin_received
            && self.buffer.as_ref().map_or(true, |b| b.unacked_count() == 0)
        {
            self.state = ConnectionState::Closed;
            tracing::debug!(peer = %self.network.remote_addr(), "connection closed");
        }
    }

    fn on_tick(&mut self) {
        self.quota
            .refill(self.network.max_window_send().max(self.config.pkt_size));
        let timeout = Duration::from_millis(self.config.retransmit_timeout_ms);

        match self.state {
            ConnectionState::SynSent => {
                if self.last_progress.elapsed() < timeout {
                    return;
                }
                if self.syn_transmissions > self.config.max_retransmits {
                    tracing::warn!(peer = %self.network.remote_addr(), "handshake timed out");
                    self.state = ConnectionState::TimedOut;
                    return;
                }
                self.send_syn();
            }
            ConnectionState::Connected | ConnectionState::FinSent => {
                let unacked = self.buffer.as_ref().map_or(0, |b| b.unacked_count());
                if unacked > 0 && self.last_progress.elapsed() >= timeout {
                    if let Some(buffer) = self.buffer.as_mut() {
                        if buffer.max_transmissions() > self.config.max_retransmits {
                            tracing::warn!(
                                peer = %self.network.remote_addr(),
                                "retransmission limit reached"
                            );
                            self.state = ConnectionState::TimedOut;
                            return;
                        }
                        match buffer.retransmit_packet(&mut self.network) {
                            Ok(()) => self.stats.retransmits += 1,
                            Err(err) => tracing::warn!(error = %err, "retransmission failed"),
                        }
                    }
                    self.last_progress = Instant::now();
                }
                self.fill_outbound();
            }
            _ => {}
        }
    }
}

/// A reliable, ordered byte stream over a datagram channel.
///
/// Created by the socket layer once a connection's packets are being routed
/// to it: [`UtpStream::outgoing`] before sending a SYN, or
/// [`UtpStream::incoming`] from a received SYN.
pub struct UtpStream {
    inner: Arc<Mutex<Inner>>,
    read_notify: Arc<Notify>,
    space_notify: Arc<Notify>,
    task_notify: Arc<Notify>,
    driver: JoinHandle<()>,
}

impl UtpStream {
    /// Create the initiating side of a connection. `conn_id` is the id this
    /// stream receives on; packets go out tagged `conn_id + 1`.
    pub fn outgoing(
        remote_addr: SocketAddr,
        conn_id: u16,
        datagram_tx: DatagramSender,
        packet_rx: PacketReceiver,
        config: UtpConfig,
    ) -> Self {
        Self::build(
            remote_addr,
            conn_id.wrapping_add(1),
            conn_id,
            None,
            0,
            ConnectionState::Idle,
            datagram_tx,
            packet_rx,
            config,
        )
    }

    /// Create the accepting side of a connection from the peer's SYN.
    pub fn incoming(
        remote_addr: SocketAddr,
        syn: &Packet,
        datagram_tx: DatagramSender,
        packet_rx: PacketReceiver,
        config: UtpConfig,
    ) -> Self {
        Self::build(
            remote_addr,
            syn.connection_id,
            syn.connection_id.wrapping_add(1),
            Some(syn.seq_no),
            syn.wnd_size,
            ConnectionState::SynRecv,
            datagram_tx,
            packet_rx,
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        remote_addr: SocketAddr,
        conn_id_send: u16,
        conn_id_recv: u16,
        peer_syn_seq: Option<u16>,
        peer_window: u32,
        state: ConnectionState,
        datagram_tx: DatagramSender,
        packet_rx: PacketReceiver,
        config: UtpConfig,
    ) -> Self {
        let mut network = ChannelNetwork::new(remote_addr, datagram_tx, config.send_window_cap);
        let pkt_window = network.handle_window_size(0, peer_window);

        let inner = Arc::new(Mutex::new(Inner {
            state,
            buffer: None,
            network,
            outbound: ByteQueue::new(),
            quota: SendQuota::new(config.pkt_size),
            pkt_window,
            stats: ConnectionStats::new(),
            conn_id_send,
            conn_id_recv,
            syn_seq_no: rand::thread_rng().gen(),
            syn_transmissions: 0,
            peer_syn_seq,
            fin_received: false,
            fin_acked: false,
            close_requested: false,
            ack_pending: false,
            ack_deadline: None,
            bytes_since_ack: 0,
            last_progress: Instant::now(),
            config,
        }));

        let read_notify = Arc::new(Notify::new());
        let space_notify = Arc::new(Notify::new());
        let task_notify = Arc::new(Notify::new());

        let driver = tokio::spawn(run(
            inner.clone(),
            packet_rx,
            read_notify.clone(),
            space_notify.clone(),
            task_notify.clone(),
        ));

        Self {
            inner,
            read_notify,
            space_notify,
            task_notify,
            driver,
        }
    }

    /// Send our SYN and wait for the acknowledging STATE.
    pub async fn connect(&self) -> Result<()> {
        let timeout = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.state != ConnectionState::Idle {
                return Err(UtpError::invalid_state("connect", inner.state));
            }
            inner.state = ConnectionState::SynSent;
            inner.send_syn();
            Duration::from_secs(inner.config.connect_timeout_secs)
        };

        match tokio::time::timeout(timeout, self.wait_connected()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.lock().state = ConnectionState::TimedOut;
                Err(UtpError::TimedOut)
            }
        }
    }

    async fn wait_connected(&self) -> Result<()> {
        loop {
            {
                let state = self.inner.lock().state;
                match state {
                    ConnectionState::Connected => return Ok(()),
                    s if s.is_terminal() => return Err(UtpError::Closed { state: s }),
                    _ => {}
                }
            }
            self.read_notify.notified().await;
        }
    }

    /// Acknowledge the peer's SYN and enter `Connected`.
    pub async fn accept(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != ConnectionState::SynRecv {
            return Err(UtpError::invalid_state("accept", inner.state));
        }
        let peer_seq = match inner.peer_syn_seq.take() {
            Some(seq) => seq,
            None => return Err(UtpError::invalid_state("accept", inner.state)),
        };

        let buffer = Buffer::new(
            &inner.config,
            inner.conn_id_send,
            rand::thread_rng().gen(),
            seq::succ(peer_seq),
        );
        inner.buffer = Some(buffer);
        inner.state = ConnectionState::Connected;
        if let Some(buffer) = inner.buffer.as_mut() {
            buffer.send_ack(&mut inner.network)?;
        }
        Ok(())
    }

    /// Read ordered bytes, waiting until some arrive. Returns 0 at end of
    /// stream (peer FIN reached and everything before it consumed).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(buffer) = inner.buffer.as_mut() {
                    let old_window = buffer.advertised_window();
                    match buffer.draining_receive(buf.len()) {
                        RecvData::Exact(chunk) | RecvData::Partial(chunk) => {
                            buf[..chunk.len()].copy_from_slice(&chunk);
                            // announce the reopened window before the peer
                            // stalls against the zero we advertised earlier
                            if view_zerowindow_reopen(old_window, buffer.advertised_window()) {
                                if let Err(err) = buffer.send_ack(&mut inner.network) {
                                    tracing::warn!(error = %err, "failed to announce window");
                                }
                            }
                            return Ok(chunk.len());
                        }
                        RecvData::Empty => {
                            if inner.fin_received || inner.state == ConnectionState::Closed {
                                return Ok(0);
                            }
                            if inner.state.is_terminal() {
                                return Err(UtpError::Closed { state: inner.state });
                            }
                        }
                    }
                } else if inner.state.is_terminal() {
                    return Err(UtpError::Closed { state: inner.state });
                }
            }
            self.read_notify.notified().await;
        }
    }

    /// Queue all of `data` for transmission, waiting for buffer space.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.state.is_terminal() {
                    return Err(UtpError::Closed { state: inner.state });
                }
                if inner.close_requested || inner.state == ConnectionState::FinSent {
                    return Err(UtpError::invalid_state("write", inner.state));
                }
                let cap = inner.config.send_window_cap as usize;
                let room = cap.saturating_sub(inner.outbound.len());
                if room > 0 {
                    let take = room.min(data.len() - offset);
                    inner.outbound.push(&data[offset..offset + take]);
                    offset += take;
                    self.task_notify.notify_one();
                    continue;
                }
            }
            self.space_notify.notified().await;
        }
        Ok(())
    }

    /// Flush queued writer bytes, then send our FIN.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Ok(());
            }
            inner.close_requested = true;
        }
        self.task_notify.notify_one();
        Ok(())
    }

    /// Wait until the connection reaches a terminal state.
    pub async fn closed(&self) -> ConnectionState {
        loop {
            {
                let state = self.inner.lock().state;
                if state.is_terminal() {
                    return state;
                }
            }
            self.read_notify.notified().await;
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.lock().network.remote_addr()
    }

    /// Snapshot of the connection counters. The send side lives on the
    /// network half, which sees every packet that goes out.
    pub fn stats(&self) -> ConnectionStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.packets_sent = inner.network.stats.packets_sent;
        stats.bytes_sent = inner.network.stats.bytes_sent;
        stats
    }
}

impl Drop for UtpStream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// The owning task: all engine mutation funnels through here or through
/// API calls holding the same lock.
async fn run(
    inner: Arc<Mutex<Inner>>,
    mut packet_rx: PacketReceiver,
    read_notify: Arc<Notify>,
    space_notify: Arc<Notify>,
    task_notify: Arc<Notify>,
) {
    let tick_ms = inner.lock().config.retransmit_timeout_ms;
    let mut tick = tokio::time::interval(Duration::from_millis(tick_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let ack_deadline = inner.lock().ack_deadline;
        let ack_timer = async {
            match ack_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            maybe_pkt = packet_rx.recv() => match maybe_pkt {
                Some(pkt) => {
                    let mut guard = inner.lock();
                    guard.on_packet(pkt);
                    guard.fill_outbound();
                }
                None => {
                    tracing::debug!("packet channel closed, dropping connection");
                    let mut guard = inner.lock();
                    if !guard.state.is_terminal() {
                        guard.state = ConnectionState::Reset;
                    }
                }
            },
            _ = task_notify.notified() => {
                inner.lock().fill_outbound();
            }
            _ = tick.tick() => {
                inner.lock().on_tick();
            }
            _ = ack_timer => {
                inner.lock().flush_ack();
            }
        }

        read_notify.notify_one();
        space_notify.notify_one();

        if inner.lock().state.is_terminal() {
            break;
        }
    }

    read_notify.notify_one();
    space_notify.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn quick_config() -> UtpConfig {
        UtpConfig {
            retransmit_timeout_ms: 50,
            delayed_ack_time_ms: 10,
            connect_timeout_secs: 5,
            ..UtpConfig::default()
        }
    }

    /// Wire two streams together through in-process channels, routing the
    /// initiator's SYN to a oneshot so the accepting side can be built
    /// from it the way a socket demultiplexer would.
    fn loopback() -> (
        DatagramSender,
        PacketReceiver,
        DatagramSender,
        PacketReceiver,
        oneshot::Receiver<Packet>,
    ) {
        let (a_tx, mut a_out) = mpsc::channel::<(Vec<u8>, SocketAddr)>(256);
        let (b_tx, mut b_out) = mpsc::channel::<(Vec<u8>, SocketAddr)>(256);
        let (a_in_tx, a_in_rx) = mpsc::channel::<Packet>(256);
        let (b_in_tx, b_in_rx) = mpsc::channel::<Packet>(256);
        let (syn_tx, syn_rx) = oneshot::channel::<Packet>();

        tokio::spawn(async move {
            let mut syn_tx = Some(syn_tx);
            while let Some((bytes, _)) = a_out.recv().await {
                if let Ok(pkt) = Packet::decode(&bytes) {
                    if pkt.is_syn() {
                        if let Some(tx) = syn_tx.take() {
                            let _ = tx.send(pkt);
                            continue;
                        }
                    }
                    if b_in_tx.send(pkt).await.is_err() {
                        break;
                    }
                }
            }
        });
        tokio::spawn(async move {
            while let Some((bytes, _)) = b_out.recv().await {
                if let Ok(pkt) = Packet::decode(&bytes) {
                    if a_in_tx.send(pkt).await.is_err() {
                        break;
                    }
                }
            }
        });

        (a_tx, a_in_rx, b_tx, b_in_rx, syn_rx)
    }

    #[tokio::test]
    async fn test_handshake_and_transfer() {
        let (a_tx, a_in_rx, b_tx, b_in_rx, syn_rx) = loopback();
        let a = UtpStream::outgoing(test_addr(), 7000, a_tx, a_in_rx, quick_config());

        let accept_side = async {
            let syn = syn_rx.await.expect("syn not forwarded");
            let b = UtpStream::incoming(test_addr(), &syn, b_tx, b_in_rx, quick_config());
            b.accept().await.expect("accept failed");
            b
        };

        let (connected, b) = tokio::join!(a.connect(), accept_side);
        connected.expect("connect failed");
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);

        a.write(b"hello over utp").await.unwrap();
        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello over utp");

        // and the other direction
        b.write(b"right back at you").await.unwrap();
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"right back at you");
    }

    #[tokio::test]
    async fn test_large_transfer_spans_packets() {
        let (a_tx, a_in_rx, b_tx, b_in_rx, syn_rx) = loopback();
        let a = UtpStream::outgoing(test_addr(), 7001, a_tx, a_in_rx, quick_config());

        let accept_side = async {
            let syn = syn_rx.await.unwrap();
            let b = UtpStream::incoming(test_addr(), &syn, b_tx, b_in_rx, quick_config());
            b.accept().await.unwrap();
            b
        };
        let (connected, b) = tokio::join!(a.connect(), accept_side);
        connected.unwrap();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        a.write(&payload).await.unwrap();

        let mut received = Vec::with_capacity(payload.len());
        let mut buf = [0u8; 1024];
        while received.len() < payload.len() {
            let n = read_with_timeout(&b, &mut buf).await;
            assert!(n > 0, "stream ended early at {} bytes", received.len());
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_fin_teardown_both_sides() {
        let (a_tx, a_in_rx, b_tx, b_in_rx, syn_rx) = loopback();
        let a = UtpStream::outgoing(test_addr(), 7002, a_tx, a_in_rx, quick_config());

        let accept_side = async {
            let syn = syn_rx.await.unwrap();
            let b = UtpStream::incoming(test_addr(), &syn, b_tx, b_in_rx, quick_config());
            b.accept().await.unwrap();
            b
        };
        let (connected, b) = tokio::join!(a.connect(), accept_side);
        connected.unwrap();

        a.write(b"last words").await.unwrap();
        a.shutdown().await.unwrap();

        // reader drains the data, then sees end of stream
        let mut buf = [0u8; 32];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"last words");
        let n = read_with_timeout(&b, &mut buf).await;
        assert_eq!(n, 0);

        b.shutdown().await.unwrap();

        let wait = Duration::from_secs(5);
        let a_state = tokio::time::timeout(wait, a.closed()).await.unwrap();
        let b_state = tokio::time::timeout(wait, b.closed()).await.unwrap();
        assert_eq!(a_state, ConnectionState::Closed);
        assert_eq!(b_state, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_peer() {
        let (tx, _out) = mpsc::channel::<(Vec<u8>, SocketAddr)>(16);
        let (_in_tx, in_rx) = mpsc::channel::<Packet>(16);
        let config = UtpConfig {
            connect_timeout_secs: 1,
            retransmit_timeout_ms: 50,
            ..UtpConfig::default()
        };
        let a = UtpStream::outgoing(test_addr(), 7003, tx, in_rx, config);

        // either the connect deadline or the SYN retry limit fires first
        let err = a.connect().await.unwrap_err();
        assert!(matches!(
            err,
            UtpError::TimedOut
                | UtpError::Closed {
                    state: ConnectionState::TimedOut
                }
        ));
        assert_eq!(a.state(), ConnectionState::TimedOut);
    }

    async fn read_with_timeout(stream: &UtpStream, buf: &mut [u8]) -> usize {
        tokio::time::timeout(Duration::from_secs(5), stream.read(buf))
            .await
            .expect("read timed out")
            .expect("read failed")
    }
}
