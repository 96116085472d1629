//! Scenario tests for the per-connection buffer engine
//!
//! Each test walks the engine through a complete protocol situation
//! (wrap-around acknowledgments, reordering, FIN sequencing, window stalls)
//! using only the public API, the way a connection driver would.

use bytes::Bytes;
use gosh_utp::{
    extract_rtt, Buffer, ConnectionState, Event, Network, Packet, PacketType, RecvData, Result,
    UtpConfig, UtpError,
};

/// Network double recording every packet the engine hands it.
struct RecordingNet {
    sent: Vec<(u32, Packet)>,
    clock: u32,
    max_window: u32,
}

impl RecordingNet {
    fn new(max_window: u32) -> Self {
        Self {
            sent: Vec::new(),
            clock: 0,
            max_window,
        }
    }
}

impl Network for RecordingNet {
    fn send_pkt(&mut self, window: u32, packet: &Packet) -> Result<u32> {
        self.clock += 1_000;
        self.sent.push((window, packet.clone()));
        Ok(self.clock)
    }

    fn max_window_send(&self) -> u32 {
        self.max_window
    }

    fn handle_window_size(&mut self, _pkt_window: u32, win_sz: u32) -> u32 {
        win_sz
    }
}

fn engine(seq_no: u16, next_expected: u16) -> Buffer {
    Buffer::new(&UtpConfig::default(), 99, seq_no, next_expected)
}

fn data(seq_no: u16, ack_no: u16, payload: &'static [u8]) -> Packet {
    Packet::data(99, seq_no, ack_no, Bytes::from_static(payload))
}

fn handle(
    buf: &mut Buffer,
    net: &mut RecordingNet,
    pkt: &Packet,
) -> std::result::Result<Vec<Event>, UtpError> {
    buf.handle_packet(ConnectionState::Connected, pkt, 0, net)
        .map(|(events, _)| events)
}

fn has_ack(events: &[Event]) -> bool {
    events.iter().any(|e| matches!(e, Event::SendAck))
}

// =============================================================================
// Wrap-around acknowledgments
// =============================================================================

#[test]
fn wraparound_ack_prunes_across_seq_zero() {
    let mut buf = engine(65533, 10);
    let mut net = RecordingNet::new(1_000_000);

    // eight packets in flight: 65533, 65534, 65535, 0, 1, 2, 3, 4
    for _ in 0..8 {
        buf.send_packet(PacketType::Data, Bytes::from_static(b"x"), &mut net)
            .unwrap();
    }
    assert_eq!(buf.seq_no(), 5);

    // the peer acknowledges everything through sequence 1
    let events = handle(&mut buf, &mut net, &Packet::state(99, 9, 1)).unwrap();

    assert_eq!(buf.unacked_count(), 3);
    let acked = events
        .iter()
        .find_map(|e| match e {
            Event::Acked(list) => Some(list.iter().map(|w| w.packet.seq_no).collect::<Vec<_>>()),
            _ => None,
        })
        .expect("acked event");
    assert_eq!(acked.len(), 5);
    for seq in [65533u16, 65534, 65535, 0, 1] {
        assert!(acked.contains(&seq), "sequence {} should be acked", seq);
    }
    assert!(events.iter().any(|e| matches!(e, Event::DataInflight)));
}

// =============================================================================
// Reordering
// =============================================================================

#[test]
fn reorder_then_drain_in_sequence() {
    let mut buf = engine(1, 10);
    let mut net = RecordingNet::new(1_000_000);

    for (seq, payload) in [(12u16, b"C" as &[u8]), (11, b"B"), (10, b"A")] {
        let pkt = Packet::data(99, seq, 0, Bytes::copy_from_slice(payload));
        let events = handle(&mut buf, &mut net, &pkt).unwrap();
        assert!(has_ack(&events), "seq {} should schedule an ack", seq);
    }

    assert_eq!(buf.next_expected_seq_no(), 13);
    assert_eq!(buf.reorder_count(), 0);
    match buf.draining_receive(3) {
        RecvData::Exact(bytes) => assert_eq!(&bytes[..], b"ABC"),
        other => panic!("expected three ordered bytes, got {:?}", other),
    }
}

#[test]
fn applying_a_packet_twice_only_forces_an_ack() {
    let mut buf = engine(1, 10);
    let mut net = RecordingNet::new(1_000_000);
    let pkt = data(11, 0, b"B");

    handle(&mut buf, &mut net, &pkt).unwrap();
    let reorder = buf.reorder_count();
    let next = buf.next_expected_seq_no();

    // same packet again: no state change, but the lost ack is repeated
    let events = handle(&mut buf, &mut net, &pkt).unwrap();
    assert!(has_ack(&events));
    assert_eq!(buf.reorder_count(), reorder);
    assert_eq!(buf.next_expected_seq_no(), next);
}

// =============================================================================
// Far-future rejection
// =============================================================================

#[test]
fn far_future_sequence_rejected_without_side_effects() {
    let mut buf = engine(1, 100);
    let mut net = RecordingNet::new(1_000_000);

    let err = handle(&mut buf, &mut net, &data(700, 0, b"way ahead")).unwrap_err();
    assert!(matches!(
        err,
        UtpError::FarInFuture {
            seq_no: 700,
            expected: 100
        }
    ));
    assert_eq!(buf.reorder_count(), 0);
    assert_eq!(buf.recv_available(), 0);
    assert_eq!(buf.next_expected_seq_no(), 100);
}

// =============================================================================
// FIN sequencing
// =============================================================================

#[test]
fn fin_waits_for_the_data_before_it() {
    let mut buf = engine(1, 50);
    let mut net = RecordingNet::new(1_000_000);

    // the FIN at sequence 52 arrives before the data at 50 and 51
    let fin = Packet::fin(99, 52, 0);
    let events = handle(&mut buf, &mut net, &fin).unwrap();
    assert!(has_ack(&events), "a fin is always acked");
    assert!(!events.iter().any(|e| matches!(e, Event::GotFin)));

    let events = handle(&mut buf, &mut net, &data(50, 0, b"X")).unwrap();
    assert!(!events.iter().any(|e| matches!(e, Event::GotFin)));

    // the second payload closes the gap: data first, then the FIN surfaces
    let events = handle(&mut buf, &mut net, &data(51, 0, b"Y")).unwrap();
    assert!(events.iter().any(|e| matches!(e, Event::GotFin)));
    assert!(has_ack(&events));

    assert_eq!(buf.next_expected_seq_no(), 53);
    match buf.draining_receive(2) {
        RecvData::Exact(bytes) => assert_eq!(&bytes[..], b"XY"),
        other => panic!("expected both payloads, got {:?}", other),
    }
}

// =============================================================================
// Zero-window stall and reopen
// =============================================================================

#[test]
fn zero_window_reopens_after_the_reader_drains() {
    let config = UtpConfig {
        recv_buf_bytes: 4096,
        ..UtpConfig::default()
    };
    let mut buf = Buffer::new(&config, 99, 1, 10);
    let mut net = RecordingNet::new(1_000_000);

    // four kilobytes arrive and nobody reads: the window closes
    for i in 0..4u16 {
        let pkt = Packet::data(99, 10 + i, 0, Bytes::from(vec![0u8; 1024]));
        handle(&mut buf, &mut net, &pkt).unwrap();
    }
    assert_eq!(buf.advertised_window(), 0);

    let old_window = buf.advertised_window();
    match buf.draining_receive(2000) {
        RecvData::Exact(bytes) => assert_eq!(bytes.len(), 2000),
        other => panic!("expected a full read, got {:?}", other),
    }
    let new_window = buf.advertised_window();

    assert_eq!(new_window, 2000);
    assert!(gosh_utp::view_zerowindow_reopen(old_window, new_window));
}

// =============================================================================
// Karn's algorithm
// =============================================================================

#[test]
fn retransmitted_packets_never_produce_rtt_samples() {
    let mut buf = engine(1, 10);
    let mut net = RecordingNet::new(1_000_000);

    buf.send_packet(PacketType::Data, Bytes::from_static(b"p"), &mut net)
        .unwrap();
    buf.retransmit_packet(&mut net).unwrap();
    assert_eq!(net.sent.len(), 2);

    let events = handle(&mut buf, &mut net, &Packet::state(99, 9, 1)).unwrap();
    let acked = events
        .iter()
        .find_map(|e| match e {
            Event::Acked(list) => Some(list.clone()),
            _ => None,
        })
        .expect("acked event");

    assert_eq!(acked.len(), 1);
    assert_eq!(acked[0].transmissions, 2);
    assert!(extract_rtt(&acked).is_empty());
    assert!(events.iter().any(|e| matches!(e, Event::AllAcked)));
}

// =============================================================================
// Advertised window bookkeeping
// =============================================================================

#[test]
fn advertised_window_accounts_for_buffered_bytes() {
    let mut buf = engine(1, 10);
    let mut net = RecordingNet::new(1_000_000);
    let capacity = UtpConfig::default().recv_buf_bytes;

    handle(&mut buf, &mut net, &data(10, 0, b"0123456789")).unwrap();
    handle(&mut buf, &mut net, &data(11, 0, b"0123456789")).unwrap();

    assert_eq!(buf.advertised_window() + buf.recv_available(), capacity);

    buf.dequeue().unwrap();
    assert_eq!(buf.advertised_window() + buf.recv_available(), capacity);
}
