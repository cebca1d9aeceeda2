use std::time::{Duration, Instant};

use crate::pool::{self, ProtocolTag};
use crate::tcp;
use crate::testutil::{self, drain, feed, tcp_fields, wait_tx, TxLog};
use crate::types::{IfaceId, Ipv4Addr, NetError, Port};

const PEER: Ipv4Addr = Ipv4Addr([93, 184, 216, 34]);
const LOCAL: Ipv4Addr = Ipv4Addr([192, 0, 2, 10]);

const FIN: u8 = 0x01;
const SYN: u8 = 0x02;
const RST: u8 = 0x04;
const PSH: u8 = 0x08;
const ACK: u8 = 0x10;

/// Active-open socket 0 to PEER:25 from port 1024 and play the
/// server side of the handshake with ISS 500. Returns our ISN.
fn establish(log: &TxLog) -> u32 {
    let opener = std::thread::spawn(|| tcp::open(0, Port(1024), PEER, Port(25), IfaceId::ETH));

    let syn = wait_tx(log, 2000).expect("SYN transmitted");
    let f = tcp_fields(&syn.frame);
    assert_eq!(f.flags, SYN);
    assert_eq!(f.src_port, 1024);
    assert_eq!(f.dst_port, 25);
    assert_eq!(f.window, 512, "advertised window is one MSS");
    let isn = f.seq;

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 500, isn.wrapping_add(1), SYN | ACK, &[]),
    );

    let ack = wait_tx(log, 2000).expect("final handshake ACK");
    let f = tcp_fields(&ack.frame);
    assert_eq!(f.flags, ACK);
    assert_eq!(f.seq, isn.wrapping_add(1));
    assert_eq!(f.ack, 501);

    opener.join().unwrap().expect("open succeeds");
    assert!(tcp::is_open(0));
    drain(log);
    isn
}

#[test]
fn three_way_handshake() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    establish(&log);
}

#[test]
fn handshake_rejected_by_rst() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();

    let opener = std::thread::spawn(|| tcp::open(0, Port(1024), PEER, Port(25), IfaceId::ETH));
    let syn = wait_tx(&log, 2000).expect("SYN transmitted");
    let isn = tcp_fields(&syn.frame).seq;

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 0, isn.wrapping_add(1), RST | ACK, &[]),
    );

    assert_eq!(opener.join().unwrap(), Err(NetError::ConnectionReset));
    assert!(!tcp::is_open(0));
}

#[test]
fn data_send_advances_the_sequence() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    let sender = std::thread::spawn(|| tcp::send_text(0, "HELLO\r\n"));
    let seg = wait_tx(&log, 2000).expect("data segment");
    let f = tcp_fields(&seg.frame);
    assert_eq!(f.flags, ACK | PSH);
    assert_eq!(f.seq, isn.wrapping_add(1));
    assert_eq!(f.ack, 501);
    assert_eq!(f.payload, b"HELLO\r\n");

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(8), ACK, &[]),
    );
    sender.join().unwrap().expect("send acknowledged");

    // The acknowledged length is reflected in the next segment.
    let sender = std::thread::spawn(|| tcp::send_text(0, "X"));
    let seg = wait_tx(&log, 2000).expect("second segment");
    let f = tcp_fields(&seg.frame);
    assert_eq!(f.seq, isn.wrapping_add(8), "local_seq advanced by 7");

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(9), ACK, &[]),
    );
    sender.join().unwrap().unwrap();
}

#[test]
fn rst_forces_the_socket_empty() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    establish(&log);

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, 0, RST, &[]),
    );

    assert!(!tcp::is_open(0));
    assert_eq!(
        tcp::send_text(0, "anyone?"),
        Err(NetError::NotConnected),
        "send fails after the reset"
    );
}

#[test]
fn stale_acknowledgement_is_dropped() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    // An ACK that does not name pending_seq is ignored wholesale:
    // the data it carries is not delivered.
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(77), ACK | PSH, b"bad"),
    );
    assert!(!tcp::has_data(0));
    assert!(drain(&log).is_empty());
}

#[test]
fn sequence_mismatch_triggers_a_corrective_ack() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    // Data beyond the expected sequence number: dropped, and the
    // expected number is restated in a bare ACK.
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 601, isn.wrapping_add(1), ACK | PSH, b"early"),
    );
    assert!(!tcp::has_data(0));

    let correction = wait_tx(&log, 2000).expect("corrective ACK");
    let f = tcp_fields(&correction.frame);
    assert_eq!(f.flags, ACK);
    assert_eq!(f.ack, 501, "restates the expected sequence number");
}

#[test]
fn data_is_acknowledged_when_the_application_reads() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(1), ACK | PSH, b"hi"),
    );
    assert!(tcp::has_data(0));
    assert!(drain(&log).is_empty(), "no ACK before the read");

    let id = tcp::read(0, 100).expect("data pending");
    pool::with_mut(id, |b| assert_eq!(b.payload(), b"hi"));
    pool::release(id);

    let ack = wait_tx(&log, 2000).expect("read acknowledges");
    let f = tcp_fields(&ack.frame);
    assert_eq!(f.flags, ACK);
    assert_eq!(f.ack, 503);
    assert!(!tcp::has_data(0));
}

#[test]
fn new_data_is_dropped_while_a_buffer_is_held() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(1), ACK | PSH, b"hi"),
    );
    // The follow-up segment finds the slot occupied and vanishes.
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 503, isn.wrapping_add(1), ACK | PSH, b"yo"),
    );
    assert!(drain(&log).is_empty());

    let id = tcp::read(0, 100).unwrap();
    pool::with_mut(id, |b| assert_eq!(b.payload(), b"hi"));
    pool::release(id);
    drain(&log);

    // The peer's retransmission lands once the slot is free.
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 503, isn.wrapping_add(1), ACK | PSH, b"yo"),
    );
    let id = tcp::read(0, 100).unwrap();
    pool::with_mut(id, |b| assert_eq!(b.payload(), b"yo"));
    pool::release(id);
    assert!(pool::invariant_holds());
}

#[test]
fn passive_open_completes_the_handshake() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();

    let listener = std::thread::spawn(|| tcp::listen(1, Port(8080)));
    while !tcp::is_open(1) {
        std::thread::sleep(Duration::from_millis(5));
    }

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 40000, 8080, 500, 0, SYN, &[]),
    );

    let synack = wait_tx(&log, 2000).expect("SYN|ACK answered");
    let f = tcp_fields(&synack.frame);
    assert_eq!(f.flags, SYN | ACK);
    assert_eq!(f.ack, 501, "SYN consumed one sequence number");
    let isn = f.seq;

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 40000, 8080, 501, isn.wrapping_add(1), ACK, &[]),
    );

    listener.join().unwrap().expect("listen accepts");
    assert!(tcp::is_open(1));
    let _ = tcp::close(1); // tidy up; the peer is gone, expect a timeout
}

#[test]
fn active_close_exchanges_fins() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    let closer = std::thread::spawn(|| tcp::close(0));

    let finack = wait_tx(&log, 2000).expect("FIN|ACK transmitted");
    let f = tcp_fields(&finack.frame);
    assert_eq!(f.flags, FIN | ACK);
    assert_eq!(f.seq, isn.wrapping_add(1));

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(2), FIN | ACK, &[]),
    );

    let last = wait_tx(&log, 2000).expect("closing ACK");
    let f = tcp_fields(&last.frame);
    assert_eq!(f.flags, ACK);
    assert_eq!(f.ack, 502, "peer FIN consumed one sequence number");

    closer.join().unwrap().expect("close completes");
    assert!(!tcp::is_open(0));
}

#[test]
fn peer_initiated_close_is_answered_immediately() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    let isn = establish(&log);

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::tcp_frame(PEER, LOCAL, 25, 1024, 501, isn.wrapping_add(1), FIN | ACK, &[]),
    );

    let answer = wait_tx(&log, 2000).expect("FIN|ACK answered without the app");
    let f = tcp_fields(&answer.frame);
    assert_eq!(f.flags, FIN | ACK);
    assert_eq!(f.ack, 502);
    assert!(!tcp::is_open(0), "socket closed locally");
}

#[test]
fn open_to_a_silent_host_times_out() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();

    let start = Instant::now();
    let result = tcp::open(0, Port(2000), PEER, Port(9), IfaceId::ETH);
    let elapsed = start.elapsed();

    assert_eq!(result, Err(NetError::TimedOut));
    assert!(
        elapsed >= Duration::from_millis(2300),
        "five 500 ms attempts: {elapsed:?}"
    );
    assert!(elapsed < Duration::from_secs(5), "fails promptly: {elapsed:?}");
    assert_eq!(drain(&log).len(), 5, "one SYN per retry");
    assert!(!tcp::is_open(0));
}

#[test]
fn ephemeral_ports_skip_listening_sockets_only() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    establish(&log);

    // Socket 0 is connected (not listening) on 1024; the allocator
    // only steers around listeners.
    assert_eq!(tcp::ephemeral_port(), Port(1024));
    assert_eq!(tcp::ephemeral_port(), Port(1025));
}

#[test]
fn send_requires_an_open_connection() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    assert_eq!(tcp::send_text(0, "x"), Err(NetError::NotConnected));
}

#[test]
fn reset_sends_rst_and_clears() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();
    establish(&log);

    tcp::reset(0);
    let rst = wait_tx(&log, 2000).expect("RST|ACK emitted");
    let f = tcp_fields(&rst.frame);
    assert_eq!(f.flags, RST | ACK);
    assert!(!tcp::is_open(0));
}
