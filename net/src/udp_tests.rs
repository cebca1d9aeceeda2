use crate::checksum::Checksum;
use crate::pool::{self, ProtocolTag};
use crate::testutil::{self, drain, feed};
use crate::types::{IfaceId, IpProtocol, Ipv4Addr, NetError, Port};
use crate::udp;

const PEER: Ipv4Addr = Ipv4Addr([192, 0, 2, 1]);
const LOCAL: Ipv4Addr = Ipv4Addr([192, 0, 2, 10]);

#[test]
fn open_rejects_a_busy_socket() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    udp::open(0, Port(2000), PEER, Port(7), IfaceId::ETH).unwrap();
    assert_eq!(
        udp::open(0, Port(2001), PEER, Port(7), IfaceId::ETH),
        Err(NetError::AlreadyConnected)
    );
    udp::close(0);
    udp::open(0, Port(2001), PEER, Port(7), IfaceId::ETH).unwrap();
    udp::close(0);
}

#[test]
fn out_of_range_socket_is_an_error() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    assert_eq!(
        udp::open(64, Port(2000), PEER, Port(7), IfaceId::ETH),
        Err(NetError::InvalidArgument)
    );
    assert!(udp::read(64).is_none());
}

#[test]
fn datagram_is_delivered_to_the_bound_port() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    udp::open(0, Port(5000), Ipv4Addr::UNSPECIFIED, Port(0), IfaceId::ETH).unwrap();
    let frame = testutil::udp_frame(PEER, LOCAL, 6000, 5000, b"hello");
    feed(IfaceId::ETH, ProtocolTag::Ip, &frame);

    assert!(udp::has_data(0));
    assert!(udp::listen(0, Port(5000), 0), "data already queued");

    let id = udp::read(0).expect("datagram queued");
    pool::with_mut(id, |b| {
        assert_eq!(b.payload(), b"hello", "UDP header peeled");
    });
    pool::release(id);

    assert!(udp::read(0).is_none(), "slot cleared by the read");
    assert!(pool::invariant_holds());
    udp::close(0);
}

#[test]
fn second_datagram_is_dropped_until_read() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    udp::open(0, Port(5000), Ipv4Addr::UNSPECIFIED, Port(0), IfaceId::ETH).unwrap();
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::udp_frame(PEER, LOCAL, 6000, 5000, b"first"),
    );
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::udp_frame(PEER, LOCAL, 6000, 5000, b"second"),
    );

    let id = udp::read(0).unwrap();
    pool::with_mut(id, |b| assert_eq!(b.payload(), b"first"));
    pool::release(id);
    assert!(udp::read(0).is_none(), "second arrival was dropped");

    // Once the slot is free, delivery resumes.
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::udp_frame(PEER, LOCAL, 6000, 5000, b"third"),
    );
    let id = udp::read(0).unwrap();
    pool::with_mut(id, |b| assert_eq!(b.payload(), b"third"));
    pool::release(id);
    udp::close(0);
}

#[test]
fn unbound_port_is_dropped_silently() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::udp_frame(PEER, LOCAL, 6000, 4444, b"nobody"),
    );
    assert!(pool::invariant_holds());
    assert_eq!(pool::free_count(), crate::config::NUM_BUFFERS);
}

#[test]
fn send_emits_length_and_pseudo_header_checksum() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();

    udp::open(0, Port(3333), PEER, Port(4444), IfaceId::ETH).unwrap();
    let id = udp::new(0).expect("datagram allocated");
    pool::with_mut(id, |b| b.write_str("ping!"));
    udp::send(id).unwrap();
    pool::release(id);

    let sent = drain(&log);
    assert_eq!(sent.len(), 1);
    let frame = &sent[0].frame;
    assert_eq!(frame[9], IpProtocol::Udp.as_u8());

    let seg = &frame[20..];
    assert_eq!(u16::from_be_bytes([seg[0], seg[1]]), 3333);
    assert_eq!(u16::from_be_bytes([seg[2], seg[3]]), 4444);
    assert_eq!(u16::from_be_bytes([seg[4], seg[5]]) as usize, seg.len());
    assert_ne!(&seg[6..8], &[0, 0], "checksum always sent");

    // Verify with the pseudo-header folded in.
    let mut sum = Checksum::new();
    sum.push_padded(seg);
    sum.push_slice(LOCAL.as_bytes());
    sum.push_slice(PEER.as_bytes());
    sum.push(0);
    sum.push(IpProtocol::Udp.as_u8());
    sum.push((seg.len() >> 8) as u8);
    sum.push(seg.len() as u8);
    assert!(sum.is_valid());
    udp::close(0);
}

#[test]
fn parse_records_the_sender() {
    let _guard = testutil::serial();
    let log = testutil::fresh_stack();

    udp::open(0, Port(5000), Ipv4Addr::UNSPECIFIED, Port(0), IfaceId::ETH).unwrap();
    feed(
        IfaceId::ETH,
        ProtocolTag::Ip,
        &testutil::udp_frame(PEER, LOCAL, 6001, 5000, b"q"),
    );
    let id = udp::read(0).unwrap();
    pool::release(id);

    // A reply datagram goes back to the recorded peer and port.
    let id = udp::new(0).unwrap();
    pool::with_mut(id, |b| b.write_str("r"));
    udp::send(id).unwrap();
    pool::release(id);

    let sent = drain(&log);
    let frame = &sent[0].frame;
    assert_eq!(&frame[16..20], PEER.as_bytes());
    let seg = &frame[20..];
    assert_eq!(u16::from_be_bytes([seg[2], seg[3]]), 6001);
    udp::close(0);
}

#[test]
fn listen_times_out_when_nothing_arrives() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    assert!(!udp::listen(0, Port(5005), 30));
    udp::close(0);
}

#[test]
fn ephemeral_ports_avoid_enabled_sockets() {
    let _guard = testutil::serial();
    testutil::fresh_stack();

    udp::open(0, Port(1024), PEER, Port(7), IfaceId::ETH).unwrap();
    let port = udp::ephemeral_port();
    assert_ne!(port, Port(1024));
    assert!(port.as_u16() >= 1024 && port.as_u16() <= 32767);

    let next = udp::ephemeral_port();
    assert_ne!(next, port, "allocator advances");
    udp::close(0);
}
