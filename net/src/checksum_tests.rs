use crate::checksum::{self, Checksum};
use crate::types::{IpProtocol, Ipv4Addr};

#[test]
fn first_byte_lands_in_high_half() {
    let mut sum = Checksum::new();
    sum.push(0x12);
    assert_eq!(sum.pair(), (0x12, 0x00));
    sum.push(0x34);
    assert_eq!(sum.pair(), (0x12, 0x34));
}

#[test]
fn end_around_carry_folds_back() {
    // 0xFFFF + 0x0002 wraps to 0x0002 in one's-complement arithmetic.
    let mut sum = Checksum::new();
    sum.push_slice(&[0xff, 0xff, 0x00, 0x02]);
    assert_eq!(sum.pair(), (0x00, 0x02));
    assert_eq!(sum.value(), !0x0002u16);
}

#[test]
fn known_ipv4_header_validates() {
    // Header from RFC 1071-style worked example, checksum zeroed.
    let mut header = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
        0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];
    let mut sum = Checksum::new();
    sum.push_slice(&header);
    let value = sum.value();
    assert_eq!(value, 0xb861);

    // Recomputing with the checksum field in place lands on all-ones.
    header[10..12].copy_from_slice(&value.to_be_bytes());
    let mut verify = Checksum::new();
    verify.push_slice(&header);
    assert!(verify.is_valid(), "pair is (0xFF, 0xFF) for a valid header");
}

#[test]
fn checksum_round_trip_arbitrary_region() {
    let region: Vec<u8> = (0u16..64).map(|i| (i * 7 + 3) as u8).collect();
    let mut sum = Checksum::new();
    sum.push_slice(&region);
    let value = sum.value();

    let mut verify = Checksum::new();
    verify.push_slice(&region);
    verify.push_slice(&value.to_be_bytes());
    assert!(verify.is_valid());
}

#[test]
fn odd_length_pads_with_single_zero() {
    let region = [0xde, 0xad, 0xbe];
    let mut sum = Checksum::new();
    sum.push_padded(&region);
    let value = sum.value();

    // Explicit pad produces the same result.
    let mut explicit = Checksum::new();
    explicit.push_slice(&[0xde, 0xad, 0xbe, 0x00]);
    assert_eq!(value, explicit.value());

    // And the padded region still validates round-trip.
    let mut verify = Checksum::new();
    verify.push_padded(&region);
    verify.push_slice(&value.to_be_bytes());
    assert!(verify.is_valid());
}

#[test]
fn transport_includes_pseudo_header() {
    let src = Ipv4Addr([10, 0, 0, 1]);
    let dst = Ipv4Addr([10, 0, 0, 2]);
    let segment = [0x04, 0x00, 0x00, 0x35, 0x00, 0x0a, 0x00, 0x00, 0x41, 0x42];

    // Independent word-at-a-time computation.
    let mut words: Vec<u16> = segment
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .collect();
    words.push(u16::from_be_bytes([10, 0]));
    words.push(u16::from_be_bytes([0, 1]));
    words.push(u16::from_be_bytes([10, 0]));
    words.push(u16::from_be_bytes([0, 2]));
    words.push(IpProtocol::Udp.as_u8() as u16);
    words.push(segment.len() as u16);
    let mut total: u32 = words.iter().map(|&w| w as u32).sum();
    while total >> 16 != 0 {
        total = (total & 0xffff) + (total >> 16);
    }
    let expected = !(total as u16);

    assert_eq!(
        checksum::transport(src, dst, IpProtocol::Udp, &segment),
        expected
    );
}
