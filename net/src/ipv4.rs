//! IPv4 datagram layer.
//!
//! Datagram framing and validation only — no fragmentation or
//! reassembly; a datagram is rejected rather than reassembled. Sends
//! always emit IHL 5, TOS max-throughput, TTL 64, DF/MF clear.
//!
//! Inbound, [`parse`] validates the header and retags the buffer for
//! ICMP, UDP or TCP so the dispatcher promotes it in the same pass.

use core::sync::atomic::{AtomicU16, Ordering};

use log::debug;

use crate::checksum::Checksum;
use crate::iface;
use crate::pool::{self, BufId, Buffer, ProtocolTag};
use crate::types::{EtherType, IfaceId, IpProtocol, Ipv4Addr, NetError};

pub const IPV4_HEADER_LEN: usize = 20;

/// IP type-of-service on everything we send.
pub const TOS_MAX_THROUGHPUT: u8 = 0x08;

/// Time-to-live on everything we send.
pub const TTL: u8 = 64;

/// Monotonically increasing datagram id.
static DATAGRAM_ID: AtomicU16 = AtomicU16::new(0);

fn next_id() -> u16 {
    DATAGRAM_ID.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Construction
// =============================================================================

/// Allocate a datagram to `dst` with room for `capacity` payload
/// bytes and return it positioned for the next layer.
///
/// The header is written with protocol = TCP; other layers patch the
/// protocol field via [`set_protocol`].
pub fn datagram_new(dst: Ipv4Addr, capacity: usize, iface: IfaceId) -> Option<BufId> {
    let id = pool::alloc(IPV4_HEADER_LEN + capacity)?;
    pool::with_mut(id, |b| {
        b.set_iface(iface);
        b.write_u8(0x45); // version 4, IHL 5
        b.write_u8(TOS_MAX_THROUGHPUT);
        b.write_u16(0); // total length, patched on send
        b.write_u16(next_id());
        b.write_u16(0); // no fragmentation
        b.write_u8(TTL);
        b.write_u8(IpProtocol::Tcp.as_u8());
        b.write_u16(0); // checksum, patched on send
        b.write_ip(iface::ip_local(iface));
        b.write_ip(dst);
        b.pull_front(IPV4_HEADER_LEN);
    });
    Some(id)
}

/// Patch the protocol field of a datagram built by [`datagram_new`].
pub(crate) fn set_protocol(b: &mut Buffer, proto: IpProtocol) {
    b.frame_mut()[9] = proto.as_u8();
}

/// Source address of a received datagram (IP header at frame origin).
pub(crate) fn source_addr(b: &Buffer) -> Ipv4Addr {
    let f = b.frame();
    Ipv4Addr([f[12], f[13], f[14], f[15]])
}

/// Destination address of a datagram (IP header at frame origin).
pub(crate) fn dest_addr(b: &Buffer) -> Ipv4Addr {
    let f = b.frame();
    Ipv4Addr([f[16], f[17], f[18], f[19]])
}

/// Rewrite a received datagram to be sent back to its sender: fresh
/// id, cleared checksum, source and destination swapped in place.
pub fn answer(b: &mut Buffer) {
    let id = next_id();
    let f = b.frame_mut();
    f[4..6].copy_from_slice(&id.to_be_bytes());
    f[10] = 0;
    f[11] = 0;
    for i in 0..4 {
        f.swap(12 + i, 16 + i);
    }
}

// =============================================================================
// Transmit
// =============================================================================

/// A finalized datagram ready for the link driver.
pub(crate) struct OutFrame {
    pub iface: IfaceId,
    pub next_hop: Ipv4Addr,
    pub bytes: Vec<u8>,
}

/// Finalize the datagram in place: rewind to the frame origin, patch
/// total length and header checksum, and copy the wire bytes out.
/// The buffer's payload view is restored before returning, so the
/// same buffer can be finalized again for a retransmission.
pub(crate) fn finalize(b: &mut Buffer) -> OutFrame {
    let off = b.data_offset();
    b.push_front(off);
    let total = b.size() as u16;

    {
        let f = b.frame_mut();
        f[2..4].copy_from_slice(&total.to_be_bytes());
        f[10] = 0;
        f[11] = 0;
    }
    let ihl = ((b.frame()[0] & 0x0f) as usize) * 4;
    let mut sum = Checksum::new();
    sum.push_slice(&b.frame()[..ihl]);
    let value = sum.value();
    b.frame_mut()[10..12].copy_from_slice(&value.to_be_bytes());

    let iface = b.iface();
    let dst = dest_addr(b);
    let frame = OutFrame {
        iface,
        next_hop: iface::next_hop(iface, dst),
        bytes: b.payload().to_vec(),
    };
    b.pull_front(off);
    frame
}

/// Hand a finalized datagram to its link driver.
pub(crate) fn send_frame(f: &OutFrame) -> Result<(), NetError> {
    iface::transmit(f.iface, f.next_hop, EtherType::Ipv4, &f.bytes)
}

/// Finalize and transmit a buffer the caller already holds (parser
/// context).
pub(crate) fn transmit(b: &mut Buffer) -> Result<(), NetError> {
    let frame = finalize(b);
    send_frame(&frame)
}

/// Finalize and transmit a pooled datagram (application context).
///
/// The driver is invoked after the slot lock is dropped.
pub fn send(id: BufId) -> Result<(), NetError> {
    let frame = pool::with_mut(id, finalize).ok_or(NetError::InvalidArgument)?;
    send_frame(&frame)
}

// =============================================================================
// Parse
// =============================================================================

/// Validate a received datagram and promote it to its transport
/// layer. Drops are silent beyond a debug line.
pub(crate) fn parse(_id: BufId, b: &mut Buffer) {
    {
        let p = b.payload();
        if p.len() < IPV4_HEADER_LEN {
            debug!("ipv4: datagram too short ({})", p.len());
            return;
        }
        if p[0] >> 4 != 4 {
            debug!("ipv4: bad version {}", p[0] >> 4);
            return;
        }
    }

    // Trim link padding down to the declared total length.
    let declared = u16::from_be_bytes([b.payload()[2], b.payload()[3]]) as usize;
    if b.size() < declared {
        debug!("ipv4: declared length {} > received {}", declared, b.size());
        return;
    }
    b.set_size(declared);

    let ihl = ((b.payload()[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || b.payload().len() < ihl {
        debug!("ipv4: bad IHL {}", ihl);
        return;
    }

    if !b.iface().is_valid() {
        return;
    }

    let mut sum = Checksum::new();
    sum.push_slice(&b.payload()[..ihl]);
    if !sum.is_valid() {
        debug!("ipv4: bad header checksum");
        return;
    }

    let dst = {
        let p = b.payload();
        Ipv4Addr([p[16], p[17], p[18], p[19]])
    };
    if !dst.is_broadcast() && dst != iface::ip_local(b.iface()) {
        return;
    }

    b.pull_front(ihl);

    let proto = b.frame()[9];
    let tag = match IpProtocol::from_u8(proto) {
        Some(IpProtocol::Tcp) => ProtocolTag::Tcp,
        Some(IpProtocol::Udp) => ProtocolTag::Udp,
        Some(IpProtocol::Icmp) => ProtocolTag::Icmp,
        None => {
            debug!("ipv4: unknown protocol {}, dropping", proto);
            return;
        }
    };
    b.retain();
    b.set_tag(tag);
}
