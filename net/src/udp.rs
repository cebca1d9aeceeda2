//! UDP — connectionless sockets with a single receive slot.
//!
//! Fixed socket array. Each socket holds at most one undelivered
//! datagram; a second arrival before the application reads is dropped
//! silently. The checksum is always sent, pseudo-header included.

use log::debug;
use spin::Mutex;
use tern_lib::Signal;

use crate::config::{MAX_LOCAL_PORT, MAX_SOCKETS_UDP, MIN_LOCAL_PORT, MSS};
use crate::ipv4;
use crate::pool::{self, BufId, Buffer};
use crate::types::{IfaceId, IpProtocol, Ipv4Addr, NetError, Port};
use crate::checksum;

pub const UDP_HEADER_LEN: usize = 8;

// =============================================================================
// Socket table
// =============================================================================

#[derive(Clone, Copy)]
struct UdpSocket {
    peer: Ipv4Addr,
    remote_port: Port,
    local_port: Port,
    iface: IfaceId,
    held: Option<BufId>,
    enabled: bool,
}

impl UdpSocket {
    const fn closed() -> Self {
        Self {
            peer: Ipv4Addr::UNSPECIFIED,
            remote_port: Port(0),
            local_port: Port(0),
            iface: IfaceId::ETH,
            held: None,
            enabled: false,
        }
    }
}

struct UdpTable {
    sockets: [UdpSocket; MAX_SOCKETS_UDP],
    next_port: u16,
}

static UDP: Mutex<UdpTable> = Mutex::new(UdpTable {
    sockets: [const { UdpSocket::closed() }; MAX_SOCKETS_UDP],
    next_port: MIN_LOCAL_PORT,
});

static SIGNALS: [Signal; MAX_SOCKETS_UDP] = [const { Signal::new() }; MAX_SOCKETS_UDP];

fn check(sock: usize) -> Result<(), NetError> {
    if sock < MAX_SOCKETS_UDP {
        Ok(())
    } else {
        Err(NetError::InvalidArgument)
    }
}

// =============================================================================
// Socket API
// =============================================================================

/// Bind a socket to a remote endpoint.
pub fn open(
    sock: usize,
    local_port: Port,
    peer: Ipv4Addr,
    remote_port: Port,
    iface: IfaceId,
) -> Result<(), NetError> {
    check(sock)?;
    let mut t = UDP.lock();
    let s = &mut t.sockets[sock];
    if s.enabled {
        return Err(NetError::AlreadyConnected);
    }
    let stale = s.held.take();
    s.peer = peer;
    s.remote_port = remote_port;
    s.local_port = local_port;
    s.iface = iface;
    s.enabled = true;
    drop(t);
    if let Some(id) = stale {
        pool::release(id);
    }
    Ok(())
}

/// Disable a socket, dropping any pending datagram.
pub fn close(sock: usize) {
    if check(sock).is_err() {
        return;
    }
    let stale = {
        let mut t = UDP.lock();
        let s = &mut t.sockets[sock];
        s.enabled = false;
        s.local_port = Port(0);
        s.held.take()
    };
    if let Some(id) = stale {
        pool::release(id);
    }
}

/// Enable reception on `local_port` and wait for a datagram.
///
/// Returns immediately when one is already queued; otherwise blocks
/// for up to `timeout_ms`. True means [`read`] will yield a buffer.
pub fn listen(sock: usize, local_port: Port, timeout_ms: u64) -> bool {
    if check(sock).is_err() {
        return false;
    }
    {
        let mut t = UDP.lock();
        let s = &mut t.sockets[sock];
        if s.enabled && s.held.is_some() {
            return true;
        }
        s.local_port = local_port;
        s.enabled = true;
    }
    SIGNALS[sock].wait_timeout(timeout_ms)
}

/// Atomically take the held datagram, if any. The caller owns the
/// buffer reference and must release it after reading.
pub fn read(sock: usize) -> Option<BufId> {
    check(sock).ok()?;
    let mut t = UDP.lock();
    let s = &mut t.sockets[sock];
    if !s.enabled {
        return None;
    }
    s.held.take()
}

/// `true` if a datagram is queued on the socket.
pub fn has_data(sock: usize) -> bool {
    check(sock).is_ok() && UDP.lock().sockets[sock].held.is_some()
}

/// Allocate a datagram addressed to the socket's peer, positioned
/// past the UDP header.
pub fn new(sock: usize) -> Option<BufId> {
    check(sock).ok()?;
    let (peer, remote_port, local_port, dev) = {
        let t = UDP.lock();
        let s = &t.sockets[sock];
        (s.peer, s.remote_port, s.local_port, s.iface)
    };

    let id = ipv4::datagram_new(peer, MSS as usize, dev)?;
    pool::with_mut(id, |b| {
        ipv4::set_protocol(b, IpProtocol::Udp);
        b.write_u16(local_port.as_u16());
        b.write_u16(remote_port.as_u16());
        b.write_u16(0); // length, patched on send
        b.write_u16(0); // checksum, patched on send
        b.pull_front(UDP_HEADER_LEN);
    });
    Some(id)
}

/// Finalize a datagram built by [`new`] and hand it to IP: length,
/// pseudo-header checksum, transmit.
pub fn send(id: BufId) -> Result<(), NetError> {
    let frame = pool::with_mut(id, |b| {
        b.push_front(UDP_HEADER_LEN);
        let len = b.size() as u16;
        let src = ipv4::source_addr(b);
        let dst = ipv4::dest_addr(b);
        {
            let p = b.payload_mut();
            p[4..6].copy_from_slice(&len.to_be_bytes());
            p[6] = 0;
            p[7] = 0;
        }
        let mut value = checksum::transport(src, dst, IpProtocol::Udp, b.payload());
        // A computed zero is transmitted as all-ones; the checksum is
        // always sent.
        if value == 0 {
            value = 0xffff;
        }
        b.payload_mut()[6..8].copy_from_slice(&value.to_be_bytes());
        ipv4::finalize(b)
    })
    .ok_or(NetError::InvalidArgument)?;
    ipv4::send_frame(&frame)
}

/// Next unused ephemeral port in `[1024, 32767]`, skipping ports of
/// enabled sockets.
pub fn ephemeral_port() -> Port {
    let mut t = UDP.lock();
    let mut port = t.next_port;
    'search: loop {
        for s in t.sockets.iter() {
            if s.enabled && s.local_port.as_u16() == port {
                port = if port >= MAX_LOCAL_PORT {
                    MIN_LOCAL_PORT
                } else {
                    port + 1
                };
                continue 'search;
            }
        }
        break;
    }
    t.next_port = if port >= MAX_LOCAL_PORT {
        MIN_LOCAL_PORT
    } else {
        port + 1
    };
    Port(port)
}

/// Drop all sockets and their held buffers. For tests.
pub fn reset_all() {
    let held: Vec<BufId> = {
        let mut t = UDP.lock();
        let ids = t.sockets.iter_mut().filter_map(|s| s.held.take()).collect();
        for s in t.sockets.iter_mut() {
            *s = UdpSocket::closed();
        }
        t.next_port = MIN_LOCAL_PORT;
        ids
    };
    for id in held {
        pool::release(id);
    }
    for sig in SIGNALS.iter() {
        sig.clear();
    }
}

// =============================================================================
// Parse
// =============================================================================

/// Deliver an inbound datagram to the socket bound to its
/// destination port. Sockets are bound-only: any source matches.
pub(crate) fn parse(id: BufId, b: &mut Buffer) {
    if b.payload().len() < UDP_HEADER_LEN {
        return;
    }
    let src_port = Port::from_be_bytes([b.payload()[0], b.payload()[1]]);
    let dst_port = Port::from_be_bytes([b.payload()[2], b.payload()[3]]);

    let mut t = UDP.lock();
    let Some(idx) = t
        .sockets
        .iter()
        .position(|s| s.enabled && s.local_port == dst_port)
    else {
        debug!("udp: no socket for port {}, dropping", dst_port);
        return;
    };

    let s = &mut t.sockets[idx];
    if s.held.is_some() {
        // Single receive slot: the application must consume first.
        debug!("udp: socket {} busy, dropping", idx);
        return;
    }

    s.peer = ipv4::source_addr(b);
    s.remote_port = src_port;
    s.iface = b.iface();
    b.retain();
    b.pull_front(UDP_HEADER_LEN);
    s.held = Some(id);
    drop(t);

    SIGNALS[idx].raise();
}
