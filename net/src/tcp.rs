//! TCP — connection-oriented sockets, stop-and-wait.
//!
//! One unacknowledged segment per socket: `pending_seq` is
//! `local_seq` plus the length currently on the wire (SYN and FIN
//! count as one). An inbound ACK must name `pending_seq` exactly; an
//! inbound data segment must start at `ack_seq` or a bare ACK
//! restates the expected sequence number. Received data is
//! acknowledged when the application reads it, not before — the
//! single receive slot is the whole window.
//!
//! Socket state is a [`Mode`] (listen and closing cannot coexist)
//! plus the flags observed on the last accepted segment; the blocking
//! connect/listen/close/send loops inspect those flags after each
//! signal wake.
//!
//! On transmit the header length is always 20 (no options) and the
//! advertised window is one MSS.

use bitflags::bitflags;
use log::debug;
use spin::Mutex;
use tern_lib::Signal;

use crate::config::{MAX_LOCAL_PORT, MAX_SOCKETS_TCP, MIN_LOCAL_PORT, MSS};
use crate::ipv4;
use crate::pool::{self, BufId, Buffer};
use crate::types::{IfaceId, IpProtocol, Ipv4Addr, NetError, Port};
use crate::checksum;

pub const TCP_HEADER_LEN: usize = 20;

/// Send attempts per blocking exchange.
pub const MAX_RETRIES: u32 = 5;

/// Per-attempt wait, milliseconds.
pub const TIMEOUT_TCP_MS: u64 = 500;

bitflags! {
    /// Wire flag bits in the TCP header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

bitflags! {
    /// Flags observed on the last accepted segment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Seen: u8 {
        const SYN = 0x01;
        const FIN = 0x02;
        const ACK = 0x04;
        const RST = 0x08;
    }
}

// =============================================================================
// Socket table
// =============================================================================

/// Connection lifecycle state. Invalid combinations (a listening
/// socket that is also closing) are unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Closed,
    Listen,
    Open,
    /// Active close in progress (we sent, or are about to send, FIN).
    Closing,
}

#[derive(Clone, Copy)]
struct TcpSocket {
    peer: Ipv4Addr,
    remote_port: Port,
    local_port: Port,
    iface: IfaceId,
    held: Option<BufId>,
    /// Next byte expected from the peer.
    ack_seq: u32,
    /// Last acknowledged local sequence number.
    local_seq: u32,
    /// `local_seq` plus the unacknowledged length on the wire.
    pending_seq: u32,
    mode: Mode,
    seen: Seen,
}

impl TcpSocket {
    const fn closed() -> Self {
        Self {
            peer: Ipv4Addr::UNSPECIFIED,
            remote_port: Port(0),
            local_port: Port(0),
            iface: IfaceId::ETH,
            held: None,
            ack_seq: 0,
            local_seq: 0,
            pending_seq: 0,
            mode: Mode::Closed,
            seen: Seen::empty(),
        }
    }
}

struct TcpTable {
    sockets: [TcpSocket; MAX_SOCKETS_TCP],
    next_port: u16,
}

static TCP: Mutex<TcpTable> = Mutex::new(TcpTable {
    sockets: [const { TcpSocket::closed() }; MAX_SOCKETS_TCP],
    next_port: MIN_LOCAL_PORT,
});

static SIGNALS: [Signal; MAX_SOCKETS_TCP] = [const { Signal::new() }; MAX_SOCKETS_TCP];

fn check(sock: usize) -> Result<(), NetError> {
    if sock < MAX_SOCKETS_TCP {
        Ok(())
    } else {
        Err(NetError::InvalidArgument)
    }
}

fn seen_of(sock: usize) -> Seen {
    TCP.lock().sockets[sock].seen
}

/// Force a socket back to `Closed`, dropping any held buffer.
fn clear_socket(sock: usize) {
    let stale = {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        let stale = s.held.take();
        *s = TcpSocket::closed();
        stale
    };
    if let Some(id) = stale {
        pool::release(id);
    }
}

fn fail(sock: usize, err: NetError) -> Result<(), NetError> {
    clear_socket(sock);
    Err(err)
}

// =============================================================================
// Segment construction
// =============================================================================

/// Addressing and sequence snapshot taken under the table lock.
#[derive(Clone, Copy)]
struct Endpoint {
    peer: Ipv4Addr,
    remote_port: Port,
    local_port: Port,
    iface: IfaceId,
    seq: u32,
    ack: u32,
}

impl Endpoint {
    fn of(s: &TcpSocket) -> Self {
        Self {
            peer: s.peer,
            remote_port: s.remote_port,
            local_port: s.local_port,
            iface: s.iface,
            seq: s.local_seq,
            ack: s.ack_seq,
        }
    }
}

/// Write a 20-byte TCP header at the cursor.
fn write_header(b: &mut Buffer, ep: &Endpoint, flags: TcpFlags) {
    b.write_u16(ep.local_port.as_u16());
    b.write_u16(ep.remote_port.as_u16());
    b.write_u32(ep.seq);
    b.write_u32(ep.ack);
    b.write_u8(0x50); // header length 20, no options
    b.write_u8(flags.bits());
    b.write_u16(MSS); // advertised window
    b.write_u16(0); // checksum, patched after
    b.write_u16(0); // urgent, always zero
}

/// Patch the pseudo-header checksum of the segment at the payload.
fn patch_checksum(b: &mut Buffer) {
    let src = ipv4::source_addr(b);
    let dst = ipv4::dest_addr(b);
    {
        let p = b.payload_mut();
        p[16] = 0;
        p[17] = 0;
    }
    let value = checksum::transport(src, dst, IpProtocol::Tcp, b.payload());
    b.payload_mut()[16..18].copy_from_slice(&value.to_be_bytes());
}

/// Build and transmit an empty segment carrying `flags`.
fn control_frame(ep: &Endpoint, flags: TcpFlags) -> bool {
    let Some(id) = ipv4::datagram_new(ep.peer, 64, ep.iface) else {
        return false;
    };
    let frame = pool::with_mut(id, |b| {
        write_header(b, ep, flags);
        patch_checksum(b);
        ipv4::finalize(b)
    });
    let sent = match frame {
        Some(frame) => ipv4::send_frame(&frame).is_ok(),
        None => false,
    };
    pool::release(id);
    sent
}

/// Snapshot the socket, clear its observed flags, and send an empty
/// segment with `flags`.
fn send_control(sock: usize, flags: TcpFlags) -> bool {
    let ep = {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        s.seen = Seen::empty();
        Endpoint::of(s)
    };
    control_frame(&ep, flags)
}

// =============================================================================
// Parse
// =============================================================================

struct SegHeader {
    src_ip: Ipv4Addr,
    src_port: Port,
    dst_port: Port,
    seq: u32,
    ack: u32,
    hlen: usize,
    flags: TcpFlags,
}

/// Side effects to run once the table lock is dropped.
struct SegAction {
    reply: Option<(Endpoint, TcpFlags)>,
    wake: bool,
    release: Option<BufId>,
}

impl SegAction {
    const fn drop_segment() -> Self {
        Self {
            reply: None,
            wake: false,
            release: None,
        }
    }
}

fn process(s: &mut TcpSocket, id: BufId, b: &mut Buffer, hdr: &SegHeader) -> SegAction {
    let data_len = b.size().saturating_sub(hdr.hlen);

    // Backpressure: never overwrite undelivered data. The peer
    // retransmits once the application consumes.
    if data_len > 0 && s.held.is_some() {
        return SegAction::drop_segment();
    }

    s.peer = hdr.src_ip;
    s.remote_port = hdr.src_port;
    s.iface = b.iface();

    if hdr.flags.contains(TcpFlags::ACK) {
        if hdr.ack != s.pending_seq {
            return SegAction::drop_segment(); // stale acknowledgement
        }
        s.local_seq = s.pending_seq;
        s.seen.insert(Seen::ACK);
    } else {
        s.seen.remove(Seen::ACK);
    }

    if hdr.flags.contains(TcpFlags::SYN) {
        // SYN carries the peer's initial sequence number and consumes
        // one of its own.
        s.ack_seq = hdr.seq.wrapping_add(1);
        s.seen.insert(Seen::SYN);
    } else {
        if hdr.seq != s.ack_seq {
            if data_len > 0 {
                // Restate the expected sequence number.
                s.seen = Seen::empty();
                return SegAction {
                    reply: Some((Endpoint::of(s), TcpFlags::ACK)),
                    wake: false,
                    release: None,
                };
            }
            return SegAction::drop_segment();
        }
        s.ack_seq = s.ack_seq.wrapping_add(data_len as u32);
        s.seen.remove(Seen::SYN);
    }

    if hdr.flags.contains(TcpFlags::FIN) {
        s.ack_seq = s.ack_seq.wrapping_add(1);
        s.seen.insert(Seen::FIN);
        if s.mode != Mode::Closing {
            // Peer-initiated teardown: answer FIN|ACK and close.
            s.seen = Seen::empty();
            let ep = Endpoint::of(s);
            let stale = s.held.take();
            *s = TcpSocket::closed();
            return SegAction {
                reply: Some((ep, TcpFlags::FIN | TcpFlags::ACK)),
                wake: true,
                release: stale,
            };
        }
    } else {
        s.seen.remove(Seen::FIN);
    }

    if hdr.flags.contains(TcpFlags::RST) {
        let stale = s.held.take();
        *s = TcpSocket::closed();
        s.seen = Seen::RST;
        return SegAction {
            reply: None,
            wake: true,
            release: stale,
        };
    }

    if data_len > 0 {
        b.retain();
        b.pull_front(hdr.hlen);
        s.held = Some(id);
    }

    SegAction {
        reply: None,
        wake: true,
        release: None,
    }
}

/// Demultiplex and process an inbound segment.
pub(crate) fn parse(id: BufId, b: &mut Buffer) {
    if b.payload().len() < TCP_HEADER_LEN {
        return;
    }
    let hdr = {
        let p = b.payload();
        SegHeader {
            src_ip: ipv4::source_addr(b),
            src_port: Port::from_be_bytes([p[0], p[1]]),
            dst_port: Port::from_be_bytes([p[2], p[3]]),
            seq: u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
            ack: u32::from_be_bytes([p[8], p[9], p[10], p[11]]),
            hlen: ((p[12] >> 4) as usize) * 4,
            flags: TcpFlags::from_bits_truncate(p[13]),
        }
    };
    if hdr.hlen < TCP_HEADER_LEN || b.payload().len() < hdr.hlen {
        return;
    }

    let (idx, action) = {
        let mut t = TCP.lock();
        let Some(idx) = t.sockets.iter().position(|s| {
            s.mode != Mode::Closed
                && s.local_port == hdr.dst_port
                && (s.mode == Mode::Listen
                    || (s.remote_port == hdr.src_port && s.peer == hdr.src_ip))
        }) else {
            debug!("tcp: no socket for {}:{}, dropping", hdr.src_ip, hdr.dst_port);
            return;
        };
        let action = process(&mut t.sockets[idx], id, b, &hdr);
        (idx, action)
    };

    if let Some(stale) = action.release {
        pool::release(stale);
    }
    if let Some((ep, flags)) = action.reply {
        control_frame(&ep, flags);
    }
    if action.wake {
        SIGNALS[idx].raise();
    }
}

// =============================================================================
// Connect
// =============================================================================

/// Actively open a connection.
///
/// Up to [`MAX_RETRIES`] SYN attempts; each wake is classified by the
/// observed flags. A lone ACK or lone SYN drops into an auxiliary
/// loop waiting for the missing half of the handshake.
pub fn open(
    sock: usize,
    local_port: Port,
    peer: Ipv4Addr,
    remote_port: Port,
    iface: IfaceId,
) -> Result<(), NetError> {
    check(sock)?;
    {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        if s.mode != Mode::Closed {
            return Err(NetError::AlreadyConnected);
        }
        let isn: u32 = rand::random();
        *s = TcpSocket::closed();
        s.mode = Mode::Open;
        s.peer = peer;
        s.remote_port = remote_port;
        s.local_port = local_port;
        s.iface = iface;
        s.local_seq = isn;
        s.pending_seq = isn.wrapping_add(1); // SYN consumes one
    }

    for _ in 0..MAX_RETRIES {
        send_control(sock, TcpFlags::SYN);
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::ACK | Seen::SYN) {
                return establish(sock);
            }
            if seen.contains(Seen::ACK) {
                return open_wait_syn(sock);
            }
            if seen.contains(Seen::SYN) {
                return open_wait_ack(sock);
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

/// Our SYN was acknowledged; wait for the peer's SYN.
fn open_wait_syn(sock: usize) -> Result<(), NetError> {
    for _ in 0..MAX_RETRIES {
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::SYN) {
                return establish(sock);
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

/// The peer's SYN arrived; keep acknowledging until ours is acked.
fn open_wait_ack(sock: usize) -> Result<(), NetError> {
    for _ in 0..MAX_RETRIES {
        send_control(sock, TcpFlags::ACK);
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::ACK) {
                return establish(sock);
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

fn establish(sock: usize) -> Result<(), NetError> {
    send_control(sock, TcpFlags::ACK);
    debug!("tcp: sock {} established", sock);
    Ok(())
}

// =============================================================================
// Listen
// =============================================================================

/// Passively wait for a connection on `local_port`, then complete the
/// handshake. Blocks until a segment arrives.
pub fn listen(sock: usize, local_port: Port) -> Result<(), NetError> {
    check(sock)?;
    {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        if s.mode != Mode::Closed {
            return Err(NetError::AlreadyConnected);
        }
        *s = TcpSocket::closed();
        s.mode = Mode::Listen;
        s.local_port = local_port;
        s.local_seq = rand::random();
    }

    SIGNALS[sock].wait();

    {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        if !s.seen.contains(Seen::SYN) || s.seen.intersects(Seen::RST | Seen::FIN) {
            drop(t);
            return fail(sock, NetError::Protocol);
        }
        s.pending_seq = s.local_seq.wrapping_add(1); // our SYN will consume one
        s.mode = Mode::Open;
    }

    for _ in 0..MAX_RETRIES {
        send_control(sock, TcpFlags::SYN | TcpFlags::ACK);
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::ACK) {
                debug!("tcp: sock {} accepted", sock);
                return Ok(());
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

// =============================================================================
// Close
// =============================================================================

/// Actively close a connection with the FIN|ACK exchange.
pub fn close(sock: usize) -> Result<(), NetError> {
    check(sock)?;
    {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        match s.mode {
            Mode::Closed => return Ok(()),
            Mode::Listen => {
                *s = TcpSocket::closed();
                return Ok(());
            }
            Mode::Open | Mode::Closing => {}
        }
        let stale = s.held.take();
        s.mode = Mode::Closing;
        s.pending_seq = s.local_seq.wrapping_add(1); // FIN consumes one
        drop(t);
        if let Some(id) = stale {
            pool::release(id);
        }
    }

    for _ in 0..MAX_RETRIES {
        send_control(sock, TcpFlags::FIN | TcpFlags::ACK);
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::ACK | Seen::FIN) {
                return close_finish(sock);
            }
            if seen.contains(Seen::ACK) {
                return close_wait_fin(sock);
            }
            if seen.contains(Seen::FIN) {
                return close_wait_ack(sock);
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

/// Our FIN was acknowledged; wait for the peer's FIN.
fn close_wait_fin(sock: usize) -> Result<(), NetError> {
    for _ in 0..MAX_RETRIES {
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::FIN) {
                return close_finish(sock);
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

/// The peer's FIN arrived; keep acknowledging until ours is acked.
fn close_wait_ack(sock: usize) -> Result<(), NetError> {
    for _ in 0..MAX_RETRIES {
        send_control(sock, TcpFlags::ACK);
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::ACK) {
                return close_finish(sock);
            }
        }
    }
    fail(sock, NetError::TimedOut)
}

fn close_finish(sock: usize) -> Result<(), NetError> {
    send_control(sock, TcpFlags::ACK);
    clear_socket(sock);
    debug!("tcp: sock {} closed", sock);
    Ok(())
}

/// Abort: send RST|ACK if the socket is live, then force it empty.
pub fn reset(sock: usize) {
    if check(sock).is_err() {
        return;
    }
    let (stale, ep) = {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        let stale = s.held.take();
        let ep = (s.mode != Mode::Closed).then(|| Endpoint::of(s));
        *s = TcpSocket::closed();
        (stale, ep)
    };
    if let Some(id) = stale {
        pool::release(id);
    }
    if let Some(ep) = ep {
        control_frame(&ep, TcpFlags::ACK | TcpFlags::RST);
    }
}

// =============================================================================
// Data transfer
// =============================================================================

/// Allocate a data segment: default header (ACK|PSH, current
/// sequence numbers, window = MSS), positioned past the header.
pub fn new(sock: usize) -> Option<BufId> {
    check(sock).ok()?;
    let ep = {
        let t = TCP.lock();
        Endpoint::of(&t.sockets[sock])
    };
    let id = ipv4::datagram_new(ep.peer, MSS as usize, ep.iface)?;
    pool::with_mut(id, |b| {
        write_header(b, &ep, TcpFlags::ACK | TcpFlags::PSH);
        b.pull_front(TCP_HEADER_LEN);
    });
    Some(id)
}

/// Transmit a segment built by [`new`], retransmitting until the peer
/// acknowledges. Failure clears the socket; the caller still owns the
/// buffer.
pub fn send(sock: usize, id: BufId) -> Result<(), NetError> {
    check(sock)?;
    let payload_len = pool::with_mut(id, |b| b.size()).ok_or(NetError::InvalidArgument)?;
    {
        let mut t = TCP.lock();
        let s = &mut t.sockets[sock];
        if s.mode != Mode::Open {
            return Err(NetError::NotConnected);
        }
        if s.held.is_some() {
            return Err(NetError::WouldBlock);
        }
        s.pending_seq = s.local_seq.wrapping_add(payload_len as u32);
    }

    pool::with_mut(id, |b| {
        b.push_front(TCP_HEADER_LEN);
        patch_checksum(b);
    });

    for _ in 0..MAX_RETRIES {
        {
            let mut t = TCP.lock();
            let s = &mut t.sockets[sock];
            if s.mode == Mode::Closed {
                break;
            }
            s.seen = Seen::empty();
        }
        if let Some(frame) = pool::with_mut(id, ipv4::finalize) {
            let _ = ipv4::send_frame(&frame);
        }
        if SIGNALS[sock].wait_timeout(TIMEOUT_TCP_MS) {
            let seen = seen_of(sock);
            if seen.contains(Seen::RST) {
                return fail(sock, NetError::ConnectionReset);
            }
            if seen.contains(Seen::ACK) {
                return Ok(());
            }
        }
    }

    // Half disconnection: this socket only.
    fail(sock, NetError::TimedOut)
}

/// Convenience: allocate, fill and send one text segment.
pub fn send_text(sock: usize, text: &str) -> Result<(), NetError> {
    let id = new(sock).ok_or(NetError::NoBufferSpace)?;
    pool::with_mut(id, |b| b.write_str(text));
    let res = send(sock, id);
    pool::release(id);
    res
}

/// Take the received segment, acknowledging it toward the peer.
/// Blocks up to `timeout_ms` when no data is pending.
pub fn read(sock: usize, timeout_ms: u64) -> Option<BufId> {
    check(sock).ok()?;
    let pending = {
        let t = TCP.lock();
        let s = &t.sockets[sock];
        if s.mode == Mode::Closed {
            return None;
        }
        s.held.is_some()
    };
    if !pending {
        SIGNALS[sock].wait_timeout(timeout_ms);
    }

    let taken = TCP.lock().sockets[sock].held.take()?;
    send_control(sock, TcpFlags::ACK);
    Some(taken)
}

// =============================================================================
// Queries
// =============================================================================

/// `true` while the socket is connected or listening.
pub fn is_open(sock: usize) -> bool {
    check(sock).is_ok() && TCP.lock().sockets[sock].mode != Mode::Closed
}

/// `true` if unread data is pending on the socket.
pub fn has_data(sock: usize) -> bool {
    check(sock).is_ok() && TCP.lock().sockets[sock].held.is_some()
}

/// Next unused ephemeral port in `[1024, 32767]`, skipping ports of
/// listening sockets.
pub fn ephemeral_port() -> Port {
    let mut t = TCP.lock();
    let mut port = t.next_port;
    'search: loop {
        for s in t.sockets.iter() {
            if s.mode == Mode::Listen && s.local_port.as_u16() == port {
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
        let mut t = TCP.lock();
        let ids = t.sockets.iter_mut().filter_map(|s| s.held.take()).collect();
        for s in t.sockets.iter_mut() {
            *s = TcpSocket::closed();
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
