//! Shared test fixtures.
//!
//! The stack state is process-wide (pool, socket tables, ARP cache,
//! interface configs), so tests that touch it serialize on a global
//! lock and reset everything up front.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::checksum::{self, Checksum};
use crate::iface::{self, LinkSender};
use crate::pool::ProtocolTag;
use crate::types::{EtherType, IfaceId, IpProtocol, Ipv4Addr, MacAddr, NetError};
use crate::{dispatch, ipv4};

static SERIAL: StdMutex<()> = StdMutex::new(());

/// Take the global test lock; stack state is shared.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reset every table and install a fresh Ethernet test setup:
/// local 192.0.2.10/24, gateway 192.0.2.1, a fixed MAC, and a
/// recording link driver whose log is returned.
pub fn fresh_stack() -> TxLog {
    crate::init();
    iface::reset_all();
    dispatch::MESSAGE.clear();
    iface::configure(
        IfaceId::ETH,
        Ipv4Addr([192, 0, 2, 10]),
        Ipv4Addr([255, 255, 255, 0]),
        Ipv4Addr([192, 0, 2, 1]),
    );
    iface::set_mac(IfaceId::ETH, MacAddr([0x02, 0, 0, 0xaa, 0xbb, 0xcc]));
    install_link(IfaceId::ETH)
}

// =============================================================================
// Recording link driver
// =============================================================================

/// One transmitted frame as the link driver saw it.
#[derive(Clone)]
pub struct TxRecord {
    pub next_hop: Ipv4Addr,
    pub ethertype: EtherType,
    pub frame: Vec<u8>,
}

pub type TxLog = Arc<StdMutex<Vec<TxRecord>>>;

struct RecordingLink {
    log: TxLog,
}

impl LinkSender for RecordingLink {
    fn transmit(
        &self,
        next_hop: Ipv4Addr,
        ethertype: EtherType,
        frame: &[u8],
    ) -> Result<(), NetError> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TxRecord {
                next_hop,
                ethertype,
                frame: frame.to_vec(),
            });
        Ok(())
    }
}

/// Register a recording driver on `dev` and return its log.
pub fn install_link(dev: IfaceId) -> TxLog {
    let log: TxLog = Arc::new(StdMutex::new(Vec::new()));
    iface::register_driver(
        dev,
        Box::new(RecordingLink {
            log: Arc::clone(&log),
        }),
    );
    log
}

/// Pop every recorded frame.
pub fn drain(log: &TxLog) -> Vec<TxRecord> {
    let mut frames = log.lock().unwrap_or_else(|e| e.into_inner());
    std::mem::take(&mut *frames)
}

/// Submit a frame as a link driver would, then drain the dispatcher.
pub fn feed(dev: IfaceId, tag: ProtocolTag, frame: &[u8]) {
    dispatch::net_rx(dev, tag, frame);
    dispatch::poll();
}

/// Block up to `timeout_ms` for the next transmitted frame.
pub fn wait_tx(log: &TxLog, timeout_ms: u64) -> Option<TxRecord> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        {
            let mut frames = log.lock().unwrap_or_else(|e| e.into_inner());
            if !frames.is_empty() {
                return Some(frames.remove(0));
            }
        }
        if std::time::Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

// =============================================================================
// Frame builders
// =============================================================================

/// A valid IPv4 frame around `payload`.
pub fn ip_frame(src: Ipv4Addr, dst: Ipv4Addr, proto: IpProtocol, payload: &[u8]) -> Vec<u8> {
    let total = ipv4::IPV4_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];
    frame[0] = 0x45;
    frame[1] = 0;
    frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    frame[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
    frame[8] = 64;
    frame[9] = proto.as_u8();
    frame[12..16].copy_from_slice(src.as_bytes());
    frame[16..20].copy_from_slice(dst.as_bytes());

    let mut sum = Checksum::new();
    sum.push_slice(&frame[..ipv4::IPV4_HEADER_LEN]);
    frame[10..12].copy_from_slice(&sum.value().to_be_bytes());

    frame[ipv4::IPV4_HEADER_LEN..].copy_from_slice(payload);
    frame
}

/// A valid TCP segment (inside an IPv4 frame) from `src` to `dst`.
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut seg = vec![0u8; 20 + payload.len()];
    seg[0..2].copy_from_slice(&src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&seq.to_be_bytes());
    seg[8..12].copy_from_slice(&ack.to_be_bytes());
    seg[12] = 0x50;
    seg[13] = flags;
    seg[14..16].copy_from_slice(&512u16.to_be_bytes());
    seg[20..].copy_from_slice(payload);
    let sum = checksum::transport(src, dst, IpProtocol::Tcp, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());

    ip_frame(src, dst, IpProtocol::Tcp, &seg)
}

/// A valid UDP datagram (inside an IPv4 frame) from `src` to `dst`.
pub fn udp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut dgram = vec![0u8; len];
    dgram[0..2].copy_from_slice(&src_port.to_be_bytes());
    dgram[2..4].copy_from_slice(&dst_port.to_be_bytes());
    dgram[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    dgram[8..].copy_from_slice(payload);
    let sum = checksum::transport(src, dst, IpProtocol::Udp, &dgram);
    dgram[6..8].copy_from_slice(&sum.to_be_bytes());

    ip_frame(src, dst, IpProtocol::Udp, &dgram)
}

/// Decoded TCP header fields of a transmitted frame.
pub struct TcpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Pull the TCP header out of a recorded IPv4 frame.
pub fn tcp_fields(frame: &[u8]) -> TcpFields {
    let ihl = ((frame[0] & 0x0f) as usize) * 4;
    let seg = &frame[ihl..];
    let hlen = ((seg[12] >> 4) as usize) * 4;
    TcpFields {
        src_port: u16::from_be_bytes([seg[0], seg[1]]),
        dst_port: u16::from_be_bytes([seg[2], seg[3]]),
        seq: u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]),
        ack: u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]),
        flags: seg[13],
        window: u16::from_be_bytes([seg[14], seg[15]]),
        payload: seg[hlen..].to_vec(),
    }
}
