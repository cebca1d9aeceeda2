//! ARP — IPv4-to-MAC resolution over Ethernet.
//!
//! A fixed-size cache maps IPv4 addresses to MACs. Entries age out
//! under a periodic tick ([`tick`], driven by the platform timer every
//! [`TICK_ARP_MS`]); an expired entry is wiped to all-ones and never
//! matched again. Resolution blocks the calling task for at most one
//! request/reply round-trip.
//!
//! Requests for the local address are answered by rewriting the
//! request in place and retransmitting it.

use log::debug;
use spin::Mutex;
use tern_lib::Signal;

use crate::config::MAX_CACHE_ARP;
use crate::iface;
use crate::pool::{self, BufId, Buffer};
use crate::types::{EtherType, IfaceId, Ipv4Addr, MacAddr};

pub const ARP_HEADER_LEN: usize = 28;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_HLEN_ETHERNET: u8 = 6;
const ARP_PLEN_IPV4: u8 = 4;
const ARP_OPER_REQUEST: u16 = 1;
const ARP_OPER_REPLY: u16 = 2;

/// Ticks of lifetime given to a cache entry on insert or refresh.
pub const CACHE_TIME_ARP: u8 = 120;

/// Period of the aging tick, milliseconds.
pub const TICK_ARP_MS: u64 = 10_000;

/// How long a resolve waits for a reply, milliseconds.
pub const TIMEOUT_ARP_MS: u64 = 5_000;

// =============================================================================
// Cache
// =============================================================================

#[derive(Clone, Copy)]
struct CacheEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
    ttl: u8,
}

impl CacheEntry {
    /// The wiped state: all-ones addresses, zero ttl.
    const fn invalid() -> Self {
        Self {
            ip: Ipv4Addr::BROADCAST,
            mac: MacAddr::BROADCAST,
            ttl: 0,
        }
    }
}

static CACHE: Mutex<[CacheEntry; MAX_CACHE_ARP]> =
    Mutex::new([CacheEntry::invalid(); MAX_CACHE_ARP]);

static ARP_SIGNAL: Signal = Signal::new();

/// Non-blocking cache probe. Wiped entries never match.
pub fn lookup(ip: Ipv4Addr) -> Option<MacAddr> {
    let cache = CACHE.lock();
    cache
        .iter()
        .find(|e| e.ttl > 0 && e.ip == ip)
        .map(|e| e.mac)
}

/// Insert or refresh a mapping.
///
/// A known IPv4 is updated in place; otherwise the entry with the
/// smallest remaining ttl is evicted (ties to the lowest index,
/// short-circuiting on a dead entry). The ttl is reset to
/// [`CACHE_TIME_ARP`] either way.
pub(crate) fn cache_add(ip: Ipv4Addr, mac: MacAddr) {
    let mut cache = CACHE.lock();

    let idx = match cache.iter().position(|e| e.ip == ip) {
        Some(i) => i,
        None => {
            let mut victim = 0usize;
            let mut best = u16::MAX;
            for (i, e) in cache.iter().enumerate() {
                if (e.ttl as u16) < best {
                    best = e.ttl as u16;
                    victim = i;
                }
                if best == 0 {
                    break;
                }
            }
            victim
        }
    };

    cache[idx] = CacheEntry {
        ip,
        mac,
        ttl: CACHE_TIME_ARP,
    };
}

/// Age the cache by one tick. The platform timer calls this every
/// [`TICK_ARP_MS`]; expired entries are wiped to all-ones.
pub fn tick() {
    let mut cache = CACHE.lock();
    for entry in cache.iter_mut() {
        if entry.ttl > 0 {
            entry.ttl -= 1;
            if entry.ttl == 0 {
                *entry = CacheEntry::invalid();
            }
        }
    }
}

/// Wipe the cache and drop any pending resolution signal. For tests.
pub fn reset() {
    let mut cache = CACHE.lock();
    for entry in cache.iter_mut() {
        *entry = CacheEntry::invalid();
    }
    ARP_SIGNAL.clear();
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve `ip` to a MAC address, blocking for at most one
/// request/reply round-trip.
///
/// The limited broadcast maps straight to the broadcast MAC. On a
/// cache miss, one request is broadcast and the caller waits up to
/// [`TIMEOUT_ARP_MS`] for the reply to land in the cache.
pub fn resolve(iface: IfaceId, ip: Ipv4Addr) -> Option<MacAddr> {
    if ip.is_broadcast() {
        return Some(MacAddr::BROADCAST);
    }
    if let Some(mac) = lookup(ip) {
        return Some(mac);
    }

    send_request(iface, ip);
    if ARP_SIGNAL.wait_timeout(TIMEOUT_ARP_MS) {
        return lookup(ip);
    }
    None
}

/// Broadcast an ARP request for `target`.
fn send_request(iface: IfaceId, target: Ipv4Addr) {
    let Some(id) = pool::alloc(ARP_HEADER_LEN) else {
        debug!("arp: pool exhausted, request for {} dropped", target);
        return;
    };
    let frame = pool::with_mut(id, |b| {
        b.set_iface(iface);
        b.write_u16(ARP_HTYPE_ETHERNET);
        b.write_u16(ARP_PTYPE_IPV4);
        b.write_u8(ARP_HLEN_ETHERNET);
        b.write_u8(ARP_PLEN_IPV4);
        b.write_u16(ARP_OPER_REQUEST);
        b.write_buf(iface::mac_local(iface).as_bytes());
        b.write_ip(iface::ip_local(iface));
        b.write_buf(MacAddr::BROADCAST.as_bytes());
        b.write_ip(target);
        b.payload().to_vec()
    });
    if let Some(frame) = frame {
        debug!("arp: request for {} on dev {}", target, iface);
        let _ = iface::transmit(iface, Ipv4Addr::BROADCAST, EtherType::Arp, &frame);
    }
    pool::release(id);
}

// =============================================================================
// Parse
// =============================================================================

/// Handle an inbound ARP message.
pub(crate) fn parse(_id: BufId, b: &mut Buffer) {
    let p = b.payload();
    if p.len() < ARP_HEADER_LEN {
        return;
    }

    let htype = u16::from_be_bytes([p[0], p[1]]);
    let ptype = u16::from_be_bytes([p[2], p[3]]);
    if htype != ARP_HTYPE_ETHERNET
        || ptype != ARP_PTYPE_IPV4
        || p[4] != ARP_HLEN_ETHERNET
        || p[5] != ARP_PLEN_IPV4
    {
        return;
    }

    let oper = u16::from_be_bytes([p[6], p[7]]);
    let sender_mac = MacAddr([p[8], p[9], p[10], p[11], p[12], p[13]]);
    let sender_ip = Ipv4Addr([p[14], p[15], p[16], p[17]]);
    let target_ip = Ipv4Addr([p[24], p[25], p[26], p[27]]);

    let iface = b.iface();
    match oper {
        ARP_OPER_REQUEST => {
            let our_ip = iface::ip_local(iface);
            if target_ip != our_ip || our_ip.is_unspecified() {
                return;
            }
            cache_add(sender_ip, sender_mac);

            // Rewrite the request into a reply in place and send it
            // straight back.
            let our_mac = iface::mac_local(iface);
            let p = b.payload_mut();
            p[6..8].copy_from_slice(&ARP_OPER_REPLY.to_be_bytes());
            p[18..24].copy_from_slice(sender_mac.as_bytes());
            p[24..28].copy_from_slice(sender_ip.as_bytes());
            p[8..14].copy_from_slice(our_mac.as_bytes());
            p[14..18].copy_from_slice(our_ip.as_bytes());

            debug!("arp: answering request from {} ({})", sender_ip, sender_mac);
            let frame = b.payload().to_vec();
            let _ = iface::transmit(iface, sender_ip, EtherType::Arp, &frame);
        }
        ARP_OPER_REPLY => {
            debug!("arp: reply {} -> {}", sender_ip, sender_mac);
            cache_add(sender_ip, sender_mac);
            ARP_SIGNAL.raise();
        }
        _ => {
            debug!("arp: unknown opcode {}", oper);
        }
    }
}
