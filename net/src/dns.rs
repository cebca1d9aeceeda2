//! DNS client — resolves a hostname to a single A record.
//!
//! One standard query per attempt over the dedicated UDP socket,
//! addressed to the interface's configured DNS server. The reply scan
//! follows compression pointers far enough to skip names; no cache,
//! no CNAME chasing — the first A record wins.

use log::debug;

use crate::config::SOCKET_DNS;
use crate::pool::{self, Buffer};
use crate::types::{IfaceId, Ipv4Addr, Port};
use crate::{iface, udp};

const DNS_PORT: Port = Port(53);
const DNS_HEADER_LEN: usize = 12;

/// A-record query type / Internet class.
const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;

/// Recursion-desired flag in the header.
const FLAG_RD: u16 = 0x0100;

const MAX_RETRIES: u32 = 3;
const TIMEOUT_DNS_MS: u64 = 500;

/// Build and send one A-record query for `host`.
fn send_query(host: &str, qid: u16) -> bool {
    let Some(id) = udp::new(SOCKET_DNS) else {
        return false;
    };
    pool::with_mut(id, |b| {
        b.write_u16(qid);
        b.write_u16(FLAG_RD);
        b.write_u16(1); // one question
        b.write_u16(0);
        b.write_u16(0);
        b.write_u16(0);

        // Hostname as counted labels, zero-length terminated.
        for label in host.split('.') {
            b.write_str_counted(label);
        }
        b.write_u8(0);

        b.write_u16(QTYPE_A);
        b.write_u16(QCLASS_IN);
    });
    let sent = udp::send(id).is_ok();
    pool::release(id);
    sent
}

/// Skip one name field, whether spelled out or a compression pointer.
fn skip_name(b: &mut Buffer) {
    if b.read_u8() & 0xc0 == 0xc0 {
        // Two-byte pointer; the offset byte remains.
        b.read_u8();
    } else {
        b.skip_str();
    }
}

/// Scan a reply for the first A record. The id must match and the
/// answer count must be non-zero.
fn parse(b: &mut Buffer, qid: u16) -> Option<Ipv4Addr> {
    b.rewind();
    if b.size() < DNS_HEADER_LEN {
        return None;
    }

    let id = b.read_u16();
    b.skip(2); // flags
    b.skip(2); // qdcount
    let ancount = b.read_u16();
    b.skip(4); // nscount, arcount
    if ancount == 0 || id != qid {
        return None;
    }

    // Skip the echoed question.
    skip_name(b);
    b.skip(4);

    while !b.is_eof() {
        skip_name(b);
        let rtype = b.read_u16();
        b.skip(6); // class, ttl
        let rdlength = b.read_u16();
        if rtype == QTYPE_A {
            if rdlength != 4 {
                break;
            }
            return Some(b.read_ip());
        }
        b.skip(rdlength as usize);
    }
    None
}

/// Resolve `host` to an IPv4 address via the interface's DNS server.
/// Returns `0.0.0.0` on failure.
pub fn resolve(host: &str, dev: IfaceId) -> Ipv4Addr {
    let mut result = Ipv4Addr::UNSPECIFIED;

    udp::close(SOCKET_DNS);
    let local = udp::ephemeral_port();
    if udp::open(SOCKET_DNS, local, iface::dns_server(dev), DNS_PORT, dev).is_err() {
        return result;
    }

    let qid: u16 = rand::random();
    for _ in 0..MAX_RETRIES {
        if !send_query(host, qid) {
            break;
        }
        if udp::listen(SOCKET_DNS, local, TIMEOUT_DNS_MS) {
            if let Some(id) = udp::read(SOCKET_DNS) {
                if let Some(addr) = pool::with_mut(id, |b| parse(b, qid)).flatten() {
                    result = addr;
                }
                pool::release(id);
            }
            break;
        }
    }

    udp::close(SOCKET_DNS);
    if result.is_unspecified() {
        debug!("dns: no A record for {}", host);
    }
    result
}
