//! DHCP client — obtains an IPv4 lease over UDP.
//!
//! Classic BOOTP framing on the dedicated UDP socket (client port 68,
//! server port 67). One transaction id is drawn per session; the
//! OFFER's yiaddr and the server address from the enclosing IP header
//! are parked in a temp slot until the ACK commits them to the
//! Ethernet interface. Lease lifetime is read but not stored — there
//! is no renewal timer.

use log::debug;
use spin::Mutex;
use tern_lib::clock;

use crate::config::SOCKET_DHCP;
use crate::pool;
use crate::types::{IfaceId, Ipv4Addr, Port};
use crate::{iface, ipv4, udp};

const PORT_SERVER: Port = Port(67);
const PORT_CLIENT: Port = Port(68);

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const FLAGS_BROADCAST: u16 = 0x8000;
const MAGIC_COOKIE: u32 = 0x6382_5363;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;
const MSG_RELEASE: u8 = 7;

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS: u8 = 6;
const OPTION_REQUESTED_IP: u8 = 50;
const OPTION_MSG_TYPE: u8 = 53;
const OPTION_PARAM_REQ_LIST: u8 = 55;
const OPTION_CLIENT_ID: u8 = 61;
const OPTION_END: u8 = 255;

/// Fixed BOOTP region before the magic cookie.
const BOOTP_HEADER_LEN: usize = 236;

const MAX_RETRIES: u32 = 10;
const TIMEOUT_DISCOVER_MS: u64 = 1000;
const TIMEOUT_REQUEST_MS: u64 = 300;

// =============================================================================
// In-flight transaction state
// =============================================================================

struct DhcpState {
    /// Offered address, committed on ACK.
    ip_tmp: Ipv4Addr,
    /// DHCP server address, harvested from the offer's IP header.
    server: Ipv4Addr,
    /// Transaction id, freshly random per session.
    xid: u32,
}

static STATE: Mutex<DhcpState> = Mutex::new(DhcpState {
    ip_tmp: Ipv4Addr::UNSPECIFIED,
    server: Ipv4Addr::BROADCAST,
    xid: 0,
});

// =============================================================================
// Message construction
// =============================================================================

/// Build and send one BOOTREQUEST carrying `msg_type`.
fn send(msg_type: u8, broadcast: bool) -> bool {
    let Some(id) = udp::new(SOCKET_DHCP) else {
        return false;
    };

    let (xid, server, ip_tmp) = {
        let st = STATE.lock();
        (st.xid, st.server, st.ip_tmp)
    };
    let mac = iface::mac_local(IfaceId::ETH);

    pool::with_mut(id, |b| {
        b.write_u8(BOOTREQUEST);
        b.write_u8(1); // htype: Ethernet
        b.write_u8(6); // hlen: 6-byte MAC
        b.write_u8(0); // hops
        b.write_u32(xid);
        b.write_u16(0); // secs
        if broadcast {
            b.write_u16(FLAGS_BROADCAST);
            b.write_ip(Ipv4Addr::UNSPECIFIED); // ciaddr
        } else {
            b.write_u16(0);
            b.write_ip(iface::ip_local(IfaceId::ETH));
        }
        b.write_ip(Ipv4Addr::UNSPECIFIED); // yiaddr
        b.write_ip(server); // siaddr
        b.write_ip(Ipv4Addr::UNSPECIFIED); // giaddr
        b.write_buf(mac.as_bytes());
        b.write_fill(0, 10); // rest of chaddr
        b.write_fill(0, 64 + 128); // sname + file
        b.write_u32(MAGIC_COOKIE);

        b.write_u8(OPTION_MSG_TYPE);
        b.write_u8(1);
        b.write_u8(msg_type);

        b.write_u8(OPTION_CLIENT_ID);
        b.write_u8(7);
        b.write_u8(1); // hardware type: Ethernet
        b.write_buf(mac.as_bytes());

        b.write_u8(OPTION_REQUESTED_IP);
        b.write_u8(4);
        b.write_ip(ip_tmp);

        b.write_u8(OPTION_PARAM_REQ_LIST);
        b.write_u8(3);
        b.write_u8(OPTION_SUBNET_MASK);
        b.write_u8(OPTION_ROUTER);
        b.write_u8(OPTION_DNS);

        b.write_u8(OPTION_END);
    });

    let sent = udp::send(id).is_ok();
    pool::release(id);
    sent
}

// =============================================================================
// Reply parsing
// =============================================================================

/// Validate a BOOTREPLY and harvest its fields. Returns the message
/// type from option 53.
fn parse(id: pool::BufId) -> Option<u8> {
    pool::with_mut(id, |b| {
        b.rewind();
        if b.size() < BOOTP_HEADER_LEN + 4 {
            return None;
        }

        let op = b.read_u8();
        b.skip(3); // htype, hlen, hops
        let xid = b.read_u32();
        b.skip(4); // secs, flags
        b.skip(4); // ciaddr
        let yiaddr = b.read_ip();
        b.skip(8); // siaddr, giaddr
        b.skip(16 + 64 + 128); // chaddr, sname, file
        let magic = b.read_u32();

        if op != BOOTREPLY || xid != STATE.lock().xid || magic != MAGIC_COOKIE {
            return None;
        }

        {
            let mut st = STATE.lock();
            st.ip_tmp = yiaddr;
            st.server = ipv4::source_addr(b);
        }

        let mut msg_type = None;
        while !b.is_eof() {
            let opt = b.read_u8();
            if opt == OPTION_END {
                break;
            }
            if opt == OPTION_PAD {
                continue;
            }
            let len = b.read_u8() as usize;
            match opt {
                OPTION_MSG_TYPE => {
                    msg_type = Some(b.read_u8());
                    b.skip(len.saturating_sub(1));
                }
                OPTION_SUBNET_MASK if len >= 4 => {
                    let mask = b.read_ip();
                    iface::set_netmask(IfaceId::ETH, mask);
                    b.skip(len - 4);
                }
                OPTION_ROUTER if len >= 4 => {
                    let gw = b.read_ip();
                    iface::set_gateway(IfaceId::ETH, gw);
                    b.skip(len - 4);
                }
                OPTION_DNS if len >= 4 => {
                    let dns = b.read_ip();
                    iface::set_dns(IfaceId::ETH, dns);
                    b.skip(len - 4);
                }
                _ => b.skip(len),
            }
        }
        msg_type
    })
    .flatten()
}

// =============================================================================
// Client sequence
// =============================================================================

/// Broadcast DHCPDISCOVER until a DHCPOFFER arrives.
pub fn discover() -> bool {
    for _ in 0..MAX_RETRIES {
        if !send(MSG_DISCOVER, true) {
            return false;
        }
        if udp::listen(SOCKET_DHCP, PORT_CLIENT, TIMEOUT_DISCOVER_MS) {
            if let Some(id) = udp::read(SOCKET_DHCP) {
                let msg = parse(id);
                pool::release(id);
                if msg == Some(MSG_OFFER) {
                    return true;
                }
            }
        }
    }
    false
}

/// Broadcast DHCPREQUEST until the server acknowledges.
pub fn request() -> bool {
    for _ in 0..MAX_RETRIES {
        if !send(MSG_REQUEST, true) {
            return false;
        }
        if udp::listen(SOCKET_DHCP, PORT_CLIENT, TIMEOUT_REQUEST_MS) {
            if let Some(id) = udp::read(SOCKET_DHCP) {
                let msg = parse(id);
                pool::release(id);
                if msg == Some(MSG_ACK) {
                    return true;
                }
            }
        }
    }
    false
}

/// Acquire a lease for the Ethernet interface.
///
/// Succeeds immediately when an address is already configured.
/// Otherwise runs DISCOVER then REQUEST over the dedicated socket and
/// commits the offered address on DHCPACK.
pub fn get_ip() -> bool {
    let eth = IfaceId::ETH;
    if !iface::ip_local(eth).is_unspecified() {
        return true;
    }

    udp::close(SOCKET_DHCP);
    if udp::open(SOCKET_DHCP, PORT_CLIENT, Ipv4Addr::BROADCAST, PORT_SERVER, eth).is_err() {
        return false;
    }

    {
        let mut st = STATE.lock();
        st.ip_tmp = Ipv4Addr::UNSPECIFIED;
        st.server = Ipv4Addr::BROADCAST;
        st.xid = rand::random();
    }

    if !discover() {
        return abandon();
    }

    // The offer recorded the server; reopen the socket for the
    // request round.
    udp::close(SOCKET_DHCP);
    if udp::open(SOCKET_DHCP, PORT_CLIENT, Ipv4Addr::BROADCAST, PORT_SERVER, eth).is_err() {
        return false;
    }

    if !request() {
        return abandon();
    }

    let leased = STATE.lock().ip_tmp;
    iface::set_ip_local(eth, leased);
    udp::close(SOCKET_DHCP);
    debug!("dhcp: leased {}", leased);
    true
}

fn abandon() -> bool {
    iface::set_ip_local(IfaceId::ETH, Ipv4Addr::UNSPECIFIED);
    udp::close(SOCKET_DHCP);
    false
}

/// Release the current lease and clear the interface configuration.
pub fn release_ip() -> bool {
    let eth = IfaceId::ETH;
    if iface::ip_local(eth).is_unspecified() {
        return true;
    }

    let server = STATE.lock().server;
    udp::close(SOCKET_DHCP);
    if udp::open(SOCKET_DHCP, PORT_CLIENT, server, PORT_SERVER, eth).is_err() {
        return false;
    }

    for _ in 0..3 {
        if !send(MSG_RELEASE, true) {
            break;
        }
        clock::sleep_ms(100);
    }

    udp::close(SOCKET_DHCP);
    iface::configure(
        eth,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
    );
    STATE.lock().server = Ipv4Addr::BROADCAST;
    true
}

/// Forget any in-flight transaction. For tests.
pub fn reset() {
    let mut st = STATE.lock();
    st.ip_tmp = Ipv4Addr::UNSPECIFIED;
    st.server = Ipv4Addr::BROADCAST;
    st.xid = 0;
}
